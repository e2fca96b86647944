//! Aggregate network-rate baseline with counter-wrap/reset guard (spec
//! section 3 "NetBaseline" / section 4.1 edge cases / P4).

use std::collections::HashSet;
use std::time::Instant;

use crate::rate::CounterBaseline;
use crate::snapshot::round2;

/// Any per-second rate above this is treated as a counter wrap/reset
/// rather than a real measurement (spec section 3).
pub const GUARD_MIBPS: f64 = 10_000.0;

#[derive(Default)]
pub struct NetBaselines {
    sent: CounterBaseline,
    recv: CounterBaseline,
    pub accepted_interfaces: HashSet<String>,
}

pub struct NetRates {
    pub sent_mibps: Option<f64>,
    pub recv_mibps: Option<f64>,
}

impl NetBaselines {
    pub fn reinit_interfaces(&mut self, interfaces: HashSet<String>) {
        self.accepted_interfaces = interfaces;
    }

    /// Observe the current cycle's aggregate sent/recv byte counters (summed
    /// over the accepted interface set by the caller) and apply the guard.
    pub fn observe(&mut self, bytes_sent: u64, bytes_recv: u64, now: Instant) -> NetRates {
        let sent_outcome = self.sent.observe(bytes_sent, now);
        let recv_outcome = self.recv.observe(bytes_recv, now);

        let mut sent_mibps = sent_outcome.published_rate().map(|r| r / 1_048_576.0);
        let mut recv_mibps = recv_outcome.published_rate().map(|r| r / 1_048_576.0);

        let guard_tripped = sent_mibps.is_some_and(|v| v > GUARD_MIBPS) || recv_mibps.is_some_and(|v| v > GUARD_MIBPS);
        if guard_tripped {
            self.sent = CounterBaseline::default();
            self.recv = CounterBaseline::default();
            self.sent.observe(bytes_sent, now);
            self.recv.observe(bytes_recv, now);
            sent_mibps = None;
            recv_mibps = None;
        }

        NetRates { sent_mibps: sent_mibps.map(round2), recv_mibps: recv_mibps.map(round2) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn p4_guard_trips_above_threshold_and_reinits_baseline() {
        let mut b = NetBaselines::default();
        let t0 = Instant::now();
        b.observe(0, 0, t0);
        // 20,000 MiB/s over 1s => way above guard.
        let huge = 20_000u64 * 1_048_576;
        let rates = b.observe(huge, huge, t0 + Duration::from_secs(1));
        assert_eq!(rates.sent_mibps, None);
        assert_eq!(rates.recv_mibps, None);

        // Baseline reseeded to the huge value; next cycle computes normally off it.
        let next = huge + 5 * 1_048_576;
        let rates2 = b.observe(next, next, t0 + Duration::from_secs(2));
        assert_eq!(rates2.sent_mibps, Some(5.0));
    }

    #[test]
    fn normal_rate_under_guard_passes_through() {
        let mut b = NetBaselines::default();
        let t0 = Instant::now();
        b.observe(0, 0, t0);
        let ten_mib = 10u64 * 1_048_576;
        let rates = b.observe(ten_mib, ten_mib, t0 + Duration::from_secs(1));
        assert_eq!(rates.sent_mibps, Some(10.0));
        assert_eq!(rates.recv_mibps, Some(10.0));
    }
}
