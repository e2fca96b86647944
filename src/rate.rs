//! The universal counter→rate pattern (spec section 4.1), shared by
//! HostProbe disk/net baselines and ContainerManager per-container
//! baselines.
//!
//! ```text
//! Δt = now - t0
//! rate = (c - prev) / Δt
//! prev = c ; t0 = now
//! ```
//!
//! Edge cases:
//! - no baseline yet → emit zero, seed baseline (P2, no bootstrap burst)
//! - Δt <= 0 → skip entirely (no update, no emit)
//! - c < prev (wrap/reset/remount) → treat as reset: seed to new c, emit
//!   zero this cycle (P3)

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateOutcome {
    /// No prior baseline: a zero rate was emitted and the baseline seeded.
    Bootstrapped,
    /// `now <= prev_time`: no update performed, no rate emitted.
    Skipped,
    /// Counter decreased: reset detected, baseline reseeded, zero emitted.
    Reset,
    /// Normal case: a rate was computed.
    Computed(f64),
}

/// A single counter baseline: previous value and the instant it was observed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterBaseline {
    pub prev: u64,
    pub time: Option<Instant>,
}

impl CounterBaseline {
    /// Apply one new observation, mutating the baseline in place and
    /// returning the outcome for this cycle.
    pub fn observe(&mut self, value: u64, now: Instant) -> RateOutcome {
        let Some(prev_time) = self.time else {
            self.prev = value;
            self.time = Some(now);
            return RateOutcome::Bootstrapped;
        };

        if now <= prev_time {
            return RateOutcome::Skipped;
        }

        if value < self.prev {
            self.prev = value;
            self.time = Some(now);
            return RateOutcome::Reset;
        }

        let dt = now.duration_since(prev_time).as_secs_f64();
        let rate = (value.saturating_sub(self.prev)) as f64 / dt;
        self.prev = value;
        self.time = Some(now);
        RateOutcome::Computed(rate)
    }
}

impl RateOutcome {
    /// Rate to publish this cycle, rounded to two decimals at the
    /// publication boundary (never stored rounded).
    pub fn published_rate(self) -> Option<f64> {
        match self {
            RateOutcome::Bootstrapped | RateOutcome::Reset => Some(0.0),
            RateOutcome::Skipped => None,
            RateOutcome::Computed(r) => Some(crate::snapshot::round2(r)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn p2_first_observation_emits_zero_and_seeds() {
        let mut b = CounterBaseline::default();
        let now = Instant::now();
        let outcome = b.observe(1_000_000_000, now);
        assert_eq!(outcome, RateOutcome::Bootstrapped);
        assert_eq!(outcome.published_rate(), Some(0.0));
        assert_eq!(b.prev, 1_000_000_000);
    }

    #[test]
    fn p1_increasing_counter_yields_nonnegative_rate() {
        let mut b = CounterBaseline::default();
        let t0 = Instant::now();
        b.observe(1000, t0);
        let outcome = b.observe(2000, t0 + Duration::from_secs(1));
        match outcome {
            RateOutcome::Computed(r) => assert!(r >= 0.0),
            _ => panic!("expected computed rate"),
        }
    }

    #[test]
    fn skip_when_delta_t_not_positive() {
        let mut b = CounterBaseline::default();
        let t0 = Instant::now();
        b.observe(1000, t0);
        let outcome = b.observe(2000, t0);
        assert_eq!(outcome, RateOutcome::Skipped);
        assert_eq!(outcome.published_rate(), None);
        // baseline untouched
        assert_eq!(b.prev, 1000);
    }

    #[test]
    fn p3_counter_decrease_resets_and_emits_zero() {
        let mut b = CounterBaseline::default();
        let t0 = Instant::now();
        b.observe(1_000_000_000, t0);
        let outcome = b.observe(500, t0 + Duration::from_secs(5));
        assert_eq!(outcome, RateOutcome::Reset);
        assert_eq!(outcome.published_rate(), Some(0.0));
        assert_eq!(b.prev, 500);
    }

    #[test]
    fn scenario4_counter_reset_then_real_rate() {
        let mut b = CounterBaseline::default();
        let t0 = Instant::now();
        b.observe(1_000_000_000, t0); // seed
        let reset_outcome = b.observe(500, t0 + Duration::from_secs(5));
        assert_eq!(reset_outcome.published_rate(), Some(0.0));

        let next_bytes = 500 + 5 * 1_048_576; // 5 MiB/s for 5s
        let real_outcome = b.observe(next_bytes, t0 + Duration::from_secs(10));
        match real_outcome {
            RateOutcome::Computed(r) => {
                let mibps = crate::snapshot::round2(r / 1_048_576.0);
                assert_eq!(mibps, 5.0);
            }
            _ => panic!("expected computed rate"),
        }
    }
}
