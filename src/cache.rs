//! Lease-based snapshot memoization (spec section 4.5).
//!
//! Not synchronized by its own lock: it is only ever touched from within
//! `Sampler::sample`, which already holds the Sampler's exclusive lock
//! (spec section 5).

use std::time::{Duration, Instant};

use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Absent,
    Primary,
    PrimaryStale,
    ServedFromCache,
}

pub struct SessionCache {
    buf: Snapshot,
    primary_id: Option<String>,
    primary_last_seen: Option<Instant>,
    lease_dur: Duration,
}

impl SessionCache {
    pub fn new(lease_dur: Duration) -> Self {
        Self { buf: Snapshot::default(), primary_id: None, primary_last_seen: None, lease_dur }
    }

    pub fn with_default_lease() -> Self {
        Self::new(Duration::from_secs(69))
    }

    /// Returns `(cached, state)`. `cached == true` means the caller should
    /// serve `snapshot()` as-is without a fresh probe.
    pub fn get(&mut self, caller_id: &str) -> (bool, LeaseState) {
        self.get_at(caller_id, Instant::now())
    }

    fn get_at(&mut self, caller_id: &str, now: Instant) -> (bool, LeaseState) {
        match &self.primary_id {
            None => {
                self.primary_id = Some(caller_id.to_string());
                self.primary_last_seen = Some(now);
                (false, LeaseState::Primary)
            }
            Some(primary) if primary == caller_id => {
                let seen = self.primary_last_seen.expect("primary set without timestamp");
                if now.duration_since(seen) <= self.lease_dur {
                    self.primary_last_seen = Some(now);
                    (false, LeaseState::Primary)
                } else {
                    // Lease expired: demote, then recurse to re-evaluate as a fresh caller.
                    self.primary_id = None;
                    self.primary_last_seen = None;
                    self.get_at(caller_id, now)
                }
            }
            Some(_) => {
                let seen = self.primary_last_seen.expect("primary set without timestamp");
                if now.duration_since(seen) <= self.lease_dur {
                    (true, LeaseState::ServedFromCache)
                } else {
                    self.primary_id = Some(caller_id.to_string());
                    self.primary_last_seen = Some(now);
                    (false, LeaseState::Primary)
                }
            }
        }
    }

    /// Copy into the reusable buffer; never replaces the allocation so that
    /// a reference taken earlier in the same critical section observes the
    /// final value once `set` completes.
    pub fn set(&mut self, snapshot: Snapshot) {
        self.buf = snapshot;
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mk(lease_secs: u64) -> SessionCache {
        SessionCache::new(Duration::from_secs(lease_secs))
    }

    #[test]
    fn first_ever_caller_becomes_primary_no_cache() {
        let mut c = mk(69);
        let (cached, state) = c.get("A");
        assert!(!cached);
        assert_eq!(state, LeaseState::Primary);
    }

    #[test]
    fn p5_secondary_within_lease_serves_cached() {
        let mut c = mk(69);
        let now = Instant::now();
        let (cached_a, _) = c.get_at("A", now);
        assert!(!cached_a);
        let (cached_b, state_b) = c.get_at("B", now + Duration::from_secs(5));
        assert!(cached_b);
        assert_eq!(state_b, LeaseState::ServedFromCache);
    }

    #[test]
    fn primary_within_lease_forces_recompute() {
        let mut c = mk(69);
        let now = Instant::now();
        c.get_at("A", now);
        let (cached, state) = c.get_at("A", now + Duration::from_secs(10));
        assert!(!cached);
        assert_eq!(state, LeaseState::Primary);
    }

    #[test]
    fn scenario3_primary_expiry_promotes_new_caller() {
        let mut c = mk(69);
        let now = Instant::now();
        c.get_at("A", now);
        let (cached, state) = c.get_at("B", now + Duration::from_secs(70));
        assert!(!cached);
        assert_eq!(state, LeaseState::Primary);

        // A, now stale, should read B's cached snapshot on next touch within lease.
        let (cached_a, state_a) = c.get_at("A", now + Duration::from_secs(75));
        assert!(cached_a);
        assert_eq!(state_a, LeaseState::ServedFromCache);
    }

    #[test]
    fn set_never_reallocates_buffer_identity() {
        let mut c = mk(69);
        c.get("A");
        c.set(Snapshot::default());
        let ptr_before = c.snapshot() as *const Snapshot;
        c.set(Snapshot::default());
        let ptr_after = c.snapshot() as *const Snapshot;
        assert_eq!(ptr_before, ptr_after);
    }
}
