//! Whitelist/blacklist sensor filtering with globs, temperature scaling,
//! and sanity checks (spec section 4.9).

use globset::Glob;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone)]
enum Term {
    Exact(String),
    Glob(globset::GlobMatcher),
}

/// Parses the raw `SENSORS` env string and answers whether a given sensor
/// key should be kept, and how its reading should be scaled/sanity-checked.
pub struct SensorFilter {
    mode: Mode,
    terms: Vec<Term>,
    /// An explicitly empty `SENSORS` value means skip collection entirely.
    pub skip_collection: bool,
}

impl SensorFilter {
    pub fn parse(raw: Option<&str>) -> Self {
        let raw = match raw {
            None => {
                return Self { mode: Mode::Blacklist, terms: Vec::new(), skip_collection: false };
            }
            Some(r) if r.is_empty() => {
                return Self { mode: Mode::Blacklist, terms: Vec::new(), skip_collection: true };
            }
            Some(r) => r,
        };

        let (mode, body) = if let Some(stripped) = raw.strip_prefix('-') {
            (Mode::Blacklist, stripped)
        } else {
            (Mode::Whitelist, raw)
        };

        let terms = body
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .filter_map(|s| {
                if s.contains('*') {
                    Glob::new(s).ok().map(|g| Term::Glob(g.compile_matcher()))
                } else {
                    Some(Term::Exact(s.to_string()))
                }
            })
            .collect();

        Self { mode, terms, skip_collection: false }
    }

    /// §4.9 filtering semantics:
    /// - no entries configured → accept
    /// - exact match → accept iff whitelist
    /// - glob match → accept iff whitelist
    /// - otherwise → accept iff blacklist
    pub fn is_accepted(&self, key: &str) -> bool {
        if self.terms.is_empty() {
            return true;
        }
        let matched = self.terms.iter().any(|t| match t {
            Term::Exact(s) => s == key,
            Term::Glob(m) => m.is_match(key),
        });
        if matched {
            self.mode == Mode::Whitelist
        } else {
            self.mode == Mode::Blacklist
        }
    }
}

/// Scale a raw reading from drivers that report fractional units.
/// - `t > 1` → unchanged
/// - else try `100*t`; if in [15,95] use it; else try `1000*t`; if in
///   [15,95] use it; else default to `100*t`.
pub fn scale_temperature(t: f64) -> f64 {
    if t > 1.0 {
        return t;
    }
    let a = 100.0 * t;
    let b = 1000.0 * t;
    if (15.0..=95.0).contains(&a) {
        a
    } else if (15.0..=95.0).contains(&b) {
        b
    } else {
        a
    }
}

/// Drop samples outside a sane temperature range.
pub fn is_sane(temp_c: f64) -> bool {
    temp_c > 0.0 && temp_c < 200.0
}

/// Apply filter + scaling + sanity + dedup-renaming to a raw sensor read,
/// in the order the Sampler consumes sensors each cycle.
pub fn build_temperature_map(filter: &SensorFilter, raw: impl IntoIterator<Item = (String, f64)>) -> HashMap<String, f64> {
    let mut out: HashMap<String, f64> = HashMap::new();
    let mut seen_counts: HashMap<String, usize> = HashMap::new();
    for (key, value) in raw {
        if filter.skip_collection || !filter.is_accepted(&key) {
            continue;
        }
        let scaled = scale_temperature(value);
        if !is_sane(scaled) {
            continue;
        }
        let count = seen_counts.entry(key.clone()).or_insert(0);
        let final_key = if *count == 0 { key.clone() } else { format!("{key}_{count}") };
        *count += 1;
        out.insert(final_key, scaled);
    }
    out
}

/// Wraps a sensor read that may panic on some platforms (spec section 4.9 /
/// 7). Recovers from the panic, logs, and retries once per cycle before
/// giving up and returning `None`.
pub fn read_sensors_with_panic_guard<F>(mut read: F) -> Option<Vec<(String, f64)>>
where
    F: FnMut() -> Vec<(String, f64)>,
{
    for attempt in 0..2 {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut read));
        match result {
            Ok(v) => return Some(v),
            Err(_) => {
                warn!(attempt, "sensor read panicked; retrying");
            }
        }
    }
    warn!("sensor read panicked twice; omitting sensor section for this snapshot");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sensors_env_skips_collection() {
        let f = SensorFilter::parse(Some(""));
        assert!(f.skip_collection);
    }

    #[test]
    fn unset_accepts_everything() {
        let f = SensorFilter::parse(None);
        assert!(f.is_accepted("anything"));
    }

    #[test]
    fn scenario5_glob_whitelist() {
        let f = SensorFilter::parse(Some("core_*_temp,gpu_edge"));
        let raw = vec![
            ("core_0_temp".to_string(), 55.0),
            ("core_1_temp".to_string(), 60.0),
            ("nvme".to_string(), 70.0),
            ("gpu_edge".to_string(), 75.0),
        ];
        let map = build_temperature_map(&f, raw);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("core_0_temp"), Some(&55.0));
        assert_eq!(map.get("gpu_edge"), Some(&75.0));
        assert!(!map.contains_key("nvme"));
    }

    #[test]
    fn blacklist_rejects_matches_accepts_rest() {
        let f = SensorFilter::parse(Some("-nvme,acpi_*"));
        assert!(!f.is_accepted("nvme"));
        assert!(!f.is_accepted("acpi_thermal"));
        assert!(f.is_accepted("core_0"));
    }

    #[test]
    fn p6_whitelist_roundtrip_is_identity() {
        let f = SensorFilter::parse(Some("a,b,c"));
        let accepted: Vec<&str> = vec!["a", "b", "c"].into_iter().filter(|k| f.is_accepted(k)).collect();
        let f2 = SensorFilter::parse(Some(&accepted.join(",")));
        let accepted2: Vec<&str> = accepted.iter().copied().filter(|k| f2.is_accepted(k)).collect();
        assert_eq!(accepted, accepted2);
    }

    #[test]
    fn temperature_scaling_cases() {
        assert_eq!(scale_temperature(55.0), 55.0);
        assert_eq!(scale_temperature(0.55), 55.0);
        assert_eq!(scale_temperature(0.055), 55.0);
    }

    #[test]
    fn sanity_filter_drops_out_of_range() {
        assert!(!is_sane(0.0));
        assert!(!is_sane(200.0));
        assert!(is_sane(45.0));
    }

    #[test]
    fn duplicate_keys_get_suffixed() {
        let f = SensorFilter::parse(None);
        let raw = vec![("core".to_string(), 40.0), ("core".to_string(), 42.0)];
        let map = build_temperature_map(&f, raw);
        assert_eq!(map.get("core"), Some(&40.0));
        assert_eq!(map.get("core_1"), Some(&42.0));
    }

    #[test]
    fn panic_guard_recovers_and_retries() {
        let mut calls = 0;
        let result = read_sensors_with_panic_guard(|| {
            calls += 1;
            if calls < 2 {
                panic!("boom");
            }
            vec![("ok".to_string(), 40.0)]
        });
        assert_eq!(result, Some(vec![("ok".to_string(), 40.0)]));
    }

    #[test]
    fn panic_guard_gives_up_after_two_attempts() {
        let result: Option<Vec<(String, f64)>> = read_sensors_with_panic_guard(|| panic!("always"));
        assert_eq!(result, None);
    }
}
