//! Filesystem discovery and per-mount rate computation (spec section 4.2).

use std::collections::HashMap;
use std::time::Instant;

use crate::rate::CounterBaseline;
use crate::snapshot::{round2, FsStats};

#[derive(Debug, Clone)]
pub struct PartitionFacts {
    pub device: String,
    pub mountpoint: String,
}

/// Resolve which partition is the "root" device to report whole-disk stats
/// for (spec section 4.2 "Filesystem discovery").
///
/// 1. configured `filesystem` matches a partition's device suffix or
///    mountpoint → that partition.
/// 2. else fall back: mountpoint `/` with any matching device; else a
///    container heuristic (non-`mapper` `/dev/...` source for `/etc/hosts`
///    implies the host root device).
/// 3. always include mounts under `/extra-filesystems/*` and any names in
///    `extraFs`.
/// 4. if no root device matched but an I/O counter exists for the
///    configured name, use it; else pick the device with the most read
///    bytes as a best-effort root I/O source.
/// 5. drop entries with no resolvable mountpoint.
pub fn resolve_root_device(
    configured: Option<&str>,
    partitions: &[PartitionFacts],
    container_root_device_hint: Option<&str>,
    io_read_bytes: &HashMap<String, u64>,
) -> Option<PartitionFacts> {
    if let Some(cfg) = configured {
        if let Some(p) = partitions.iter().find(|p| p.device.ends_with(cfg) || p.mountpoint == cfg) {
            return Some(p.clone());
        }
    }

    if let Some(p) = partitions.iter().find(|p| p.mountpoint == "/") {
        return Some(p.clone());
    }

    if let Some(hint) = container_root_device_hint {
        if !hint.contains("mapper") {
            if let Some(p) = partitions.iter().find(|p| p.device == hint) {
                return Some(p.clone());
            }
        }
    }

    if let Some(cfg) = configured {
        if io_read_bytes.contains_key(cfg) {
            return Some(PartitionFacts { device: cfg.to_string(), mountpoint: String::new() });
        }
    }

    io_read_bytes
        .iter()
        .max_by_key(|(_, bytes)| **bytes)
        .map(|(dev, _)| PartitionFacts { device: dev.clone(), mountpoint: String::new() })
}

/// Always-included extra mounts: anything under `/extra-filesystems/*` plus
/// any mountpoint named in `extraFs`.
pub fn extra_mounts<'a>(all_mountpoints: impl IntoIterator<Item = &'a str>, extra_fs: &[String]) -> Vec<String> {
    all_mountpoints
        .into_iter()
        .filter(|mp| mp.starts_with("/extra-filesystems/") || extra_fs.iter().any(|e| e == mp))
        .map(|s| s.to_string())
        .collect()
}

/// Per-mount I/O baseline holder. Owns the rate baseline; the Sampler is
/// the only writer.
#[derive(Default)]
pub struct DiskBaselines {
    entries: HashMap<String, (CounterBaseline, CounterBaseline)>, // (read, write)
}

impl DiskBaselines {
    /// Update one mount's stats from a successful probe. Returns a filled
    /// `FsStats` with this cycle's rates.
    pub fn observe_ok(&mut self, mountpoint: &str, root: bool, total_gib: f64, used_gib: f64, read_bytes: u64, write_bytes: u64, now: Instant) -> FsStats {
        let (read_b, write_b) = self.entries.entry(mountpoint.to_string()).or_default();
        let read_rate = read_b.observe(read_bytes, now).published_rate().unwrap_or(0.0);
        let write_rate = write_b.observe(write_bytes, now).published_rate().unwrap_or(0.0);

        FsStats {
            root,
            mountpoint: mountpoint.to_string(),
            disk_total_gib: total_gib,
            disk_used_gib: used_gib,
            read_mibps: round2(read_rate / 1_048_576.0),
            write_mibps: round2(write_rate / 1_048_576.0),
            total_read_bytes: read_b.prev,
            total_write_bytes: write_b.prev,
            time: Some(now),
        }
    }

    /// A disk usage probe failed (likely remount): zero the baseline fields
    /// so the next successful probe reseeds them without a fabricated rate.
    pub fn observe_failed(&mut self, mountpoint: &str) -> FsStats {
        self.entries.remove(mountpoint);
        FsStats { root: false, mountpoint: mountpoint.to_string(), ..Default::default() }
    }

    pub fn evict_missing(&mut self, present_mountpoints: &std::collections::HashSet<String>) {
        self.entries.retain(|mp, _| present_mountpoints.contains(mp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn facts(device: &str, mountpoint: &str) -> PartitionFacts {
        PartitionFacts { device: device.to_string(), mountpoint: mountpoint.to_string() }
    }

    #[test]
    fn configured_device_suffix_wins() {
        let partitions = vec![facts("/dev/sda1", "/boot"), facts("/dev/nvme0n1p2", "/")];
        let resolved = resolve_root_device(Some("nvme0n1p2"), &partitions, None, &HashMap::new());
        assert_eq!(resolved.unwrap().mountpoint, "/");
    }

    #[test]
    fn falls_back_to_root_mountpoint() {
        let partitions = vec![facts("/dev/sda1", "/boot"), facts("/dev/sda2", "/")];
        let resolved = resolve_root_device(None, &partitions, None, &HashMap::new());
        assert_eq!(resolved.unwrap().device, "/dev/sda2");
    }

    #[test]
    fn container_heuristic_skips_mapper_devices() {
        let partitions = vec![facts("/dev/mapper/root", "/x")];
        let resolved = resolve_root_device(None, &partitions, Some("/dev/mapper/root"), &HashMap::new());
        assert!(resolved.is_none());
    }

    #[test]
    fn best_effort_picks_highest_read_bytes() {
        let mut io = HashMap::new();
        io.insert("sda".to_string(), 100u64);
        io.insert("nvme0n1".to_string(), 5000u64);
        let resolved = resolve_root_device(None, &[], None, &io);
        assert_eq!(resolved.unwrap().device, "nvme0n1");
    }

    #[test]
    fn extra_mounts_include_namespace_and_configured() {
        let mounts = vec!["/", "/extra-filesystems/data1", "/mnt/backup"];
        let extras = extra_mounts(mounts, &["/mnt/backup".to_string()]);
        assert_eq!(extras.len(), 2);
        assert!(extras.contains(&"/extra-filesystems/data1".to_string()));
        assert!(extras.contains(&"/mnt/backup".to_string()));
    }

    #[test]
    fn failed_probe_zeroes_baseline_then_reseeds() {
        let mut b = DiskBaselines::default();
        let t0 = Instant::now();
        let s1 = b.observe_ok("/", true, 100.0, 50.0, 1000, 2000, t0);
        assert_eq!(s1.read_mibps, 0.0); // bootstrap

        let failed = b.observe_failed("/");
        assert_eq!(failed.total_read_bytes, 0);
        assert_eq!(failed.total_write_bytes, 0);

        // Next successful probe reseeds without a fabricated rate.
        let s2 = b.observe_ok("/", true, 100.0, 51.0, 5000, 6000, t0 + Duration::from_secs(5));
        assert_eq!(s2.read_mibps, 0.0);
    }
}
