//! CPU/mem/disk/net/sensor primitives (spec section 4.2), built directly on
//! `sysinfo` the way the teacher's `state.rs`/`metrics.rs` do.

pub mod disk;
pub mod net;

use std::collections::{HashMap, HashSet};

use sysinfo::{Components, Disks, Networks, System};

pub struct HostProbe {
    pub sys: System,
    pub components: Components,
    pub disks: Disks,
    pub networks: Networks,
}

impl HostProbe {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            components: Components::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    pub fn refresh_cpu_and_mem(&mut self) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
    }

    pub fn cpu_percent(&self) -> f64 {
        self.sys.global_cpu_usage() as f64
    }

    pub fn virtual_memory(&self) -> VirtualMemory {
        VirtualMemory {
            total: self.sys.total_memory(),
            used: self.sys.used_memory(),
            free: self.sys.free_memory(),
            buffers: 0, // sysinfo does not split buffers from cache on most platforms
            cached: self.sys.total_memory().saturating_sub(self.sys.available_memory()).saturating_sub(self.sys.used_memory()).min(self.sys.total_memory()),
            shared: 0,
            swap_total: self.sys.total_swap(),
            swap_used: self.sys.used_swap(),
        }
    }

    pub fn host_uptime(&self) -> u64 {
        System::uptime()
    }

    pub fn kernel_version(&self) -> String {
        System::kernel_version().unwrap_or_else(|| "unknown".to_string())
    }

    pub fn cpu_info(&self) -> CpuInfo {
        let model = self.sys.cpus().first().map(|c| c.brand().to_string()).unwrap_or_else(|| "unknown".to_string());
        let threads = self.sys.cpus().len();
        let physical = System::physical_core_count().unwrap_or(threads);
        // LXC observation: kernel reports the container's limit as threads; if
        // threads < cores, trust threads as the effective core count.
        let cores = if threads < physical { threads } else { physical };
        CpuInfo { model, core_count: cores, thread_count: threads }
    }

    pub fn sensors(&mut self) -> Vec<(String, f64)> {
        self.components.refresh(false);
        self.components
            .iter()
            .map(|c| (c.label().to_string(), c.temperature().unwrap_or(f64::NAN as f32) as f64))
            .filter(|(_, t)| !t.is_nan())
            .collect()
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub shared: u64,
    pub swap_total: u64,
    pub swap_used: u64,
}

impl VirtualMemory {
    /// `htop` memory policy (spec section 4.1 step 4): cacheBuff =
    /// cached + buffers - shared; used = total - (free + cacheBuff).
    pub fn htop_used(&self) -> u64 {
        let cache_buff = (self.cached + self.buffers).saturating_sub(self.shared);
        self.total.saturating_sub(self.free.saturating_add(cache_buff))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CpuInfo {
    pub model: String,
    pub core_count: usize,
    pub thread_count: usize,
}

/// §4.2 "interface filtering": drop well-known virtual/loopback prefixes and
/// any interface silent at initialization; an explicit whitelist overrides
/// all heuristics.
pub fn filter_interfaces<'a>(
    names_with_bytes: impl IntoIterator<Item = (&'a str, u64, u64)>,
    explicit_whitelist: &[String],
) -> HashSet<String> {
    if !explicit_whitelist.is_empty() {
        return explicit_whitelist.iter().cloned().collect();
    }
    const DROP_PREFIXES: &[&str] = &["lo", "docker", "br-", "veth"];
    names_with_bytes
        .into_iter()
        .filter(|(name, sent, recv)| {
            let dropped_prefix = DROP_PREFIXES.iter().any(|p| name.starts_with(p));
            !dropped_prefix && (*sent > 0 || *recv > 0)
        })
        .map(|(name, _, _)| name.to_string())
        .collect()
}

/// §4.2 ZFS ARC detection: presence of an arcstats procfs file.
#[cfg(target_os = "linux")]
pub fn zfs_arc_bytes() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/spl/kstat/zfs/arcstats").ok()?;
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("size") {
            let _type = parts.next();
            let value = parts.next()?;
            return value.parse::<u64>().ok();
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn zfs_arc_bytes() -> Option<u64> {
    None
}

/// Per-device read/write byte counters (spec section 4.2 `diskCounters`).
/// `sysinfo`'s `Disks` type exposes capacity but no I/O counters, so this
/// reads `/proc/diskstats` directly the way `zfs_arc_bytes` reads arcstats.
/// Sector counts (fields 6 and 10, 1-indexed) are in 512-byte units.
#[cfg(target_os = "linux")]
pub fn disk_io_bytes() -> HashMap<String, (u64, u64)> {
    let mut out = HashMap::new();
    let Ok(contents) = std::fs::read_to_string("/proc/diskstats") else { return out };
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2].to_string();
        let read_sectors: u64 = fields[5].parse().unwrap_or(0);
        let write_sectors: u64 = fields[9].parse().unwrap_or(0);
        out.insert(name, (read_sectors.saturating_mul(512), write_sectors.saturating_mul(512)));
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub fn disk_io_bytes() -> HashMap<String, (u64, u64)> {
    HashMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_whitelist_overrides_heuristics() {
        let names = vec![("lo", 0u64, 0u64), ("eth0", 10, 20)];
        let whitelist = vec!["lo".to_string()];
        let accepted = filter_interfaces(names, &whitelist);
        assert_eq!(accepted, ["lo".to_string()].into_iter().collect());
    }

    #[test]
    fn interface_heuristic_drops_virtual_and_silent() {
        let names = vec![("lo", 0u64, 0u64), ("docker0", 5, 5), ("br-abcdef", 5, 5), ("veth123", 5, 5), ("eth0", 0u64, 0u64), ("eth1", 100, 200)];
        let accepted = filter_interfaces(names, &[]);
        assert_eq!(accepted, ["eth1".to_string()].into_iter().collect());
    }

    #[test]
    fn lxc_thread_count_policy_prefers_threads_when_lower() {
        // Simulated: threads(2) < physical(8) => use threads as core count.
        let threads = 2usize;
        let physical = 8usize;
        let cores = if threads < physical { threads } else { physical };
        assert_eq!(cores, 2);
    }

    #[test]
    fn htop_memory_policy() {
        let vm = VirtualMemory { total: 1000, used: 0, free: 200, buffers: 100, cached: 300, shared: 50, swap_total: 0, swap_used: 0 };
        // cacheBuff = 300+100-50 = 350; used = 1000-(200+350) = 450
        assert_eq!(vm.htop_used(), 450);
    }
}
