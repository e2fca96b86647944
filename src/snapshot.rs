//! Wire types sent to a hub. Keep this module minimal and stable — it
//! defines the snapshot wire format (spec section 6: newline-delimited JSON).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level object a hub receives from one `Sampler::sample` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub info: Info,
    pub stats: Stats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerStats>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gpus: BTreeMap<String, GpuStats>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub smart: BTreeMap<String, SmartStats>,
}

/// Static-ish host facts plus derived instantaneous values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Info {
    pub hostname: String,
    pub kernel_version: String,
    pub cpu_model: String,
    pub core_count: usize,
    pub thread_count: usize,
    pub agent_version: String,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub dashboard_temp: Option<f64>,
    pub uptime_secs: u64,
    pub bandwidth_mibps: f64,
    pub podman: bool,
}

/// Gauge values for the current cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub cpu_pct: f64,
    pub mem_total_gib: f64,
    pub mem_used_gib: f64,
    pub mem_buff_cache_gib: f64,
    pub mem_zfs_arc_gib: Option<f64>,
    pub swap_total_gib: f64,
    pub swap_used_gib: f64,
    pub disk_total_gib: f64,
    pub disk_used_gib: f64,
    pub disk_pct: f64,
    pub disk_read_mibps: f64,
    pub disk_write_mibps: f64,
    pub net_sent_mibps: Option<f64>,
    pub net_recv_mibps: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub filesystems: BTreeMap<String, FsStats>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub temperatures: BTreeMap<String, f64>,
}

/// Per-mount stats plus baseline fields owned exclusively by the Sampler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsStats {
    pub root: bool,
    pub mountpoint: String,
    pub disk_total_gib: f64,
    pub disk_used_gib: f64,
    pub read_mibps: f64,
    pub write_mibps: f64,

    /// Baseline fields. Zeroed when a probe fails (likely remount); the next
    /// successful probe reseeds them without fabricating a rate.
    #[serde(skip)]
    pub total_read_bytes: u64,
    #[serde(skip)]
    pub total_write_bytes: u64,
    #[serde(skip)]
    pub time: Option<std::time::Instant>,
}

/// Per-agent network counter baseline plus the accepted-interface set.
#[derive(Debug, Clone, Default)]
pub struct NetBaseline {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub time: Option<std::time::Instant>,
    pub accepted_interfaces: std::collections::HashSet<String>,
}

/// One container's published stats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub status: String,
    pub health: Option<String>,
    pub project: Option<String>,
    pub cpu_pct: f64,
    pub mem_mib: f64,
    pub network_sent_mibps: f64,
    pub network_recv_mibps: f64,
    pub disk_read_mibps: f64,
    pub disk_write_mibps: f64,
    pub uptime_sec: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, f64>,
}

/// One GPU device's published stats, and the accumulators the collector
/// maintains between reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuStats {
    pub name: String,
    pub temperature: Option<f64>,
    pub memory_used_mib: f64,
    pub memory_total_mib: f64,
    pub usage_pct: f64,
    pub power_watts: f64,

    #[serde(skip)]
    pub usage_sum: f64,
    #[serde(skip)]
    pub power_sum: f64,
    #[serde(skip)]
    pub count: u64,
}

impl GpuStats {
    /// Apply one new sample from the subprocess parser: overwrite the
    /// latest-value fields, accumulate the averaged ones.
    pub fn accumulate(&mut self, name: &str, temp: Option<f64>, mem_used: f64, mem_total: f64, usage: f64, power: f64) {
        self.name = name.to_string();
        self.temperature = temp;
        self.memory_used_mib = mem_used;
        self.memory_total_mib = mem_total;
        self.usage_sum += usage;
        self.power_sum += power;
        self.count += 1;
    }

    /// Compute averages for this read and reset `count` to 1 (not 0) so a
    /// stale entry with no new sample still reports its last average.
    pub fn read_and_decay(&mut self) -> GpuStats {
        let count = self.count.max(1) as f64;
        self.usage_pct = round2(self.usage_sum / count);
        self.power_watts = round2(self.power_sum / count);
        let out = self.clone();
        self.usage_sum = self.usage_pct;
        self.power_sum = self.power_watts;
        self.count = 1;
        out
    }
}

/// Round to two decimal places at publication time; baselines are never
/// stored rounded.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One disk's SMART facts, normalized from either the SATA or NVMe
/// `smartctl --json` response shape into a common attribute list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartStats {
    pub device: String,
    pub model: String,
    pub serial: String,
    pub kind: String,
    pub health_passed: bool,
    pub temperature: Option<f64>,
    pub power_on_hours: Option<u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, i64>,
}
