//! Container daemon response DTOs and per-container baseline state
//! (spec section 3 "ContainerStats" / section 4.3).

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Deserialize;

/// One entry from `GET /containers/json?all=1`.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Mounts", default)]
    pub mounts: Vec<DaemonMount>,
    #[serde(rename = "Labels", default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonMount {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Destination", default)]
    pub destination: String,
}

/// One entry from `GET /containers/{id}/json` (only the fields we need).
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonContainerInspect {
    #[serde(rename = "State", default)]
    pub state: DaemonInspectState,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonInspectState {
    #[serde(rename = "StartedAt", default)]
    pub started_at: String,
    #[serde(rename = "FinishedAt", default)]
    pub finished_at: String,
    #[serde(rename = "Health", default)]
    pub health: Option<DaemonHealth>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonHealth {
    #[serde(rename = "Status", default)]
    pub status: String,
}

/// Response shape from `/containers/{id}/stats?stream=0&one-shot=1`.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonStatsOneShot {
    pub read: String,
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkIoStats>,
    #[serde(default)]
    pub blkio_stats: BlkioStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub stats: MemoryStatsInner,
    /// Windows daemon path.
    #[serde(default)]
    pub private_working_set: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStatsInner {
    #[serde(default)]
    pub inactive_file: Option<u64>,
    #[serde(default)]
    pub cache: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkIoStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlkioStats {
    #[serde(default, rename = "io_service_bytes_recursive")]
    pub io_service_bytes_recursive: Vec<BlkioEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlkioEntry {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: u64,
}

/// `/system/df` volume sizes (bytes, converted to MiB by the caller).
#[derive(Debug, Clone, Deserialize)]
pub struct SystemDf {
    #[serde(default)]
    pub volumes: Vec<DfVolume>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DfVolume {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "UsageData", default)]
    pub usage_data: Option<DfUsageData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DfUsageData {
    #[serde(rename = "Size", default)]
    pub size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonVersion {
    #[serde(rename = "ApiVersion", default)]
    pub api_version: String,
    #[serde(rename = "Version", default)]
    pub version: String,
}

impl DaemonVersion {
    /// Major version ≤ 24 hits a known one-shot-stats-under-concurrency bug
    /// (spec section 4.3 "Daemon-version quirk").
    pub fn is_buggy_under_concurrency(&self) -> bool {
        self.version
            .split('.')
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .map(|major| major <= 24)
            .unwrap_or(true) // unknown version: assume the worse case
    }
}

/// Per-container baseline the Sampler owns exclusively between cycles.
#[derive(Debug, Clone, Default)]
pub struct ContainerBaseline {
    pub prev_cpu: Option<(u64, u64)>, // (total_usage, system_usage)
    pub prev_net: Option<(u64, u64)>, // (sent, recv)
    pub prev_disk: Option<(u64, u64)>, // (read, write)
    pub prev_read: Option<Instant>,
    pub initialized: bool,
}
