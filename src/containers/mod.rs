//! Bounded-concurrency fan-out over the container daemon's HTTP API (spec
//! section 4.3).

pub mod client;
pub mod types;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use crate::snapshot::{round2, ContainerStats};
use client::DaemonClient;
use types::{ContainerBaseline, DaemonContainerInspect, DaemonContainerSummary, DaemonStatsOneShot, DaemonVersion, SystemDf};

const DEFAULT_CONCURRENCY: usize = 5;

pub struct ContainerManager {
    client: Arc<DaemonClient>,
    podman: bool,
    exclude_patterns: Vec<String>,
    concurrency: usize,
    /// Guards the id→baseline map (spec section 5
    /// "ContainerManager.containerStatsMutex"). Workers hold it only to
    /// insert/mutate one entry.
    baselines: Arc<Mutex<HashMap<String, ContainerBaseline>>>,
    daemon_version_good: Arc<AtomicBool>,
}

pub struct CollectedContainers {
    pub stats: Vec<ContainerStats>,
    pub volume_to_containers: BTreeMap<String, Vec<String>>,
}

impl ContainerManager {
    /// `events` is the small sink interface from design note section 9
    /// ("Cyclic ownership"): the manager reports the podman flag outward
    /// without holding a back-pointer to the full agent. `timeout` overrides
    /// the default 2.1s per-request deadline (spec section 6 `DOCKER_TIMEOUT`).
    pub fn new(socket_path: PathBuf, exclude_patterns: Vec<String>, timeout: Option<std::time::Duration>, events: Arc<dyn crate::agent::AgentEvents>) -> Self {
        let client = Arc::new(match timeout {
            Some(t) => DaemonClient::with_timeout(socket_path, t),
            None => DaemonClient::new(socket_path),
        });
        let podman = client.is_podman();
        events.set_podman_detected(podman);
        Self {
            client,
            podman,
            exclude_patterns,
            concurrency: DEFAULT_CONCURRENCY,
            baselines: Arc::new(Mutex::new(HashMap::new())),
            daemon_version_good: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_podman(&self) -> bool {
        self.podman
    }

    pub async fn collect(&mut self) -> CollectedContainers {
        let version = self.client.get_json::<DaemonVersion>("/version").await.ok();
        // Podman mode unconditionally enables concurrency regardless of the
        // version quirk gate (spec section 4.3 "Podman mode").
        let good = self.podman || version.as_ref().map(|v| !v.is_buggy_under_concurrency()).unwrap_or(false);
        self.daemon_version_good.store(good, Ordering::Relaxed);

        let summaries = match self.client.get_json::<Vec<DaemonContainerSummary>>("/containers/json?all=1").await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "container list fetch failed, skipping container section this cycle");
                return CollectedContainers { stats: Vec::new(), volume_to_containers: BTreeMap::new() };
            }
        };

        let (volume_to_containers, surviving) = partition_containers(summaries, &self.exclude_patterns);

        let volume_sizes_mib = Arc::new(self.fetch_volume_sizes().await);

        let effective_concurrency = if self.daemon_version_good.load(Ordering::Relaxed) {
            self.concurrency.min(surviving.len().max(1))
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(effective_concurrency));

        let present_ids: HashSet<String> = surviving.iter().map(|(id, _, _)| id.clone()).collect();

        let results = stream::iter(surviving.into_iter().map(|(id, name, summary)| {
            let client = self.client.clone();
            let baselines = self.baselines.clone();
            let sem = semaphore.clone();
            let sizes = volume_sizes_mib.clone();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                collect_one(&client, &baselines, id, name, summary, &sizes).await
            }
        }))
        .buffer_unordered(effective_concurrency)
        .collect::<Vec<_>>()
        .await;

        let mut stats: Vec<ContainerStats> = Vec::new();
        let mut failed_ids: Vec<(String, String, DaemonContainerSummary)> = Vec::new();
        for r in results {
            match r {
                WorkerOutcome::Ok(s) => stats.push(s),
                WorkerOutcome::Failed(id, name, summary) => failed_ids.push((id, name, summary)),
            }
        }

        // Retry once-failed containers sequentially when the daemon is on
        // the buggy-under-concurrency version (spec section 4.3).
        if !self.daemon_version_good.load(Ordering::Relaxed) {
            for (id, name, summary) in failed_ids {
                if let WorkerOutcome::Ok(s) = collect_one(&self.client, &self.baselines, id, name, summary, &volume_sizes_mib).await {
                    stats.push(s);
                }
            }
        }

        // Evict baseline entries for container ids not present this cycle.
        self.baselines.lock().await.retain(|id, _| present_ids.contains(id));

        CollectedContainers { stats, volume_to_containers }
    }

    async fn fetch_volume_sizes(&self) -> HashMap<String, f64> {
        match self.client.get_json::<SystemDf>("/system/df").await {
            Ok(df) => df
                .volumes
                .into_iter()
                .filter_map(|v| v.usage_data.map(|u| (v.name, u.size.max(0) as f64 / 1_048_576.0)))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }
}

/// Steps 2–3 of the collect algorithm (spec section 4.3): build the
/// volume→containers map from the *full* decoded list, then apply name-prefix
/// exclusion. The map is built first so a container's mounts are recorded
/// regardless of whether `CONTAINER_EXCLUDE` later drops it from `surviving`.
fn partition_containers(summaries: Vec<DaemonContainerSummary>, exclude_patterns: &[String]) -> (BTreeMap<String, Vec<String>>, Vec<(String, String, DaemonContainerSummary)>) {
    let mut volume_to_containers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut surviving: Vec<(String, String, DaemonContainerSummary)> = Vec::new();
    for summary in summaries {
        let short_id: String = summary.id.chars().take(12).collect();
        let name = summary.names.first().map(|n| n.trim_start_matches('/').to_string()).unwrap_or_else(|| short_id.clone());

        for mount in &summary.mounts {
            if let Some(vol_name) = &mount.name {
                volume_to_containers.entry(vol_name.clone()).or_default().push(short_id.clone());
            }
        }

        if exclude_patterns.iter().any(|p| name.contains(p.as_str())) {
            continue;
        }

        surviving.push((short_id, name, summary));
    }
    (volume_to_containers, surviving)
}

enum WorkerOutcome {
    Ok(ContainerStats),
    Failed(String, String, DaemonContainerSummary),
}

async fn collect_one(
    client: &DaemonClient,
    baselines: &Mutex<HashMap<String, ContainerBaseline>>,
    short_id: String,
    name: String,
    summary: DaemonContainerSummary,
    volume_sizes_mib: &HashMap<String, f64>,
) -> WorkerOutcome {
    let inspect = client.get_json::<DaemonContainerInspect>(&format!("/containers/{short_id}/json")).await.ok();
    let health = inspect.as_ref().and_then(|i| i.state.health.as_ref()).map(|h| h.status.clone());
    let project = summary.labels.get("com.docker.compose.project").cloned();

    let status = summary.state.clone();
    if status != "running" {
        let stats = ContainerStats {
            id: short_id,
            name,
            status,
            health,
            project,
            uptime_sec: 0,
            ..Default::default()
        };
        return WorkerOutcome::Ok(stats);
    }

    let one_shot = match client.get_json::<DaemonStatsOneShot>(&format!("/containers/{short_id}/stats?stream=0&one-shot=1")).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, id = %short_id, "container stats fetch failed");
            return WorkerOutcome::Failed(short_id, name, summary);
        }
    };

    let now = Instant::now();
    let mut guard = baselines.lock().await;
    let baseline = guard.entry(short_id.clone()).or_default();

    let total_usage = one_shot.cpu_stats.cpu_usage.total_usage;
    let system_usage = one_shot.cpu_stats.system_cpu_usage;
    let cpu_pct = if let Some((prev_total, prev_system)) = baseline.prev_cpu {
        let delta_cpu = total_usage.saturating_sub(prev_total) as f64;
        let delta_system = system_usage.saturating_sub(prev_system) as f64;
        if delta_system > 0.0 { (delta_cpu / delta_system) * 100.0 } else { 0.0 }
    } else {
        0.0 // first sample: zero rate (spec section 3 "first observation yields zero rates")
    };
    baseline.prev_cpu = Some((total_usage, system_usage));

    // Linux daemon path: usedMemory = usage - (inactive_file || cache).
    let subtract = one_shot.memory_stats.stats.inactive_file.or(one_shot.memory_stats.stats.cache).unwrap_or(0);
    let mem_bytes = one_shot
        .memory_stats
        .private_working_set // Windows daemon path
        .unwrap_or_else(|| one_shot.memory_stats.usage.saturating_sub(subtract));
    let mem_mib = mem_bytes as f64 / 1_048_576.0;

    let (net_sent, net_recv): (u64, u64) = one_shot.networks.values().fold((0, 0), |(s, r), n| (s + n.tx_bytes, r + n.rx_bytes));
    let (net_sent_rate, net_recv_rate) = if let Some((prev_sent, prev_recv)) = baseline.prev_net {
        let dt = baseline
            .prev_read
            .map(|t| now.duration_since(t).as_secs_f64())
            .filter(|d| *d > 0.0);
        match dt {
            Some(dt) => (
                (net_sent.saturating_sub(prev_sent)) as f64 / dt,
                (net_recv.saturating_sub(prev_recv)) as f64 / dt,
            ),
            None => (0.0, 0.0),
        }
    } else {
        (0.0, 0.0)
    };
    baseline.prev_net = Some((net_sent, net_recv));

    let (read_bytes, write_bytes) = one_shot.blkio_stats.io_service_bytes_recursive.iter().fold((0u64, 0u64), |(r, w), e| match e.op.as_str() {
        "Read" | "read" => (r + e.value, w),
        "Write" | "write" => (r, w + e.value),
        _ => (r, w),
    });
    let (disk_read_rate, disk_write_rate) = if let Some((prev_read, prev_write)) = baseline.prev_disk {
        let dt = baseline.prev_read.map(|t| now.duration_since(t).as_secs_f64()).filter(|d| *d > 0.0);
        match dt {
            Some(dt) => ((read_bytes.saturating_sub(prev_read)) as f64 / dt, (write_bytes.saturating_sub(prev_write)) as f64 / dt),
            None => (0.0, 0.0),
        }
    } else {
        (0.0, 0.0)
    };
    baseline.prev_disk = Some((read_bytes, write_bytes));
    baseline.prev_read = Some(now);
    let first_sample = !baseline.initialized;
    baseline.initialized = true;

    if cpu_pct > 100.0 || mem_bytes == 0 {
        return WorkerOutcome::Failed(short_id, name, summary);
    }

    let volumes: BTreeMap<String, f64> = summary
        .mounts
        .iter()
        .filter_map(|m| m.name.as_ref().and_then(|n| volume_sizes_mib.get(n).map(|mib| (n.clone(), *mib))))
        .collect();

    WorkerOutcome::Ok(ContainerStats {
        id: short_id,
        name,
        status,
        health,
        project,
        cpu_pct: round2(cpu_pct),
        mem_mib: round2(mem_mib),
        network_sent_mibps: if first_sample { 0.0 } else { round2(net_sent_rate / 1_048_576.0) },
        network_recv_mibps: if first_sample { 0.0 } else { round2(net_recv_rate / 1_048_576.0) },
        disk_read_mibps: if first_sample { 0.0 } else { round2(disk_read_rate / 1_048_576.0) },
        disk_write_mibps: if first_sample { 0.0 } else { round2(disk_write_rate / 1_048_576.0) },
        uptime_sec: uptime_from_rfc3339(&inspect.map(|i| i.state.started_at).unwrap_or_default()),
        volumes,
    })
}

fn uptime_from_rfc3339(started_at: &str) -> u64 {
    // `time` crate's format parsing is used elsewhere for listen-address
    // style concerns; container start timestamps are RFC3339 with nanosecond
    // precision, which `time::OffsetDateTime::parse` handles directly.
    use time::format_description::well_known::Rfc3339;
    match time::OffsetDateTime::parse(started_at, &Rfc3339) {
        Ok(start) => {
            let now = time::OffsetDateTime::now_utc();
            (now - start).whole_seconds().max(0) as u64
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_version_quirk_threshold() {
        let old = DaemonVersion { api_version: "1.43".into(), version: "24.0.5".into() };
        let new = DaemonVersion { api_version: "1.46".into(), version: "27.1.0".into() };
        assert!(old.is_buggy_under_concurrency());
        assert!(!new.is_buggy_under_concurrency());
    }

    #[test]
    fn exclude_pattern_is_substring_match() {
        let patterns = vec!["build".to_string(), "tmp".to_string()];
        assert!(patterns.iter().any(|p| "build-worker-1".contains(p.as_str())));
        assert!(!patterns.iter().any(|p| "web-1".contains(p.as_str())));
    }

    fn summary(id: &str, name: &str, volume: Option<&str>) -> DaemonContainerSummary {
        DaemonContainerSummary {
            id: id.to_string(),
            names: vec![format!("/{name}")],
            state: "running".to_string(),
            status: "Up".to_string(),
            mounts: volume
                .map(|v| vec![types::DaemonMount { name: Some(v.to_string()), destination: "/data".to_string() }])
                .unwrap_or_default(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn volume_map_includes_mounts_from_excluded_containers() {
        let summaries = vec![summary("a".repeat(64).as_str(), "web-1", Some("shared-vol")), summary("b".repeat(64).as_str(), "build-tmp-1", Some("shared-vol"))];
        let (volume_to_containers, surviving) = partition_containers(summaries, &["build".to_string()]);

        // Step 2 ran on the full list: both containers' mount is recorded
        // even though "build-tmp-1" is excluded from `surviving` in step 3.
        let containers_on_volume = volume_to_containers.get("shared-vol").expect("volume present");
        assert_eq!(containers_on_volume.len(), 2);
        assert!(containers_on_volume.contains(&"a".repeat(12)));
        assert!(containers_on_volume.contains(&"b".repeat(12)));

        assert_eq!(surviving.len(), 1);
        assert_eq!(surviving[0].1, "web-1");
    }
}
