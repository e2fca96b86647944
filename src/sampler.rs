//! Orchestrates one snapshot; holds every rate baseline (spec section 4.1).

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use tracing::warn;

use crate::cache::SessionCache;
use crate::config::{ConfigReconciler, MemCalc};
use crate::containers::ContainerManager;
use crate::gpu::SubprocessCollector;
use crate::host::disk::{resolve_root_device, DiskBaselines, PartitionFacts};
use crate::host::net::NetBaselines;
use crate::host::{disk_io_bytes, filter_interfaces, zfs_arc_bytes, HostProbe};
use crate::sensors::{build_temperature_map, read_sensors_with_panic_guard, SensorFilter};
use crate::smart::SmartCollector;
use crate::snapshot::{round2, Info, Snapshot, Stats};

/// Everything the Sampler needs that lives longer than one call.
pub struct Sampler {
    /// Single writer of every baseline (spec section 5 "Sampler.lock").
    inner: Mutex<Inner>,
    config: std::sync::Arc<ConfigReconciler>,
    containers: tokio::sync::Mutex<Option<ContainerManager>>,
    gpu: Vec<SubprocessCollector>,
    smart: Option<SmartCollector>,
    agent_version: String,
}

struct Inner {
    cache: SessionCache,
    host: HostProbe,
    disks: DiskBaselines,
    net: NetBaselines,
    nets_initialized: bool,
}

impl Sampler {
    pub fn new(config: std::sync::Arc<ConfigReconciler>, containers: Option<ContainerManager>, gpu: Vec<SubprocessCollector>, smart: Option<SmartCollector>, agent_version: String) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: SessionCache::with_default_lease(),
                host: HostProbe::new(),
                disks: DiskBaselines::default(),
                net: NetBaselines::default(),
                nets_initialized: false,
            }),
            config,
            containers: tokio::sync::Mutex::new(containers),
            gpu,
            smart,
            agent_version,
        }
    }

    /// `sample(callerId) -> Snapshot` (spec section 4.1).
    ///
    /// `sample` calls are meant to be totally ordered by one exclusive lock
    /// (spec section 5); the connection layer is responsible for never
    /// invoking this concurrently with itself. The inner `std::sync::Mutex`
    /// is split across await points below only because container/GPU
    /// collection is async — it still guards every baseline field and is
    /// never held across a suspension point itself.
    pub async fn sample(&self, caller_id: &str) -> Snapshot {
        let cached = {
            let mut guard = self.inner.lock().expect("sampler lock poisoned");
            guard.cache.get(caller_id).0
        };
        if cached {
            let guard = self.inner.lock().expect("sampler lock poisoned");
            return guard.cache.snapshot().clone();
        }

        let cfg = self.config.current();

        // Step 3: host stats (synchronous under the lock).
        let mut snapshot = {
            let mut guard = self.inner.lock().expect("sampler lock poisoned");
            self.probe_host(&mut guard, &cfg)
        };

        // GPU aggregator reads (async, each collector guarded by its own
        // mutex per spec section 5 "SubprocessCollector.mutex").
        let mut gpus = BTreeMap::new();
        for (idx, collector) in self.gpu.iter().enumerate() {
            for (id, stats) in collector.get_current_data().await {
                gpus.entry(format!("{idx}:{id}")).or_insert(stats);
            }
        }
        // No subprocess tool was found on PATH at all: fall back to a
        // same-process one-shot probe rather than reporting no GPU section
        // (spec section 4.4 design note: both probes are kept as a fallback
        // source of facts alongside the subprocess-based collectors).
        if self.gpu.is_empty() {
            for sample in crate::gpu::probe::probe_nvml() {
                let mut stats = crate::snapshot::GpuStats::default();
                stats.accumulate(&sample.name, sample.temperature, sample.memory_used_mib, sample.memory_total_mib, sample.usage_pct, sample.power_watts);
                gpus.insert(format!("nvml:{}", sample.device_id), stats.read_and_decay());
            }
            if gpus.is_empty() {
                if let Some(sample) = crate::gpu::probe::probe_active_gpu() {
                    let mut stats = crate::snapshot::GpuStats::default();
                    stats.accumulate(&sample.name, sample.temperature, sample.memory_used_mib, sample.memory_total_mib, sample.usage_pct, sample.power_watts);
                    gpus.insert(format!("gfxinfo:{}", sample.device_id), stats.read_and_decay());
                }
            }
        }
        // Step 6: merge GPU temperatures into the sensor map before the
        // dashboard-temperature computation below.
        for (id, gpu) in &gpus {
            if let Some(temp) = gpu.temperature {
                snapshot.stats.temperatures.entry(format!("gpu_{id}")).or_insert(temp);
            }
        }
        snapshot.info.dashboard_temp = cfg
            .primary_sensor
            .as_ref()
            .and_then(|key| snapshot.stats.temperatures.get(key).copied())
            .or_else(|| snapshot.stats.temperatures.values().copied().fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v)))));

        let containers = {
            let mut guard = self.containers.lock().await;
            match guard.as_mut() {
                Some(mgr) => {
                    let collected = mgr.collect().await;
                    log_shared_volumes(&collected.volume_to_containers);
                    collected.stats
                }
                None => Vec::new(),
            }
        };
        let podman = {
            let guard = self.containers.lock().await;
            guard.as_ref().map(|m| m.is_podman()).unwrap_or(false)
        };

        let smart = match &self.smart {
            Some(collector) => collector.get_current_data().await,
            None => BTreeMap::new(),
        };

        snapshot.containers = containers;
        snapshot.gpus = gpus;
        snapshot.smart = smart;
        snapshot.info.agent_version = self.agent_version.clone();
        snapshot.info.podman = podman;

        // Step 9: publish to the cache under callerId, then return.
        let mut guard = self.inner.lock().expect("sampler lock poisoned");
        guard.cache.set(snapshot);
        guard.cache.snapshot().clone()
    }

    /// Steps 3-8 of the algorithm for everything HostProbe-owned: memory
    /// policy, ZFS ARC subtraction, disk/net rates, sensors, and the
    /// `info` summary. GPU merge and container assembly happen in
    /// `sample` once this returns, since those are async.
    fn probe_host(&self, guard: &mut Inner, cfg: &crate::config::AgentConfig) -> Snapshot {
        let now = Instant::now();
        guard.host.refresh_cpu_and_mem();
        guard.host.disks.refresh(false);
        guard.host.networks.refresh(false);

        let cpu_pct = guard.host.cpu_percent();
        let vm = guard.host.virtual_memory();
        let cpu_info = guard.host.cpu_info();

        // Step 4: memory policy.
        let used_bytes = match cfg.mem_calc {
            MemCalc::Htop => vm.htop_used(),
            MemCalc::Default => vm.used,
        };
        let mut used_gib = used_bytes as f64 / 1_073_741_824.0;

        // Step 5: ZFS ARC detection and subtraction.
        let zfs_arc_gib = zfs_arc_bytes().map(|bytes| {
            let gib = bytes as f64 / 1_073_741_824.0;
            used_gib = (used_gib - gib).max(0.0);
            round2(gib)
        });

        let total_gib = vm.total as f64 / 1_073_741_824.0;
        let mem_pct = if total_gib > 0.0 { round2(used_gib / total_gib * 100.0) } else { 0.0 };

        // Filesystem discovery + rates.
        let partitions: Vec<PartitionFacts> = guard
            .host
            .disks
            .iter()
            .map(|d| PartitionFacts { device: d.name().to_string_lossy().to_string(), mountpoint: d.mount_point().to_string_lossy().to_string() })
            .collect();
        let io_bytes = disk_io_bytes();
        let io_read_bytes: std::collections::HashMap<String, u64> = io_bytes.iter().map(|(dev, (read, _write))| (dev.clone(), *read)).collect();
        let root = resolve_root_device(cfg.filesystem.as_deref(), &partitions, None, &io_read_bytes);

        let mut filesystems = BTreeMap::new();
        let mut disk_total_gib = 0.0;
        let mut disk_used_gib = 0.0;
        let mut disk_read_mibps = 0.0;
        let mut disk_write_mibps = 0.0;
        let mut present_mounts = HashSet::new();
        let mut root_found = false;

        for disk in guard.host.disks.iter() {
            let mountpoint = disk.mount_point().to_string_lossy().to_string();
            let is_root = !root_found && root.as_ref().map(|r| r.mountpoint == mountpoint).unwrap_or(false);
            let is_extra = crate::host::disk::extra_mounts(std::iter::once(mountpoint.as_str()), &cfg.extra_fs).contains(&mountpoint);
            if !is_root && !is_extra {
                continue;
            }
            present_mounts.insert(mountpoint.clone());

            let total = disk.total_space() as f64 / 1_073_741_824.0;
            let avail = disk.available_space() as f64 / 1_073_741_824.0;
            let used = (total - avail).max(0.0);
            let device_key = disk.name().to_string_lossy().trim_start_matches("/dev/").to_string();
            let (read_bytes, write_bytes) = io_bytes.get(&device_key).copied().unwrap_or((0, 0));
            let fs = guard.disks.observe_ok(&mountpoint, is_root, round2(total), round2(used), read_bytes, write_bytes, now);

            if is_root {
                disk_total_gib = fs.disk_total_gib;
                disk_used_gib = fs.disk_used_gib;
                disk_read_mibps = fs.read_mibps;
                disk_write_mibps = fs.write_mibps;
                root_found = true;
            } else {
                filesystems.insert(mountpoint, fs);
            }
        }
        guard.disks.evict_missing(&present_mounts);
        let disk_pct = if disk_total_gib > 0.0 { round2(disk_used_gib / disk_total_gib * 100.0) } else { 0.0 };

        // Network: sum accepted interfaces' counters.
        let net_names_with_bytes: Vec<(&str, u64, u64)> = guard.host.networks.iter().map(|(name, data)| (name.as_str(), data.total_transmitted(), data.total_received())).collect();
        if !guard.nets_initialized {
            let accepted = filter_interfaces(net_names_with_bytes.iter().copied(), &cfg.nics);
            guard.net.reinit_interfaces(accepted);
            guard.nets_initialized = true;
        }
        let (sent_sum, recv_sum) = guard
            .host
            .networks
            .iter()
            .filter(|(name, _)| guard.net.accepted_interfaces.contains(name.as_str()))
            .fold((0u64, 0u64), |(s, r), (_, data)| (s + data.total_transmitted(), r + data.total_received()));
        let net_rates = guard.net.observe(sent_sum, recv_sum, now);

        // Step 6 (sensor half): apply the whitelist/blacklist filter; the
        // GPU-temperature merge and dashboard-temperature computation
        // happen back in `sample` once GPU data is available.
        let filter = SensorFilter::parse(Some(&cfg.sensors));
        let temperatures = if filter.skip_collection {
            BTreeMap::new()
        } else {
            let raw = read_sensors_with_panic_guard(|| guard.host.sensors()).unwrap_or_default();
            build_temperature_map(&filter, raw).into_iter().collect::<BTreeMap<_, _>>()
        };
        if temperatures.is_empty() && !filter.skip_collection {
            warn!("no sensors accepted this cycle");
        }

        let uptime = guard.host.host_uptime();
        let bandwidth = net_rates.sent_mibps.unwrap_or(0.0) + net_rates.recv_mibps.unwrap_or(0.0);

        let stats = Stats {
            cpu_pct: round2(cpu_pct),
            mem_total_gib: round2(total_gib),
            mem_used_gib: round2(used_gib),
            mem_buff_cache_gib: round2(vm.cached as f64 / 1_073_741_824.0),
            mem_zfs_arc_gib: zfs_arc_gib,
            swap_total_gib: round2(vm.swap_total as f64 / 1_073_741_824.0),
            swap_used_gib: round2(vm.swap_used as f64 / 1_073_741_824.0),
            disk_total_gib,
            disk_used_gib,
            disk_pct,
            disk_read_mibps,
            disk_write_mibps,
            net_sent_mibps: net_rates.sent_mibps,
            net_recv_mibps: net_rates.recv_mibps,
            filesystems,
            temperatures,
        };

        let info = Info {
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_default(),
            kernel_version: guard.host.kernel_version(),
            cpu_model: cpu_info.model,
            core_count: cpu_info.core_count,
            thread_count: cpu_info.thread_count,
            agent_version: String::new(), // filled in by `sample` once this returns
            cpu_pct: stats.cpu_pct,
            mem_pct,
            disk_pct,
            dashboard_temp: None, // filled in by `sample` after the GPU merge
            uptime_secs: uptime,
            bandwidth_mibps: round2(bandwidth),
            podman: false, // filled in by `sample` once this returns
        };

        Snapshot { info, stats, containers: Vec::new(), gpus: BTreeMap::new(), smart: BTreeMap::new() }
    }
}

/// `ContainerManager::collect`'s volume→containers map (spec section 4.3
/// step 2) has no wire-format home in `Snapshot` — it's operator
/// diagnostics, not hub-visible state — so its one consumer is a debug log
/// naming volumes mounted into more than one container, useful for
/// spotting unexpected sharing before it shows up as I/O contention.
fn log_shared_volumes(volume_to_containers: &std::collections::BTreeMap<String, Vec<String>>) {
    for (volume, containers) in volume_to_containers {
        if containers.len() > 1 {
            tracing::debug!(volume, containers = ?containers, "volume shared by multiple containers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use std::sync::Arc;

    fn sampler() -> Sampler {
        let cfg = Arc::new(ConfigReconciler::new(AgentConfig::default()));
        Sampler::new(cfg, None, Vec::new(), None, "test".to_string())
    }

    #[tokio::test]
    async fn scenario1_first_call_probes_and_returns_a_snapshot() {
        let s = sampler();
        let snap = s.sample("hub-a").await;
        assert_eq!(snap.info.agent_version, "test");
        assert!(snap.containers.is_empty());
    }

    #[tokio::test]
    async fn scenario2_second_caller_within_lease_gets_cached_snapshot() {
        let s = sampler();
        let first = s.sample("hub-a").await;
        let second = s.sample("hub-b").await;
        assert_eq!(first.info.uptime_secs, second.info.uptime_secs);
    }

    #[tokio::test]
    async fn no_containers_manager_yields_empty_container_list() {
        let s = sampler();
        let snap = s.sample("hub-a").await;
        assert!(snap.containers.is_empty());
        assert!(!snap.info.podman);
    }
}
