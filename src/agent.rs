//! Top-level wiring: owns the `Sampler`, the `ConfigReconciler`, and the
//! identity used by the connection layer, and is the event sink sub-managers
//! report into (design note section 9, "cyclic ownership").
//!
//! `ContainerManager` needs to tell something outside itself "podman was
//! detected" at construction time, before `Agent` itself can exist (the
//! sampler it feeds needs the manager already built). `EventSink` breaks
//! the cycle: it is a small `Arc`-shared handle `Agent` also holds, so both
//! sides observe the same flag without either owning the other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use tracing::info;

use crate::config::{AgentConfig, ConfigReconciler};
use crate::connection::auth;
use crate::containers::ContainerManager;
use crate::fingerprint;
use crate::gpu::SubprocessCollector;
use crate::sampler::Sampler;
use crate::smart::SmartCollector;

pub trait AgentEvents: Send + Sync {
    fn set_podman_detected(&self, detected: bool);
}

/// Shared podman-detected flag, handed to `ContainerManager::new` as the
/// events sink and read back by `Agent` once construction completes.
struct EventSink {
    podman_detected: AtomicBool,
}

impl AgentEvents for EventSink {
    fn set_podman_detected(&self, detected: bool) {
        if detected {
            info!("podman daemon detected, concurrency gate disabled");
        }
        self.podman_detected.store(detected, Ordering::Relaxed);
    }
}

pub struct Agent {
    pub sampler: Arc<Sampler>,
    pub config: Arc<ConfigReconciler>,
    pub identity: SigningKey,
    pub fingerprint: String,
    events: Arc<EventSink>,
}

impl Agent {
    /// Build every long-lived collector and the sampler around them, but do
    /// not start the connection layer (spec section 4 overview: probes are
    /// constructed once at startup; the connection posture is decided by
    /// the caller from `AgentConfig`/CLI flags).
    pub fn bootstrap(config: AgentConfig, agent_version: String) -> Self {
        std::fs::create_dir_all(&config.data_dir).ok();
        let identity = auth::load_or_generate_identity(&config.data_dir);
        let reconciler = Arc::new(ConfigReconciler::new(config.clone()));
        let events = Arc::new(EventSink { podman_detected: AtomicBool::new(false) });

        // Socket selection (spec section 4.3 "Socket selection" / 6):
        // DOCKER_HOST overrides, an explicit empty value disables the
        // manager, and an unset value auto-detects docker.sock then
        // podman.sock.
        let uid = current_uid();
        let socket = crate::containers::client::select_socket(config.docker_host.as_deref(), uid);
        let docker_timeout = config.docker_timeout_ms.map(std::time::Duration::from_millis);
        let containers = socket.map(|path| ContainerManager::new(path, config.container_exclude.clone(), docker_timeout, events.clone() as Arc<dyn AgentEvents>));

        let gpu = SubprocessCollector::spawn(crate::gpu::nvidia::PROGRAM, &crate::gpu::nvidia::args(), crate::gpu::nvidia::NvidiaParser::default())
            .into_iter()
            .chain(SubprocessCollector::spawn(crate::gpu::amd::PROGRAM, &crate::gpu::amd::args(), crate::gpu::amd::AmdParser::default()))
            .chain(SubprocessCollector::spawn(crate::gpu::tegra::PROGRAM, &crate::gpu::tegra::args(), crate::gpu::tegra::TegraParser::default()))
            .collect::<Vec<_>>();

        let smart = SmartCollector::spawn();

        let hostname = hostname::get().ok().and_then(|h| h.into_string().ok()).unwrap_or_default();
        let fingerprint = fingerprint::derive(&config.data_dir, &hostname, "");

        let sampler = Arc::new(Sampler::new(reconciler.clone(), containers, gpu, smart, agent_version));

        Self { sampler, config: reconciler, identity, fingerprint, events }
    }

    pub fn podman_detected(&self) -> bool {
        self.events.podman_detected.load(Ordering::Relaxed)
    }

    pub fn public_key_hex(&self) -> String {
        auth::encode_public_key(&self.identity.verifying_key())
    }
}

/// Best-effort current uid for the podman rootless socket path
/// (`/run/user/<uid>/podman/podman.sock`). `/proc/self`'s owner is the
/// running process's uid on Linux; other platforms have no equivalent
/// rootless-podman convention, so they fall back to 0 (unused there).
#[cfg(target_os = "linux")]
fn current_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn current_uid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_with_docker_host_explicitly_disabled_has_no_container_manager() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::default();
        cfg.data_dir = dir.path().to_string_lossy().to_string();
        cfg.docker_host = Some(String::new()); // explicit empty: disables the manager (spec section 4.3)
        let agent = Agent::bootstrap(cfg, "test".to_string());
        assert!(!agent.podman_detected());
        assert!(!agent.fingerprint.is_empty());
    }
}
