//! Agent configuration: environment surface (spec section 6), the remotely
//! pushed `AgentConfig` shape, and the reconciler that applies it.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// One env var, checked unprefixed then `BESZEL_AGENT_`-prefixed — the
/// prefixed form wins when both are set (spec section 6).
fn env_var(name: &str) -> Option<String> {
    let prefixed = std::env::var(format!("BESZEL_AGENT_{name}")).ok();
    prefixed.or_else(|| std::env::var(name).ok())
}

/// Remotely managed, restart-aware configuration. `version` is monotonic:
/// lower-or-equal inbound versions are discarded by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub version: u64,
    pub log_level: String,
    pub mem_calc: MemCalc,
    pub extra_fs: Vec<String>,
    pub data_dir: String,
    /// `None` means unset (socket auto-detection applies); `Some("")` is an
    /// explicit empty override that disables the container manager entirely;
    /// `Some(path)` overrides the socket path (spec section 4.3 "Socket
    /// selection").
    pub docker_host: Option<String>,
    pub docker_timeout_ms: Option<u64>,
    pub container_exclude: Vec<String>,
    pub filesystem: Option<String>,
    pub listen: String,
    pub network: Option<String>,
    pub nics: Vec<String>,
    pub primary_sensor: Option<String>,
    pub sensors: String,
    pub sys_sensors: Option<String>,
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemCalc {
    Default,
    Htop,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            version: 0,
            log_level: "info".to_string(),
            mem_calc: MemCalc::Default,
            extra_fs: Vec::new(),
            data_dir: default_data_dir(),
            docker_host: None,
            docker_timeout_ms: None,
            container_exclude: Vec::new(),
            filesystem: None,
            listen: ":45876".to_string(),
            network: None,
            nics: Vec::new(),
            primary_sensor: None,
            sensors: String::new(),
            sys_sensors: None,
            environment: HashMap::new(),
        }
    }
}

fn default_data_dir() -> String {
    dirs_home().map(|h| format!("{h}/.hostpulse-agent")).unwrap_or_else(|| ".".to_string())
}

fn dirs_home() -> Option<String> {
    std::env::var("HOME").ok()
}

impl AgentConfig {
    /// Build the initial config from the process environment (spec section 6).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_var("LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Some(v) = env_var("MEM_CALC") {
            cfg.mem_calc = if v.eq_ignore_ascii_case("htop") { MemCalc::Htop } else { MemCalc::Default };
        }
        if let Some(v) = env_var("DATA_DIR") {
            cfg.data_dir = v;
        }
        if let Some(v) = env_var("DOCKER_HOST") {
            cfg.docker_host = Some(v);
        }
        if let Some(v) = env_var("DOCKER_TIMEOUT") {
            match v.parse::<u64>() {
                Ok(ms) => cfg.docker_timeout_ms = Some(ms),
                // Configuration error (spec section 7): log and continue with
                // the default timeout rather than failing startup.
                Err(_) => warn!(value = %v, "invalid DOCKER_TIMEOUT, using default"),
            }
        }
        if let Some(v) = env_var("CONTAINER_EXCLUDE") {
            cfg.container_exclude = split_csv(&v);
        }
        if let Some(v) = env_var("FILESYSTEM") {
            cfg.filesystem = Some(v);
        }
        if let Some(v) = env_var("EXTRA_FILESYSTEMS") {
            cfg.extra_fs = split_csv(&v);
        }
        if let Some(v) = env_var("NICS") {
            cfg.nics = split_csv(&v);
        }
        if let Some(v) = env_var("NETWORK") {
            cfg.network = Some(v);
        }
        if let Some(v) = env_var("PRIMARY_SENSOR") {
            cfg.primary_sensor = Some(v);
        }
        if let Some(v) = env_var("SENSORS") {
            cfg.sensors = v;
        }
        if let Some(v) = env_var("SYS_SENSORS") {
            cfg.sys_sensors = Some(v);
        }
        let listen = env_var("LISTEN").or_else(|| env_var("PORT"));
        if let Some(v) = listen {
            cfg.listen = v;
        }
        cfg
    }

    /// Fields that, when changed, require tearing down the connection
    /// (spec section 4.7).
    pub fn restart_relevant_fields_differ(&self, other: &AgentConfig) -> bool {
        self.listen != other.listen
            || self.data_dir != other.data_dir
            || self.docker_host != other.docker_host
            || self.filesystem != other.filesystem
            || self.network != other.network
            || self.nics != other.nics
            || self.extra_fs != other.extra_fs
    }
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
}

/// Raw shape a hub may push: `version` may arrive as string, integer, or
/// float (spec section 4.7 / design note). Everything else is optional —
/// only non-empty fields are applied.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigUpdateRequest {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: u64,
    pub log_level: Option<String>,
    pub mem_calc: Option<MemCalc>,
    pub extra_fs: Option<Vec<String>>,
    pub data_dir: Option<String>,
    pub docker_host: Option<String>,
    pub docker_timeout_ms: Option<u64>,
    pub container_exclude: Option<Vec<String>>,
    pub filesystem: Option<String>,
    pub listen: Option<String>,
    pub network: Option<String>,
    pub nics: Option<Vec<String>>,
    pub primary_sensor: Option<String>,
    pub sensors: Option<String>,
    pub sys_sensors: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub force_restart: bool,
}

/// Hand-written decoder: string/integer/float all coerce to `u64`;
/// anything else defaults to 0 (design note section 9).
fn deserialize_version<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(coerce_version(&v))
}

pub fn coerce_version(v: &Value) -> u64 {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)).unwrap_or(0),
        Value::String(s) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

/// Outcome of applying a config update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Stale,
    AppliedHot,
    AppliedRestart,
}

/// Versioned, restart-aware applier of remotely pushed settings (spec
/// section 4.7). Apply is all-or-nothing: on failure the previous config
/// pointer is restored before signalling.
pub struct ConfigReconciler {
    current: RwLock<AgentConfig>,
}

impl ConfigReconciler {
    pub fn new(initial: AgentConfig) -> Self {
        Self { current: RwLock::new(initial) }
    }

    pub fn current(&self) -> AgentConfig {
        self.current.read().expect("config lock poisoned").clone()
    }

    pub fn current_version(&self) -> u64 {
        self.current.read().expect("config lock poisoned").version
    }

    /// Apply a pushed update. Returns whether it was applied and whether a
    /// restart is required. A failure to construct the new config (none in
    /// this implementation, but kept as a seam for future validation)
    /// rolls back to the previous config before returning.
    pub fn apply(&self, update: ConfigUpdateRequest) -> ApplyResult {
        let mut guard = self.current.write().expect("config lock poisoned");
        if update.version <= guard.version {
            debug!(current = guard.version, incoming = update.version, "discarding stale config push");
            return ApplyResult::Stale;
        }

        let previous = guard.clone();
        let mut next = previous.clone();
        next.version = update.version;
        if let Some(v) = update.log_level { next.log_level = v; }
        if let Some(v) = update.mem_calc { next.mem_calc = v; }
        if let Some(v) = update.extra_fs { next.extra_fs = v; }
        if let Some(v) = update.data_dir { next.data_dir = v; }
        if let Some(v) = update.docker_host { next.docker_host = Some(v); }
        if let Some(v) = update.docker_timeout_ms { next.docker_timeout_ms = Some(v); }
        if let Some(v) = update.container_exclude { next.container_exclude = v; }
        if let Some(v) = update.filesystem { next.filesystem = Some(v); }
        if let Some(v) = update.listen { next.listen = v; }
        if let Some(v) = update.network { next.network = Some(v); }
        if let Some(v) = update.nics { next.nics = v; }
        if let Some(v) = update.primary_sensor { next.primary_sensor = Some(v); }
        if let Some(v) = update.sensors { next.sensors = v; }
        if let Some(v) = update.sys_sensors { next.sys_sensors = Some(v); }
        for (k, val) in update.environment.iter() {
            next.environment.insert(k.clone(), val.clone());
            // Scoped write: only the reconciler mutates process env (design note section 9).
            std::env::set_var(k, val);
        }

        let restart = update.force_restart || previous.restart_relevant_fields_differ(&next);
        match apply_validated(&next) {
            Ok(()) => {
                *guard = next;
                if restart { ApplyResult::AppliedRestart } else { ApplyResult::AppliedHot }
            }
            Err(e) => {
                warn!(error = %e, "config apply failed, rolling back");
                *guard = previous;
                ApplyResult::Stale
            }
        }
    }
}

/// Mirror every applied field into the process environment under the
/// matching unprefixed name (spec section 4.7 "Apply" / design note section
/// 9 "Global process environment"): subsequent sub-process invocations (GPU
/// collectors, the sensors library) only ever see config changes through
/// env, so this is the one place permitted to call `set_var` for
/// non-`environment`-submap fields.
fn apply_validated(cfg: &AgentConfig) -> Result<(), ConfigError> {
    if cfg.listen.is_empty() {
        return Err(ConfigError::InvalidListen);
    }
    std::env::set_var("LOG_LEVEL", &cfg.log_level);
    std::env::set_var("MEM_CALC", if cfg.mem_calc == MemCalc::Htop { "htop" } else { "default" });
    std::env::set_var("DATA_DIR", &cfg.data_dir);
    if let Some(v) = &cfg.docker_host { std::env::set_var("DOCKER_HOST", v); }
    if let Some(ms) = cfg.docker_timeout_ms { std::env::set_var("DOCKER_TIMEOUT", ms.to_string()); }
    if !cfg.container_exclude.is_empty() { std::env::set_var("CONTAINER_EXCLUDE", cfg.container_exclude.join(",")); }
    if let Some(v) = &cfg.filesystem { std::env::set_var("FILESYSTEM", v); }
    if !cfg.extra_fs.is_empty() { std::env::set_var("EXTRA_FILESYSTEMS", cfg.extra_fs.join(",")); }
    if !cfg.nics.is_empty() { std::env::set_var("NICS", cfg.nics.join(",")); }
    if let Some(v) = &cfg.network { std::env::set_var("NETWORK", v); }
    if let Some(v) = &cfg.primary_sensor { std::env::set_var("PRIMARY_SENSOR", v); }
    std::env::set_var("SENSORS", &cfg.sensors);
    if let Some(v) = &cfg.sys_sensors { std::env::set_var("SYS_SENSORS", v); }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("listen address cannot be empty")]
    InvalidListen,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AgentConfig {
        let mut c = AgentConfig::default();
        c.version = 3;
        c
    }

    #[test]
    fn p7_stale_version_is_noop() {
        let r = ConfigReconciler::new(base());
        let update = ConfigUpdateRequest {
            version: 3,
            log_level: Some("debug".into()),
            mem_calc: None,
            extra_fs: None,
            data_dir: None,
            docker_host: None,
            docker_timeout_ms: None,
            container_exclude: None,
            filesystem: None,
            listen: None,
            network: None,
            nics: None,
            primary_sensor: None,
            sensors: None,
            sys_sensors: None,
            environment: HashMap::new(),
            force_restart: false,
        };
        assert_eq!(r.apply(update), ApplyResult::Stale);
        assert_eq!(r.current().log_level, "info");
        assert_eq!(r.current_version(), 3);
    }

    #[test]
    fn scenario6_logleve_change_no_restart() {
        let r = ConfigReconciler::new(base());
        let update = ConfigUpdateRequest {
            version: 4,
            log_level: Some("debug".into()),
            mem_calc: None,
            extra_fs: None,
            data_dir: None,
            docker_host: None,
            docker_timeout_ms: None,
            container_exclude: None,
            filesystem: None,
            listen: None,
            network: None,
            nics: None,
            primary_sensor: None,
            sensors: None,
            sys_sensors: None,
            environment: HashMap::new(),
            force_restart: false,
        };
        assert_eq!(r.apply(update), ApplyResult::AppliedHot);
        assert_eq!(r.current().log_level, "debug");
        assert_eq!(r.current_version(), 4);
    }

    #[test]
    fn restart_required_when_listen_changes() {
        let r = ConfigReconciler::new(base());
        let update = ConfigUpdateRequest {
            version: 4,
            log_level: None,
            mem_calc: None,
            extra_fs: None,
            data_dir: None,
            docker_host: None,
            docker_timeout_ms: None,
            container_exclude: None,
            filesystem: None,
            listen: Some(":9999".into()),
            network: None,
            nics: None,
            primary_sensor: None,
            sensors: None,
            sys_sensors: None,
            environment: HashMap::new(),
            force_restart: false,
        };
        assert_eq!(r.apply(update), ApplyResult::AppliedRestart);
    }

    #[test]
    fn applied_fields_mirror_into_process_env() {
        let r = ConfigReconciler::new(base());
        let update = ConfigUpdateRequest {
            version: 4,
            log_level: None,
            mem_calc: None,
            extra_fs: None,
            data_dir: None,
            docker_host: None,
            docker_timeout_ms: None,
            container_exclude: None,
            filesystem: None,
            listen: None,
            network: None,
            nics: None,
            primary_sensor: Some("gpu_edge".into()),
            sensors: None,
            sys_sensors: None,
            environment: HashMap::new(),
            force_restart: false,
        };
        assert_eq!(r.apply(update), ApplyResult::AppliedHot);
        assert_eq!(std::env::var("PRIMARY_SENSOR").unwrap(), "gpu_edge");
    }

    #[test]
    fn version_coercion_handles_string_int_float() {
        assert_eq!(coerce_version(&Value::String("7".into())), 7);
        assert_eq!(coerce_version(&Value::from(7u64)), 7);
        assert_eq!(coerce_version(&serde_json::json!(7.0)), 7);
        assert_eq!(coerce_version(&Value::String("nope".into())), 0);
        assert_eq!(coerce_version(&Value::Bool(true)), 0);
    }
}
