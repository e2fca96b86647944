//! Optional SMART collector (spec section 4.4): `smartctl --scan -j` every
//! 10 s discovers devices, then `smartctl --all -j <device>` per device is
//! parsed into a common attribute list regardless of SATA or NVMe shape.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::snapshot::SmartStats;

const SCAN_INTERVAL: Duration = Duration::from_secs(10);
const SCAN_DEADLINE: Duration = Duration::from_secs(10);

pub type SmartDataMap = Arc<Mutex<HashMap<String, SmartStats>>>;

pub struct SmartCollector {
    data: SmartDataMap,
    handle: JoinHandle<()>,
}

impl SmartCollector {
    /// Probes `smartctl` on PATH before starting the scan loop; returns
    /// `None` if it isn't present, matching the GPU collector's contract.
    pub fn spawn() -> Option<Self> {
        which("smartctl")?;
        let data: SmartDataMap = Arc::new(Mutex::new(HashMap::new()));
        let data_for_task = data.clone();
        let handle = tokio::spawn(run_loop(data_for_task));
        Some(Self { data, handle })
    }

    pub async fn get_current_data(&self) -> BTreeMap<String, SmartStats> {
        self.data.lock().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

async fn run_loop(data: SmartDataMap) {
    loop {
        match tokio::time::timeout(SCAN_DEADLINE, scan_once()).await {
            Ok(Ok(found)) => {
                let mut map = data.lock().await;
                map.retain(|k, _| found.contains_key(k));
                map.extend(found);
            }
            Ok(Err(e)) => warn!(error = %e, "smartctl scan failed"),
            Err(_) => warn!("smartctl scan exceeded 10s deadline"),
        }
        tokio::time::sleep(SCAN_INTERVAL).await;
    }
}

async fn scan_once() -> anyhow::Result<HashMap<String, SmartStats>> {
    let scan_out = Command::new("smartctl").args(["--scan", "-j"]).output().await?;
    let scan: Value = serde_json::from_slice(&scan_out.stdout)?;

    let devices = scan.get("devices").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut out = HashMap::new();
    for dev in devices {
        let Some(name) = dev.get("name").and_then(Value::as_str) else { continue };
        let dev_type = dev.get("type").and_then(Value::as_str).unwrap_or("auto").to_string();

        let all_out = Command::new("smartctl").args(["--all", "-j", name]).output().await;
        let Ok(all_out) = all_out else {
            debug!(device = name, "smartctl --all failed to spawn");
            continue;
        };
        let Ok(all) = serde_json::from_slice::<Value>(&all_out.stdout) else {
            debug!(device = name, "smartctl --all produced non-JSON output");
            continue;
        };

        out.insert(name.to_string(), parse_device(name, &dev_type, &all));
    }

    Ok(out)
}

fn parse_device(name: &str, dev_type: &str, v: &Value) -> SmartStats {
    let model = v
        .get("model_name")
        .or_else(|| v.get("model_family"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let serial = v.get("serial_number").and_then(Value::as_str).unwrap_or_default().to_string();
    let health_passed = v.get("smart_status").and_then(|s| s.get("passed")).and_then(Value::as_bool).unwrap_or(true);
    let temperature = v.get("temperature").and_then(|t| t.get("current")).and_then(Value::as_f64);

    let power_on_hours = v
        .get("power_on_time")
        .and_then(|p| p.get("hours"))
        .and_then(Value::as_u64)
        .or_else(|| v.get("nvme_smart_health_information_log").and_then(|l| l.get("power_on_hours")).and_then(Value::as_u64));

    let mut attributes = BTreeMap::new();
    if let Some(table) = v.get("ata_smart_attributes").and_then(|a| a.get("table")).and_then(Value::as_array) {
        for attr in table {
            let (Some(attr_name), Some(raw)) = (attr.get("name").and_then(Value::as_str), attr.get("raw").and_then(|r| r.get("value")).and_then(Value::as_i64)) else {
                continue;
            };
            attributes.insert(attr_name.to_string(), raw);
        }
    }
    if let Some(log) = v.get("nvme_smart_health_information_log").and_then(Value::as_object) {
        for (key, val) in log {
            if let Some(n) = val.as_i64() {
                attributes.insert(key.clone(), n);
            }
        }
    }

    SmartStats {
        device: name.to_string(),
        model,
        serial,
        kind: dev_type.to_string(),
        health_passed,
        temperature,
        power_on_hours,
        attributes,
    }
}

fn which(program: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|p| p.join(program)).find(|p| p.is_file())
}
