//! Same-process GPU probes kept from the teacher as a fallback source of
//! facts alongside the spec's subprocess-based collectors (spec section 4.4
//! design note: both `gfxinfo` and `nvml-wrapper` were already in the
//! teacher's dependency table, so both are kept rather than dropped).

use tracing::warn;

use super::GpuSample;

/// One-shot active-GPU probe via `gfxinfo`, as the teacher's `gpu.rs` did.
pub fn probe_active_gpu() -> Option<GpuSample> {
    let gpu = gfxinfo::active_gpu().map_err(|e| warn!(error = %e, "gfxinfo probe failed")).ok()?;
    let info = gpu.info();
    Some(GpuSample {
        device_id: "gfxinfo0".to_string(),
        name: gpu.model().to_string(),
        temperature: None,
        memory_used_mib: info.used_vram() as f64 / 1_048_576.0,
        memory_total_mib: info.total_vram() as f64 / 1_048_576.0,
        usage_pct: info.load_pct() as f64,
        power_watts: 0.0,
    })
}

/// One-shot probe via `nvml-wrapper`, used when `nvidia-smi` is absent from
/// PATH but the NVML shared library is loadable directly.
pub fn probe_nvml() -> Vec<GpuSample> {
    let nvml = match nvml_wrapper::Nvml::init() {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "nvml init failed");
            return Vec::new();
        }
    };

    let count = match nvml.device_count() {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    (0..count)
        .filter_map(|i| {
            let device = nvml.device_by_index(i).ok()?;
            let name = device.name().ok()?;
            let mem = device.memory_info().ok()?;
            let temp = device.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu).ok();
            let util = device.utilization_rates().ok();
            let power_mw = device.power_usage().ok();

            Some(GpuSample {
                device_id: i.to_string(),
                name,
                temperature: temp.map(|t| t as f64),
                memory_used_mib: mem.used as f64 / 1_048_576.0,
                memory_total_mib: mem.total as f64 / 1_048_576.0,
                usage_pct: util.map(|u| u.gpu as f64).unwrap_or(0.0),
                power_watts: power_mw.map(|p| p as f64 / 1000.0).unwrap_or(0.0),
            })
        })
        .collect()
}
