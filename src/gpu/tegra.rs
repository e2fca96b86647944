//! `tegrastats` single-line extraction for Jetson boards (spec section
//! 4.4): `RAM u/tMB GR3D_FREQ p% tj@tC VDD_GPU_SOC mW`.

use super::{GpuSample, LineParser};

pub const PROGRAM: &str = "tegrastats";
pub fn args() -> Vec<&'static str> {
    Vec::new()
}

#[derive(Default)]
pub struct TegraParser;

impl LineParser for TegraParser {
    fn parse_line(&mut self, line: &str) -> Vec<GpuSample> {
        let Some(mem) = extract_ram(line) else { return Vec::new() };
        let usage = extract_gr3d_pct(line).unwrap_or(0.0);
        let temp = extract_gpu_temp(line);
        let power = extract_vdd_gpu_soc_mw(line).map(|mw| mw / 1000.0).unwrap_or(0.0);

        vec![GpuSample {
            device_id: "0".to_string(),
            name: "Tegra iGPU".to_string(),
            temperature: temp,
            memory_used_mib: mem.0,
            memory_total_mib: mem.1,
            usage_pct: usage,
            power_watts: power,
        }]
    }
}

/// `RAM 2048/7850MB` → (used_mib, total_mib).
fn extract_ram(line: &str) -> Option<(f64, f64)> {
    let idx = line.find("RAM ")?;
    let rest = &line[idx + 4..];
    let token = rest.split_whitespace().next()?;
    let token = token.strip_suffix("MB")?;
    let (used, total) = token.split_once('/')?;
    Some((used.parse().ok()?, total.parse().ok()?))
}

/// `GR3D_FREQ 23%@1300` or `GR3D_FREQ 23%` → 23.0.
fn extract_gr3d_pct(line: &str) -> Option<f64> {
    let idx = line.find("GR3D_FREQ ")?;
    let rest = &line[idx + "GR3D_FREQ ".len()..];
    let token = rest.split_whitespace().next()?;
    let pct = token.split('%').next()?;
    pct.parse().ok()
}

/// `tj@45.5C` → 45.5.
fn extract_gpu_temp(line: &str) -> Option<f64> {
    let idx = line.find("tj@")?;
    let rest = &line[idx + 3..];
    let token = rest.split_whitespace().next()?;
    token.strip_suffix('C').unwrap_or(token).parse().ok()
}

/// `VDD_GPU_SOC 4567mW/4500mW` → 4567.0 (instantaneous, first number).
fn extract_vdd_gpu_soc_mw(line: &str) -> Option<f64> {
    let idx = line.find("VDD_GPU_SOC ")?;
    let rest = &line[idx + "VDD_GPU_SOC ".len()..];
    let token = rest.split_whitespace().next()?;
    let first = token.split('/').next()?;
    first.strip_suffix("mW").unwrap_or(first).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_representative_line() {
        let mut p = TegraParser;
        let line = "RAM 2048/7850MB (lfb 12x4MB) SWAP 512/3925MB CPU [12%@1900,8%@1900] EMC_FREQ 10% GR3D_FREQ 23%@1300 tj@45.5C VDD_GPU_SOC 4567mW/4500mW VDD_CPU_CV 1200mW/1100mW";
        let samples = p.parse_line(line);
        assert_eq!(samples.len(), 1);
        let s = &samples[0];
        assert_eq!(s.memory_used_mib, 2048.0);
        assert_eq!(s.memory_total_mib, 7850.0);
        assert_eq!(s.usage_pct, 23.0);
        assert_eq!(s.temperature, Some(45.5));
        assert_eq!(s.power_watts, 4.567);
    }

    #[test]
    fn missing_ram_field_yields_no_samples() {
        let mut p = TegraParser;
        assert!(p.parse_line("garbage line with no fields").is_empty());
    }
}
