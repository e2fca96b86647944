//! `nvidia-smi -l 4 --query-gpu=... --format=csv,noheader,nounits` parser
//! (spec section 4.4).

use super::{GpuSample, LineParser};

pub const PROGRAM: &str = "nvidia-smi";
pub fn args() -> Vec<&'static str> {
    vec![
        "-l",
        "4",
        "--query-gpu=index,name,temperature.gpu,memory.used,memory.total,utilization.gpu,power.draw",
        "--format=csv,noheader,nounits",
    ]
}

#[derive(Default)]
pub struct NvidiaParser;

impl LineParser for NvidiaParser {
    fn parse_line(&mut self, line: &str) -> Vec<GpuSample> {
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        if fields.len() < 7 {
            return Vec::new();
        }
        let [index, name, temp, mem_used, mem_total, util, power] = [fields[0], fields[1], fields[2], fields[3], fields[4], fields[5], fields[6]];

        let Ok(mem_used_mib) = mem_used.parse::<f64>() else { return Vec::new() };
        let Ok(mem_total_mib) = mem_total.parse::<f64>() else { return Vec::new() };

        vec![GpuSample {
            device_id: index.to_string(),
            name: normalize_name(name),
            temperature: temp.parse::<f64>().ok(),
            // MiB → MB so the hub's GB axis matches SI (spec section 4.4).
            memory_used_mib: mem_used_mib / 1.024,
            memory_total_mib: mem_total_mib / 1.024,
            usage_pct: util.parse::<f64>().unwrap_or(0.0),
            power_watts: power.parse::<f64>().unwrap_or(0.0),
        }]
    }

    fn is_terminal(&self, line: &str) -> bool {
        line.contains("No devices were found") || line.contains("couldn't find libnvidia-ml.so")
    }
}

fn normalize_name(raw: &str) -> String {
    let without_prefix = raw.strip_prefix("NVIDIA ").unwrap_or(raw);
    without_prefix.strip_suffix(" Laptop GPU").unwrap_or(without_prefix).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_csv_line() {
        let mut p = NvidiaParser;
        let samples = p.parse_line("0, NVIDIA GeForce RTX 4090, 62, 4096, 24576, 35, 150.5");
        assert_eq!(samples.len(), 1);
        let s = &samples[0];
        assert_eq!(s.device_id, "0");
        assert_eq!(s.name, "GeForce RTX 4090");
        assert_eq!(s.temperature, Some(62.0));
        assert!((s.memory_used_mib - 4096.0 / 1.024).abs() < 1e-9);
        assert_eq!(s.usage_pct, 35.0);
        assert_eq!(s.power_watts, 150.5);
    }

    #[test]
    fn strips_laptop_gpu_suffix() {
        assert_eq!(normalize_name("NVIDIA GeForce RTX 4070 Laptop GPU"), "GeForce RTX 4070");
    }

    #[test]
    fn malformed_line_yields_no_samples() {
        let mut p = NvidiaParser;
        assert!(p.parse_line("garbage").is_empty());
    }

    #[test]
    fn terminal_detection() {
        let p = NvidiaParser;
        assert!(p.is_terminal("No devices were found"));
        assert!(!p.is_terminal("0, GeForce, 50, 100, 200, 10, 50"));
    }
}
