//! `rocm-smi ... --json` parser, invoked from a loop that sleeps 3.7s
//! between polls (spec section 4.4 / design note section 9: the shell
//! wrapper's cadence is reproduced from the collector loop itself).

use serde_json::Value;

use super::{GpuSample, LineParser};

pub const PROGRAM: &str = "rocm-smi";
pub fn args() -> Vec<&'static str> {
    vec!["--showtemp", "--showmeminfo", "vram", "--showuse", "--showpower", "--json"]
}

/// Reproduces the effect of the source's `while true; do rocm-smi ...;
/// sleep 3.7; done` wrapper without a shell: the collector loop itself
/// sleeps 3.7s between invocations of a one-shot command rather than
/// reading from a streaming process.
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(3_700);

#[derive(Default)]
pub struct AmdParser;

impl LineParser for AmdParser {
    fn parse_line(&mut self, line: &str) -> Vec<GpuSample> {
        let Ok(Value::Object(root)) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };

        root.into_iter()
            .filter(|(key, _)| key.starts_with("card"))
            .filter_map(|(card, v)| {
                let temp = field_f64(&v, &["Temperature (Sensor edge) (C)", "Temperature (Sensor junction) (C)"]);
                let vram_bytes = field_f64(&v, &["VRAM Total Memory (B)"]);
                let vram_used_bytes = field_f64(&v, &["VRAM Total Used Memory (B)"]);
                let usage = field_f64(&v, &["GPU use (%)"]).unwrap_or(0.0);
                let power = field_f64(&v, &["Average Graphics Package Power (W)"]).unwrap_or(0.0);
                let series = v.get("Card series").and_then(|s| s.as_str()).unwrap_or(&card).to_string();
                let device_id = v.get("Device ID").and_then(|s| s.as_str()).map(|s| s.to_string()).unwrap_or(card);

                Some(GpuSample {
                    device_id,
                    name: series,
                    temperature: temp,
                    memory_used_mib: vram_used_bytes.unwrap_or(0.0) / 1_048_576.0,
                    memory_total_mib: vram_bytes.unwrap_or(0.0) / 1_048_576.0,
                    usage_pct: usage,
                    power_watts: power,
                })
            })
            .collect()
    }
}

fn field_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| v.get(*k)).and_then(|val| match val {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_card_keyed_json_object() {
        let mut p = AmdParser;
        let line = r#"{"card0": {"Device ID": "0x73bf", "Card series": "Radeon RX 6800", "Temperature (Sensor edge) (C)": "55.0", "VRAM Total Memory (B)": "17179869184", "VRAM Total Used Memory (B)": "2147483648", "GPU use (%)": "42", "Average Graphics Package Power (W)": "120.5"}}"#;
        let samples = p.parse_line(line);
        assert_eq!(samples.len(), 1);
        let s = &samples[0];
        assert_eq!(s.device_id, "0x73bf");
        assert_eq!(s.name, "Radeon RX 6800");
        assert_eq!(s.temperature, Some(55.0));
        assert!((s.memory_total_mib - 16384.0).abs() < 1.0);
        assert_eq!(s.usage_pct, 42.0);
    }

    #[test]
    fn non_card_keys_are_ignored() {
        let mut p = AmdParser;
        let line = r#"{"system": {"foo": "bar"}}"#;
        assert!(p.parse_line(line).is_empty());
    }
}
