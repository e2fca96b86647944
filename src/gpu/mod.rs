//! Long-lived external GPU-stat processes whose line-delimited output is
//! parsed into aggregated counters and restarted on failure (spec section
//! 4.4).

pub mod amd;
pub mod nvidia;
pub mod probe;
pub mod tegra;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::snapshot::GpuStats;

pub type GpuDataMap = Arc<Mutex<HashMap<String, GpuStats>>>;

/// One parsed line's effect on the map: which device, and its instantaneous
/// readings this line represents.
pub struct GpuSample {
    pub device_id: String,
    pub name: String,
    pub temperature: Option<f64>,
    pub memory_used_mib: f64,
    pub memory_total_mib: f64,
    pub usage_pct: f64,
    pub power_watts: f64,
}

/// A parser turns one line of subprocess output into zero or more samples
/// (AMD's JSON line can report several `cardN` devices at once).
pub trait LineParser: Send + 'static {
    fn parse_line(&mut self, line: &str) -> Vec<GpuSample>;
    /// Some tools print an explicit "no GPU present" message; when this
    /// returns true for a line, the collector exits without restarting.
    fn is_terminal(&self, _line: &str) -> bool {
        false
    }
}

pub struct SubprocessCollector {
    data: GpuDataMap,
    handle: JoinHandle<()>,
}

impl SubprocessCollector {
    /// Probe tool availability (PATH lookup) before spawning the long-lived
    /// task; returns `None` if the tool isn't present.
    pub fn spawn<P: LineParser>(program: &str, args: &[&str], parser: P) -> Option<Self> {
        if which(program).is_none() {
            debug!(program, "gpu tool not found on PATH");
            return None;
        }

        let data: GpuDataMap = Arc::new(Mutex::new(HashMap::new()));
        let data_for_task = data.clone();
        let program = program.to_string();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();

        let handle = tokio::spawn(run_loop(program, args, parser, data_for_task));
        Some(Self { data, handle })
    }

    /// Takes the lock, computes `usage = usageSum/count`, `power =
    /// powerSum/count` for each entry, copies them out, and resets
    /// `count = 1` so a stale entry still returns its last average (spec
    /// section 4.4).
    pub async fn get_current_data(&self) -> HashMap<String, GpuStats> {
        let mut map = self.data.lock().await;
        map.iter_mut().map(|(id, stats)| (id.clone(), stats.read_and_decay())).collect()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

async fn run_loop<P: LineParser>(program: String, args: Vec<String>, mut parser: P, data: GpuDataMap) {
    loop {
        let child = Command::new(&program).args(&args).stdout(Stdio::piped()).stderr(Stdio::null()).kill_on_drop(true).spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, program, "failed to spawn gpu subprocess, retrying in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(stdout) = child.stdout.take() else {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        };

        let mut lines = BufReader::with_capacity(64 * 1024, stdout).lines();
        let mut terminal = false;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if parser.is_terminal(&line) {
                        terminal = true;
                        break;
                    }
                    let samples = parser.parse_line(&line);
                    if !samples.is_empty() {
                        let mut map = data.lock().await;
                        for sample in samples {
                            let entry = map.entry(sample.device_id).or_default();
                            entry.accumulate(&sample.name, sample.temperature, sample.memory_used_mib, sample.memory_total_mib, sample.usage_pct, sample.power_watts);
                        }
                    }
                }
                Ok(None) => break, // EOF
                Err(e) => {
                    warn!(error = %e, program, "gpu subprocess read error");
                    break;
                }
            }
        }

        let _ = child.kill().await;
        let _ = child.wait().await;

        if terminal {
            debug!(program, "gpu subprocess reported no device present, not restarting");
            return;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn which(program: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|p| p.join(program)).find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingParser {
        calls: usize,
    }
    impl LineParser for CountingParser {
        fn parse_line(&mut self, line: &str) -> Vec<GpuSample> {
            self.calls += 1;
            if line == "done" {
                return Vec::new();
            }
            vec![GpuSample {
                device_id: "0".into(),
                name: "Test GPU".into(),
                temperature: Some(60.0),
                memory_used_mib: 100.0,
                memory_total_mib: 1000.0,
                usage_pct: 50.0,
                power_watts: 20.0,
            }]
        }
        fn is_terminal(&self, line: &str) -> bool {
            line == "no devices found"
        }
    }

    #[test]
    fn terminal_line_detection() {
        let p = CountingParser { calls: 0 };
        assert!(p.is_terminal("no devices found"));
        assert!(!p.is_terminal("42, Test, 60"));
    }

    #[tokio::test]
    async fn read_and_decay_resets_count_to_one() {
        let mut s = GpuStats::default();
        s.accumulate("gpu0", Some(50.0), 100.0, 1000.0, 40.0, 10.0);
        s.accumulate("gpu0", Some(52.0), 100.0, 1000.0, 60.0, 20.0);
        let read1 = s.read_and_decay();
        assert_eq!(read1.usage_pct, 50.0); // (40+60)/2
        assert_eq!(s.count, 1);
        // No new sample arrives before the next read: returns the same average.
        let read2 = s.read_and_decay();
        assert_eq!(read2.usage_pct, 50.0);
    }
}
