//! OS resource snapshots via sysinfo, with /proc extras on Linux

use super::{LoadAverage, SystemResourceMetrics};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Networks, System};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Gap between the two CPU refreshes a usage reading needs
    pub cpu_sample_window_ms: u64,
    /// Include per-process disk I/O and process count (costly on busy hosts)
    pub include_processes: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            cpu_sample_window_ms: 500,
            include_processes: true,
        }
    }
}

struct SamplerState {
    system: System,
    networks: Networks,
}

/// Reads a [`SystemResourceMetrics`] snapshot on demand.
///
/// Concurrent callers are serialized; each sample takes roughly the configured
/// CPU window.
pub struct ResourceSampler {
    config: SamplerConfig,
    state: Mutex<SamplerState>,
}

impl ResourceSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SamplerState {
                system: System::new(),
                networks: Networks::new_with_refreshed_list(),
            }),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Take one snapshot. Never fails; a zeroed snapshot stands in for errors.
    pub async fn sample(&self) -> SystemResourceMetrics {
        let window = Duration::from_millis(self.config.cpu_sample_window_ms)
            .max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

        let mut state = self.state.lock().await;

        let cpu_before = read_cpu_times();
        state.system.refresh_cpu();
        tokio::time::sleep(window).await;
        state.system.refresh_cpu();
        let cpu_after = read_cpu_times();

        state.system.refresh_memory();
        state.networks.refresh();
        if self.config.include_processes {
            state.system.refresh_processes();
        } else if let Ok(pid) = sysinfo::get_current_pid() {
            state.system.refresh_process(pid);
        }

        let total_memory = state.system.total_memory();
        if total_memory == 0 {
            warn!("Resource sampling returned no memory information; using zeroed snapshot");
            return SystemResourceMetrics::zeroed();
        }

        let snapshot = build_snapshot(&state, cpu_before, cpu_after, self.config.include_processes);
        debug!(
            "Resource sample: cpu {:.1}%, memory {:.1}%, io wait {:.1}%",
            snapshot.cpu_percent, snapshot.memory_percent, snapshot.io_wait_percent
        );
        snapshot
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new(SamplerConfig::default())
    }
}

fn build_snapshot(
    state: &SamplerState,
    cpu_before: Option<CpuTimes>,
    cpu_after: Option<CpuTimes>,
    include_processes: bool,
) -> SystemResourceMetrics {
    let system = &state.system;
    let total = system.total_memory() as f64;
    let available = system.available_memory() as f64;
    let used = system.used_memory() as f64;

    let cpu_percent = finite_or_zero(system.global_cpu_info().cpu_usage() as f64).clamp(0.0, 100.0);

    let (disk_read, disk_written, process_count) = if include_processes {
        let (read, written) = system
            .processes()
            .values()
            .fold((0u64, 0u64), |(read, written), process| {
                let usage = process.disk_usage();
                (
                    read.saturating_add(usage.total_read_bytes),
                    written.saturating_add(usage.total_written_bytes),
                )
            });
        (read, written, system.processes().len())
    } else {
        (0, 0, 0)
    };

    let (sent, received) = state
        .networks
        .iter()
        .fold((0u64, 0u64), |(sent, received), (_name, data)| {
            (
                sent.saturating_add(data.total_transmitted()),
                received.saturating_add(data.total_received()),
            )
        });

    let process_memory = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| system.process(pid))
        .map(|process| process.memory())
        .unwrap_or(0);

    let load = System::load_average();

    SystemResourceMetrics {
        timestamp: Utc::now(),
        memory_percent: (used / total * 100.0).clamp(0.0, 100.0),
        memory_available_mb: available / BYTES_PER_MB,
        memory_used_mb: used / BYTES_PER_MB,
        process_memory_mb: process_memory as f64 / BYTES_PER_MB,
        cpu_percent,
        cpu_count: system.cpus().len().max(1),
        disk_io_read_mb: disk_read as f64 / BYTES_PER_MB,
        disk_io_write_mb: disk_written as f64 / BYTES_PER_MB,
        network_io_sent_mb: sent as f64 / BYTES_PER_MB,
        network_io_recv_mb: received as f64 / BYTES_PER_MB,
        load_average: LoadAverage {
            one: finite_or_zero(load.one),
            five: finite_or_zero(load.five),
            fifteen: finite_or_zero(load.fifteen),
        },
        process_count,
        thread_count: current_thread_count(),
        io_wait_percent: io_wait_percent(cpu_before, cpu_after),
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Aggregate jiffies from the first line of /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    total: u64,
    iowait: u64,
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    Some(CpuTimes {
        total: fields.iter().sum(),
        iowait: fields[4],
    })
}

fn io_wait_percent(before: Option<CpuTimes>, after: Option<CpuTimes>) -> f64 {
    match (before, after) {
        (Some(before), Some(after)) if after.total > before.total => {
            let iowait = after.iowait.saturating_sub(before.iowait) as f64;
            (iowait / (after.total - before.total) as f64 * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}

fn parse_thread_count(status: &str) -> Option<usize> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("Threads:"))
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    std::fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|s| parse_cpu_times(&s))
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_times() -> Option<CpuTimes> {
    None
}

#[cfg(target_os = "linux")]
fn current_thread_count() -> usize {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| parse_thread_count(&s))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn current_thread_count() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_times() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let times = parse_cpu_times(stat).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.iowait, 50);
        assert!(parse_cpu_times("intr 1 2 3").is_none());
    }

    #[test]
    fn test_io_wait_percent_from_deltas() {
        let before = CpuTimes { total: 1000, iowait: 50 };
        let after = CpuTimes { total: 1200, iowait: 90 };
        assert!((io_wait_percent(Some(before), Some(after)) - 20.0).abs() < 1e-9);
        assert_eq!(io_wait_percent(Some(after), Some(after)), 0.0);
        assert_eq!(io_wait_percent(None, Some(after)), 0.0);
    }

    #[test]
    fn test_parse_thread_count() {
        let status = "Name:\tmigration\nState:\tS (sleeping)\nThreads:\t17\n";
        assert_eq!(parse_thread_count(status), Some(17));
        assert_eq!(parse_thread_count("Name:\tx\n"), None);
    }

    #[tokio::test]
    async fn test_sample_is_within_ranges() {
        let sampler = ResourceSampler::new(SamplerConfig {
            cpu_sample_window_ms: 50,
            include_processes: false,
        });
        let sample = sampler.sample().await;

        assert!((0.0..=100.0).contains(&sample.cpu_percent));
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!((0.0..=100.0).contains(&sample.io_wait_percent));
        assert!(sample.memory_used_mb >= 0.0);
    }
}
