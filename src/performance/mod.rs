//! Resource sampling and closed-loop tuning for migration workloads

pub mod memory;
pub mod optimization;
pub mod recommendations;
pub mod sampler;

pub use memory::*;
pub use optimization::*;
pub use recommendations::*;
pub use sampler::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Default number of samples kept per history
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// One OS-level resource snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemResourceMetrics {
    pub timestamp: DateTime<Utc>,
    pub memory_percent: f64,
    pub memory_available_mb: f64,
    pub memory_used_mb: f64,
    /// Resident memory of this process
    pub process_memory_mb: f64,
    pub cpu_percent: f64,
    pub cpu_count: usize,
    /// Cumulative bytes read by all visible processes
    pub disk_io_read_mb: f64,
    pub disk_io_write_mb: f64,
    /// Cumulative bytes over all interfaces
    pub network_io_sent_mb: f64,
    pub network_io_recv_mb: f64,
    pub load_average: LoadAverage,
    pub process_count: usize,
    pub thread_count: usize,
    pub io_wait_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl SystemResourceMetrics {
    /// Well-formed all-zero snapshot returned when sampling fails.
    pub fn zeroed() -> Self {
        Self {
            timestamp: Utc::now(),
            memory_percent: 0.0,
            memory_available_mb: 0.0,
            memory_used_mb: 0.0,
            process_memory_mb: 0.0,
            cpu_percent: 0.0,
            cpu_count: 0,
            disk_io_read_mb: 0.0,
            disk_io_write_mb: 0.0,
            network_io_sent_mb: 0.0,
            network_io_recv_mb: 0.0,
            load_average: LoadAverage::default(),
            process_count: 0,
            thread_count: 0,
            io_wait_percent: 0.0,
        }
    }
}

/// Per-migration performance figures derived each monitoring cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub timestamp: DateTime<Utc>,
    pub migration_id: String,
    pub throughput_activities_per_second: f64,
    pub average_latency_ms: f64,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    pub io_wait_percent: f64,
    pub error_rate: f64,
    pub success_rate: f64,
    pub batch_processing_time_ms: f64,
    pub database_query_time_ms: f64,
    pub cache_hit_rate: f64,
    pub optimization_score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationEffort {
    Low,
    Medium,
    High,
}

impl ImplementationEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImplementationEffort::Low => "low",
            ImplementationEffort::Medium => "medium",
            ImplementationEffort::High => "high",
        }
    }
}

impl fmt::Display for ImplementationEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a recommendation is about; drives auto-apply dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationMetric {
    ErrorRate,
    SuccessRate,
    Throughput,
    MemoryUsage,
    MemoryFragmentation,
    DatabaseQueryTime,
    IoWait,
    CpuHigh,
    CpuLow,
}

impl RecommendationMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationMetric::ErrorRate => "error_rate",
            RecommendationMetric::SuccessRate => "success_rate",
            RecommendationMetric::Throughput => "throughput",
            RecommendationMetric::MemoryUsage => "memory_usage",
            RecommendationMetric::MemoryFragmentation => "memory_fragmentation",
            RecommendationMetric::DatabaseQueryTime => "database_query_time",
            RecommendationMetric::IoWait => "io_wait",
            RecommendationMetric::CpuHigh => "cpu_high",
            RecommendationMetric::CpuLow => "cpu_low",
        }
    }
}

impl fmt::Display for RecommendationMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationRecommendation {
    pub metric: RecommendationMetric,
    pub current_value: f64,
    pub target_value: f64,
    pub recommendation: String,
    /// 1 (lowest) to 10 (highest)
    pub priority: u8,
    /// Expected relative improvement, 0 to 1
    pub estimated_impact: f64,
    pub implementation_effort: ImplementationEffort,
}

/// Fixed-capacity sample history; the oldest sample is evicted first.
#[derive(Debug)]
pub struct MetricsHistory<T> {
    name: &'static str,
    capacity: usize,
    samples: Mutex<VecDeque<T>>,
}

impl<T: Clone> MetricsHistory<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    pub fn push(&self, sample: T) {
        let mut samples = self.lock();
        while samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<T> {
        self.lock().back().cloned()
    }

    /// Most recent `n` samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<T> {
        let samples = self.lock();
        let skip = samples.len().saturating_sub(n);
        samples.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mean of `f` over all samples, None when empty.
    pub fn mean_by(&self, f: impl Fn(&T) -> f64) -> Option<f64> {
        let samples = self.lock();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().map(f).sum::<f64>() / samples.len() as f64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send> Reclaimable for MetricsHistory<T> {
    fn name(&self) -> &str {
        self.name
    }

    /// Keep the newest quarter of samples and give back spare capacity.
    /// A history with nothing to drop keeps its allocation and reports 0.
    fn reclaim(&self) -> u64 {
        let mut samples = self.lock();
        let before = samples.capacity();
        let keep = (samples.len() / 4).max(1).min(samples.len());
        let excess = samples.len() - keep;
        if excess == 0 {
            return 0;
        }
        samples.drain(..excess);
        samples.shrink_to_fit();
        let released = before.saturating_sub(samples.capacity());
        (released * std::mem::size_of::<T>()) as u64
    }
}
