//! Adaptive batch size, thread count and strategy tuning

use super::SystemResourceMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStrategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl OptimizationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationStrategy::Conservative => "conservative",
            OptimizationStrategy::Balanced => "balanced",
            OptimizationStrategy::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning rules for [`ThroughputOptimizer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub initial_batch_size: usize,
    pub initial_thread_count: usize,
    /// Batches slower than this shrink
    pub long_processing_time_s: f64,
    /// Batches faster than this (with few errors) grow
    pub fast_processing_time_s: f64,
    pub batch_shrink_factor: f64,
    pub batch_growth_factor: f64,
    pub low_error_rate: f64,
    pub high_error_rate: f64,
    pub cpu_low_percent: f64,
    pub cpu_high_percent: f64,
    pub thread_step_up: usize,
    pub max_threads_per_cpu: usize,
    /// Aggressive strategy is only chosen below this memory percent
    pub aggressive_memory_ceiling: f64,
    pub history_capacity: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 100,
            max_batch_size: 10_000,
            initial_batch_size: 1_000,
            initial_thread_count: 4,
            long_processing_time_s: 60.0,
            fast_processing_time_s: 5.0,
            batch_shrink_factor: 0.7,
            batch_growth_factor: 1.3,
            low_error_rate: 0.01,
            high_error_rate: 0.05,
            cpu_low_percent: 50.0,
            cpu_high_percent: 90.0,
            thread_step_up: 2,
            max_threads_per_cpu: 2,
            aggressive_memory_ceiling: 70.0,
            history_capacity: 100,
        }
    }
}

/// One applied optimization decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchOptimization {
    pub migration_id: String,
    pub timestamp: DateTime<Utc>,
    pub previous_batch_size: usize,
    pub new_batch_size: usize,
    pub previous_thread_count: usize,
    pub new_thread_count: usize,
    pub previous_strategy: OptimizationStrategy,
    pub new_strategy: OptimizationStrategy,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerSummary {
    pub adaptive_batch_size: usize,
    pub adaptive_thread_count: usize,
    pub current_strategy: OptimizationStrategy,
    pub optimizations_applied: u64,
    pub recent_optimizations: Vec<BatchOptimization>,
}

#[derive(Debug)]
struct OptimizerState {
    batch_size: usize,
    thread_count: usize,
    strategy: OptimizationStrategy,
    applied: u64,
    history: VecDeque<BatchOptimization>,
    /// Last CPU count seen in a resource sample, 0 until one arrives
    cpu_count: usize,
}

/// Keeps the adaptive tuning state so successive calls compound.
#[derive(Debug)]
pub struct ThroughputOptimizer {
    config: OptimizerConfig,
    state: Mutex<OptimizerState>,
}

impl ThroughputOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let batch_size = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        let thread_count = config.initial_thread_count.max(1);
        Self {
            state: Mutex::new(OptimizerState {
                batch_size,
                thread_count,
                strategy: OptimizationStrategy::Balanced,
                applied: 0,
                history: VecDeque::new(),
                cpu_count: 0,
            }),
            config,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn optimize_batch(
        &self,
        migration_id: &str,
        current_batch_size: usize,
        processing_time_s: f64,
        error_rate: f64,
        resources: &SystemResourceMetrics,
    ) -> BatchOptimization {
        let c = &self.config;
        let mut state = self.lock();
        let mut reasons = Vec::new();

        let base = if current_batch_size > 0 {
            current_batch_size
        } else {
            state.batch_size
        };

        let proposed = if processing_time_s > c.long_processing_time_s {
            reasons.push(format!(
                "long processing time ({processing_time_s:.1}s), reducing batch size"
            ));
            (base as f64 * c.batch_shrink_factor).round() as usize
        } else if processing_time_s < c.fast_processing_time_s && error_rate < c.low_error_rate {
            reasons.push(format!(
                "fast processing ({processing_time_s:.1}s) with low error rate, increasing batch size"
            ));
            (base as f64 * c.batch_growth_factor).round() as usize
        } else {
            base
        };
        let new_batch_size = self.clamp_batch(proposed);
        if new_batch_size != proposed {
            reasons.push(format!("batch size clamped to {new_batch_size}"));
        }

        if resources.cpu_count > 0 {
            state.cpu_count = resources.cpu_count;
        }
        let max_threads = self.max_threads(state.cpu_count);
        let previous_thread_count = state.thread_count;
        let new_thread_count = if resources.cpu_percent < c.cpu_low_percent {
            reasons.push(format!(
                "CPU at {:.1}%, adding worker threads",
                resources.cpu_percent
            ));
            // Growth never lowers a count that is already above the cap.
            (previous_thread_count + c.thread_step_up)
                .min(max_threads)
                .max(previous_thread_count)
        } else if resources.cpu_percent > c.cpu_high_percent {
            reasons.push(format!(
                "CPU at {:.1}%, removing a worker thread",
                resources.cpu_percent
            ));
            previous_thread_count.saturating_sub(1).max(1)
        } else {
            previous_thread_count
        };

        let previous_strategy = state.strategy;
        let new_strategy = if error_rate > c.high_error_rate {
            OptimizationStrategy::Conservative
        } else if error_rate < c.low_error_rate
            && resources.memory_percent < c.aggressive_memory_ceiling
        {
            OptimizationStrategy::Aggressive
        } else {
            previous_strategy
        };
        if new_strategy != previous_strategy {
            reasons.push(format!("strategy {previous_strategy} -> {new_strategy}"));
        }

        let optimization = BatchOptimization {
            migration_id: migration_id.to_string(),
            timestamp: Utc::now(),
            previous_batch_size: base,
            new_batch_size,
            previous_thread_count,
            new_thread_count,
            previous_strategy,
            new_strategy,
            reasons,
        };

        state.batch_size = new_batch_size;
        state.thread_count = new_thread_count;
        state.strategy = new_strategy;
        state.applied += 1;
        if state.history.len() >= c.history_capacity.max(1) {
            state.history.pop_front();
        }
        state.history.push_back(optimization.clone());

        if base != new_batch_size || previous_thread_count != new_thread_count {
            info!(
                "Optimized {}: batch {} -> {}, threads {} -> {}, strategy {}",
                migration_id, base, new_batch_size, previous_thread_count, new_thread_count, new_strategy
            );
        } else {
            debug!("No tuning change for {}", migration_id);
        }

        optimization
    }

    /// Take an externally computed batch size (e.g. under memory pressure).
    pub fn adopt_batch_size(&self, batch_size: usize) -> usize {
        let clamped = self.clamp_batch(batch_size);
        let mut state = self.lock();
        if state.batch_size != clamped {
            info!("Adaptive batch size {} -> {}", state.batch_size, clamped);
        }
        state.batch_size = clamped;
        clamped
    }

    /// Remember the CPU count of a resource sample for later thread caps.
    pub fn observe_cpu_count(&self, cpu_count: usize) {
        if cpu_count > 0 {
            self.lock().cpu_count = cpu_count;
        }
    }

    /// Move the thread count by `delta`. Raising stops at the thread cap and
    /// lowering stops at 1; neither moves the count the other way.
    pub fn nudge_threads(&self, delta: i64) -> usize {
        let mut state = self.lock();
        let max_threads = self.max_threads(state.cpu_count);
        let current = state.thread_count;
        let next = if delta >= 0 {
            current
                .saturating_add(delta.unsigned_abs() as usize)
                .min(max_threads)
                .max(current)
        } else {
            current
                .saturating_sub(delta.unsigned_abs() as usize)
                .max(1)
                .min(current)
        };
        if next != state.thread_count {
            info!("Adaptive thread count {} -> {}", state.thread_count, next);
        }
        state.thread_count = next;
        next
    }

    pub fn current_batch_size(&self) -> usize {
        self.lock().batch_size
    }

    pub fn current_thread_count(&self) -> usize {
        self.lock().thread_count
    }

    pub fn current_strategy(&self) -> OptimizationStrategy {
        self.lock().strategy
    }

    pub fn history(&self) -> Vec<BatchOptimization> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn summary(&self, recent: usize) -> OptimizerSummary {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(recent);
        OptimizerSummary {
            adaptive_batch_size: state.batch_size,
            adaptive_thread_count: state.thread_count,
            current_strategy: state.strategy,
            optimizations_applied: state.applied,
            recent_optimizations: state.history.iter().skip(skip).cloned().collect(),
        }
    }

    fn clamp_batch(&self, batch_size: usize) -> usize {
        batch_size.clamp(self.config.min_batch_size, self.config.max_batch_size)
    }

    /// A zero CPU count (failed sample) falls back to the runtime's parallelism.
    fn max_threads(&self, cpu_count: usize) -> usize {
        let cpus = if cpu_count > 0 {
            cpu_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };
        (cpus * self.config.max_threads_per_cpu.max(1)).max(1)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OptimizerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ThroughputOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}
