//! Target comparisons that turn samples into prioritized recommendations

use super::{
    ImplementationEffort, MemoryPressureManager, OptimizationRecommendation, PerformanceMetrics,
    RecommendationMetric, SystemResourceMetrics, ThroughputOptimizer,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationTargets {
    pub max_error_rate: f64,
    pub min_success_rate: f64,
    pub min_throughput_activities_per_second: f64,
    /// Process memory above this multiple of its historical mean counts as fragmentation
    pub fragmentation_ratio: f64,
    pub max_database_query_time_ms: f64,
    pub max_io_wait_percent: f64,
    pub cpu_high_percent: f64,
    pub cpu_low_percent: f64,
    /// Only recommendations at or above this priority are applied automatically
    pub auto_apply_min_priority: u8,
}

impl Default for RecommendationTargets {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            min_success_rate: 0.95,
            min_throughput_activities_per_second: 50.0,
            fragmentation_ratio: 1.5,
            max_database_query_time_ms: 100.0,
            max_io_wait_percent: 20.0,
            cpu_high_percent: 80.0,
            cpu_low_percent: 30.0,
            auto_apply_min_priority: 9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedRecommendation {
    pub metric: RecommendationMetric,
    pub action: String,
}

/// Inputs for one analysis cycle.
#[derive(Debug, Clone, Copy)]
pub struct RecommendationInput<'a> {
    /// Latest figures for the migration under review, if any is active
    pub performance: Option<&'a PerformanceMetrics>,
    pub resources: &'a SystemResourceMetrics,
    /// Mean process memory over the sample history
    pub process_memory_mean_mb: Option<f64>,
}

pub struct RecommendationEngine {
    targets: RecommendationTargets,
    max_memory_usage_percent: f64,
    latest: Mutex<Vec<OptimizationRecommendation>>,
}

impl RecommendationEngine {
    pub fn new(targets: RecommendationTargets, max_memory_usage_percent: f64) -> Self {
        Self {
            targets,
            max_memory_usage_percent,
            latest: Mutex::new(Vec::new()),
        }
    }

    pub fn targets(&self) -> &RecommendationTargets {
        &self.targets
    }

    /// Run every analyzer and return recommendations, highest priority first.
    pub fn analyze(&self, input: RecommendationInput<'_>) -> Vec<OptimizationRecommendation> {
        let mut recommendations = Vec::new();

        if let Some(performance) = input.performance {
            self.analyze_errors(performance, &mut recommendations);
            self.analyze_throughput(performance, &mut recommendations);
            self.analyze_database(performance, &mut recommendations);
        }
        self.analyze_memory(&input, &mut recommendations);
        self.analyze_io_wait(input.resources, &mut recommendations);
        self.analyze_cpu(input.resources, &mut recommendations);

        sort_recommendations(&mut recommendations);
        debug!("Generated {} recommendations", recommendations.len());

        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = recommendations.clone();
        recommendations
    }

    pub fn latest(&self) -> Vec<OptimizationRecommendation> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn analyze_errors(&self, p: &PerformanceMetrics, out: &mut Vec<OptimizationRecommendation>) {
        if p.error_rate > self.targets.max_error_rate {
            out.push(OptimizationRecommendation {
                metric: RecommendationMetric::ErrorRate,
                current_value: p.error_rate,
                target_value: self.targets.max_error_rate,
                recommendation: "Error rate is above target; reduce batch size and inspect failing batches"
                    .to_string(),
                priority: 10,
                estimated_impact: 0.40,
                implementation_effort: ImplementationEffort::Medium,
            });
        }
        if p.success_rate < self.targets.min_success_rate {
            out.push(OptimizationRecommendation {
                metric: RecommendationMetric::SuccessRate,
                current_value: p.success_rate,
                target_value: self.targets.min_success_rate,
                recommendation: "Success rate is below target; add retries for transient batch failures"
                    .to_string(),
                priority: 9,
                estimated_impact: 0.30,
                implementation_effort: ImplementationEffort::Medium,
            });
        }
    }

    fn analyze_throughput(&self, p: &PerformanceMetrics, out: &mut Vec<OptimizationRecommendation>) {
        let target = self.targets.min_throughput_activities_per_second;
        if p.throughput_activities_per_second < target {
            out.push(OptimizationRecommendation {
                metric: RecommendationMetric::Throughput,
                current_value: p.throughput_activities_per_second,
                target_value: target,
                recommendation: "Throughput is below target; increase batch size or parallelism".to_string(),
                priority: 9,
                estimated_impact: 0.35,
                implementation_effort: ImplementationEffort::Medium,
            });
        }
    }

    fn analyze_database(&self, p: &PerformanceMetrics, out: &mut Vec<OptimizationRecommendation>) {
        let target = self.targets.max_database_query_time_ms;
        if p.database_query_time_ms > target {
            out.push(OptimizationRecommendation {
                metric: RecommendationMetric::DatabaseQueryTime,
                current_value: p.database_query_time_ms,
                target_value: target,
                recommendation: "Database writes are slow; review indexes and connection pool sizing"
                    .to_string(),
                priority: 9,
                estimated_impact: 0.25,
                implementation_effort: ImplementationEffort::High,
            });
        }
    }

    fn analyze_memory(&self, input: &RecommendationInput<'_>, out: &mut Vec<OptimizationRecommendation>) {
        let resources = input.resources;
        if resources.memory_percent > self.max_memory_usage_percent {
            out.push(OptimizationRecommendation {
                metric: RecommendationMetric::MemoryUsage,
                current_value: resources.memory_percent,
                target_value: self.max_memory_usage_percent,
                recommendation: "Memory usage is above target; run reclamation and trim caches".to_string(),
                priority: 9,
                estimated_impact: 0.30,
                implementation_effort: ImplementationEffort::Low,
            });
        }

        if let Some(mean) = input.process_memory_mean_mb.filter(|m| *m > 0.0) {
            let threshold = mean * self.targets.fragmentation_ratio;
            if resources.process_memory_mb > threshold {
                out.push(OptimizationRecommendation {
                    metric: RecommendationMetric::MemoryFragmentation,
                    current_value: resources.process_memory_mb,
                    target_value: threshold,
                    recommendation: "Process memory grew well past its average; check for retained buffers"
                        .to_string(),
                    priority: 7,
                    estimated_impact: 0.15,
                    implementation_effort: ImplementationEffort::Medium,
                });
            }
        }
    }

    fn analyze_io_wait(&self, resources: &SystemResourceMetrics, out: &mut Vec<OptimizationRecommendation>) {
        if resources.io_wait_percent > self.targets.max_io_wait_percent {
            out.push(OptimizationRecommendation {
                metric: RecommendationMetric::IoWait,
                current_value: resources.io_wait_percent,
                target_value: self.targets.max_io_wait_percent,
                recommendation: "High I/O wait; batch writes together or move to faster storage".to_string(),
                priority: 8,
                estimated_impact: 0.20,
                implementation_effort: ImplementationEffort::Medium,
            });
        }
    }

    fn analyze_cpu(&self, resources: &SystemResourceMetrics, out: &mut Vec<OptimizationRecommendation>) {
        if resources.cpu_percent > self.targets.cpu_high_percent {
            out.push(OptimizationRecommendation {
                metric: RecommendationMetric::CpuHigh,
                current_value: resources.cpu_percent,
                target_value: self.targets.cpu_high_percent,
                recommendation: "CPU is saturated; reduce worker threads".to_string(),
                priority: 8,
                estimated_impact: 0.25,
                implementation_effort: ImplementationEffort::Low,
            });
        } else if resources.cpu_percent < self.targets.cpu_low_percent {
            out.push(OptimizationRecommendation {
                metric: RecommendationMetric::CpuLow,
                current_value: resources.cpu_percent,
                target_value: self.targets.cpu_low_percent,
                recommendation: "CPU is underused; add worker threads".to_string(),
                priority: 6,
                estimated_impact: 0.15,
                implementation_effort: ImplementationEffort::Low,
            });
        }
    }

    /// Apply every recommendation that is high priority and low effort.
    pub fn auto_apply(
        &self,
        recommendations: &[OptimizationRecommendation],
        memory: &MemoryPressureManager,
        optimizer: &ThroughputOptimizer,
    ) -> Vec<AppliedRecommendation> {
        let mut applied = Vec::new();

        for rec in recommendations.iter().filter(|r| {
            r.priority >= self.targets.auto_apply_min_priority
                && r.implementation_effort == ImplementationEffort::Low
        }) {
            let action = match rec.metric {
                RecommendationMetric::MemoryUsage | RecommendationMetric::MemoryFragmentation => {
                    let reclaimed = memory.run_reclamation();
                    let eviction = memory.cache().evict();
                    format!(
                        "reclamation pass freed {} bytes, cache eviction removed {} entries",
                        reclaimed,
                        eviction.removed()
                    )
                }
                RecommendationMetric::CpuHigh => {
                    format!("thread count reduced to {}", optimizer.nudge_threads(-1))
                }
                RecommendationMetric::CpuLow => {
                    format!("thread count raised to {}", optimizer.nudge_threads(1))
                }
                _ => continue,
            };
            info!("Auto-applied {} recommendation: {}", rec.metric, action);
            applied.push(AppliedRecommendation {
                metric: rec.metric,
                action,
            });
        }

        applied
    }
}

impl std::fmt::Debug for RecommendationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationEngine")
            .field("targets", &self.targets)
            .field("max_memory_usage_percent", &self.max_memory_usage_percent)
            .finish()
    }
}

/// Priority descending, then estimated impact descending.
pub fn sort_recommendations(recommendations: &mut [OptimizationRecommendation]) {
    recommendations.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then_with(|| {
            b.estimated_impact
                .partial_cmp(&a.estimated_impact)
                .unwrap_or(Ordering::Equal)
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::{MemoryManagementConfig, OptimizerConfig};
    use chrono::Utc;

    fn engine() -> RecommendationEngine {
        RecommendationEngine::new(RecommendationTargets::default(), 80.0)
    }

    fn performance() -> PerformanceMetrics {
        PerformanceMetrics {
            timestamp: Utc::now(),
            migration_id: "m1".to_string(),
            throughput_activities_per_second: 200.0,
            average_latency_ms: 10.0,
            memory_usage_mb: 100.0,
            cpu_usage_percent: 50.0,
            io_wait_percent: 0.0,
            error_rate: 0.0,
            success_rate: 1.0,
            batch_processing_time_ms: 500.0,
            database_query_time_ms: 5.0,
            cache_hit_rate: 0.9,
            optimization_score: 100.0,
        }
    }

    fn resources(cpu_percent: f64, memory_percent: f64) -> SystemResourceMetrics {
        SystemResourceMetrics {
            cpu_percent,
            memory_percent,
            cpu_count: 4,
            ..SystemResourceMetrics::zeroed()
        }
    }

    #[test]
    fn test_healthy_inputs_produce_nothing() {
        let perf = performance();
        let res = resources(50.0, 50.0);
        let recs = engine().analyze(RecommendationInput {
            performance: Some(&perf),
            resources: &res,
            process_memory_mean_mb: None,
        });
        assert!(recs.is_empty());
    }

    #[test]
    fn test_sorted_by_priority_then_impact() {
        let perf = PerformanceMetrics {
            error_rate: 0.2,
            success_rate: 0.8,
            throughput_activities_per_second: 10.0,
            database_query_time_ms: 250.0,
            ..performance()
        };
        let res = SystemResourceMetrics {
            io_wait_percent: 30.0,
            ..resources(85.0, 90.0)
        };
        let recs = engine().analyze(RecommendationInput {
            performance: Some(&perf),
            resources: &res,
            process_memory_mean_mb: None,
        });

        let metrics: Vec<RecommendationMetric> = recs.iter().map(|r| r.metric).collect();
        assert_eq!(
            metrics,
            vec![
                RecommendationMetric::ErrorRate,
                RecommendationMetric::Throughput,
                RecommendationMetric::SuccessRate,
                RecommendationMetric::MemoryUsage,
                RecommendationMetric::DatabaseQueryTime,
                RecommendationMetric::CpuHigh,
                RecommendationMetric::IoWait,
            ]
        );
    }

    #[test]
    fn test_fragmentation_against_history_mean() {
        let res = SystemResourceMetrics {
            process_memory_mb: 400.0,
            ..resources(50.0, 50.0)
        };
        let recs = engine().analyze(RecommendationInput {
            performance: None,
            resources: &res,
            process_memory_mean_mb: Some(200.0),
        });
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].metric, RecommendationMetric::MemoryFragmentation);
        assert_eq!(recs[0].priority, 7);
    }

    #[test]
    fn test_only_memory_qualifies_for_auto_apply_by_default() {
        let engine = engine();
        let memory = MemoryPressureManager::new(MemoryManagementConfig::default());
        let optimizer = ThroughputOptimizer::new(OptimizerConfig::default());
        let threads_before = optimizer.current_thread_count();

        let res = resources(95.0, 90.0);
        let recs = engine.analyze(RecommendationInput {
            performance: None,
            resources: &res,
            process_memory_mean_mb: None,
        });
        let applied = engine.auto_apply(&recs, &memory, &optimizer);

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].metric, RecommendationMetric::MemoryUsage);
        assert_eq!(optimizer.current_thread_count(), threads_before);
        assert_eq!(memory.summary().reclamation_passes, 1);
    }

    #[test]
    fn test_cpu_auto_apply_when_priority_threshold_lowered() {
        let engine = RecommendationEngine::new(
            RecommendationTargets {
                auto_apply_min_priority: 8,
                ..RecommendationTargets::default()
            },
            80.0,
        );
        let memory = MemoryPressureManager::new(MemoryManagementConfig::default());
        let optimizer = ThroughputOptimizer::new(OptimizerConfig::default());

        let res = resources(95.0, 50.0);
        let recs = engine.analyze(RecommendationInput {
            performance: None,
            resources: &res,
            process_memory_mean_mb: None,
        });
        let applied = engine.auto_apply(&recs, &memory, &optimizer);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].metric, RecommendationMetric::CpuHigh);
        assert_eq!(optimizer.current_thread_count(), 3);
    }
}
