use super::{HealthStatus, MigrationState, MigrationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator-facing health summary for one active migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationHealthMetrics {
    pub migration_id: String,
    pub user_id: String,
    pub configuration_id: String,
    pub status: MigrationStatus,
    pub health_status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub progress_percentage: f64,
    pub success_rate: f64,
    pub performance_score: f64,
    pub throughput_activities_per_second: f64,
    pub average_batch_time_seconds: f64,
    pub error_count: u64,
    pub warning_count: u64,
    pub batch_count: u64,
    pub completed_batches: u64,
    pub failed_batches: u64,
    pub total_activities: u64,
    pub processed_activities: u64,
}

/// Score weights; the defaults cap each penalty as the health score contract requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthScoring {
    pub error_penalty: f64,
    pub max_error_penalty: f64,
    pub warning_penalty: f64,
    pub max_warning_penalty: f64,
    pub failed_batch_weight: f64,
    pub healthy_score: f64,
    pub degraded_score: f64,
}

impl Default for HealthScoring {
    fn default() -> Self {
        Self {
            error_penalty: 5.0,
            max_error_penalty: 50.0,
            warning_penalty: 2.0,
            max_warning_penalty: 20.0,
            failed_batch_weight: 30.0,
            healthy_score: 80.0,
            degraded_score: 50.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthMetricsCalculator {
    scoring: HealthScoring,
}

impl HealthMetricsCalculator {
    pub fn new(scoring: HealthScoring) -> Self {
        Self { scoring }
    }

    /// Derive health figures from a state snapshot as of `now`.
    pub fn calculate(&self, state: &MigrationState, now: DateTime<Utc>) -> MigrationHealthMetrics {
        let elapsed_seconds = (now - state.start_time)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let performance_score = self.performance_score(state);

        MigrationHealthMetrics {
            migration_id: state.migration_id.clone(),
            user_id: state.user_id.clone(),
            configuration_id: state.configuration_id.clone(),
            status: state.status,
            health_status: self.classify(performance_score),
            timestamp: now,
            start_time: state.start_time,
            last_activity: state.last_activity,
            elapsed_seconds,
            progress_percentage: progress_percentage(state),
            success_rate: success_rate(state),
            performance_score,
            throughput_activities_per_second: if elapsed_seconds > 0.0 {
                state.processed_activities as f64 / elapsed_seconds
            } else {
                0.0
            },
            average_batch_time_seconds: if state.completed_batches > 0 {
                elapsed_seconds / state.completed_batches as f64
            } else {
                0.0
            },
            error_count: state.error_count,
            warning_count: state.warning_count,
            batch_count: state.batch_count,
            completed_batches: state.completed_batches,
            failed_batches: state.failed_batches,
            total_activities: state.total_activities,
            processed_activities: state.processed_activities,
        }
    }

    pub fn performance_score(&self, state: &MigrationState) -> f64 {
        let s = &self.scoring;
        let error_penalty = (state.error_count as f64 * s.error_penalty).min(s.max_error_penalty);
        let warning_penalty =
            (state.warning_count as f64 * s.warning_penalty).min(s.max_warning_penalty);
        let failure_penalty =
            state.failed_batches as f64 / state.batch_count.max(1) as f64 * s.failed_batch_weight;

        (100.0 - error_penalty - warning_penalty - failure_penalty).clamp(0.0, 100.0)
    }

    fn classify(&self, score: f64) -> HealthStatus {
        if score >= self.scoring.healthy_score {
            HealthStatus::Healthy
        } else if score >= self.scoring.degraded_score {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

fn progress_percentage(state: &MigrationState) -> f64 {
    if state.total_activities == 0 {
        return 0.0;
    }
    (state.processed_activities as f64 / state.total_activities as f64 * 100.0).clamp(0.0, 100.0)
}

fn success_rate(state: &MigrationState) -> f64 {
    if state.batch_count == 0 {
        return 0.0;
    }
    (state.completed_batches as f64 / state.batch_count as f64).clamp(0.0, 1.0)
}
