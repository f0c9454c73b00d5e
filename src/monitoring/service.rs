//! The monitor facade: registry, alerting, sink, tuning and background loops.

use super::{
    Alert, AlertEvaluator, AlertQuery, AlertSeverity, BatchDetails, EventSink, FlagTransition,
    HealthMetricsCalculator, LifecycleDetails, LogDetails, LogEntry, LogLevel, LogQuery,
    MigrationHealthMetrics, MigrationRegistry, MigrationState, MigrationStatus,
    MigrationSummaryDetails, MonitorMetrics, MonitoringEvent, MonitoringEventType,
    MonitoringRepository, SinkStatsSnapshot,
};
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::performance::{
    AppliedRecommendation, BatchOptimization, MemoryManagementReport, MemoryManagerSummary,
    MemoryPressureManager, MetricsHistory, OptimizationRecommendation, OptimizerSummary,
    PerformanceMetrics, PeriodicCleanup, PressureLevel, RecommendationEngine,
    RecommendationInput, ResourceSampler, SystemResourceMetrics, ThroughputOptimizer,
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const MONITOR_SOURCE: &str = "migration_monitor";

/// Number of recent optimizations included in the summary
const SUMMARY_RECENT_OPTIMIZATIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSummary {
    pub active_migrations: usize,
    pub optimizer: OptimizerSummary,
    pub memory: MemoryManagerSummary,
    pub latest_resources: Option<SystemResourceMetrics>,
    pub latest_recommendations: Vec<OptimizationRecommendation>,
    pub resource_samples: usize,
    pub performance_samples: usize,
    pub sink: SinkStatsSnapshot,
}

/// What one pass of the monitoring loop observed and did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringCycleReport {
    pub resources: SystemResourceMetrics,
    pub performance: Vec<PerformanceMetrics>,
    pub recommendations: Vec<OptimizationRecommendation>,
    pub applied: Vec<AppliedRecommendation>,
    pub memory: Option<MemoryManagementReport>,
    pub periodic_cleanup: Option<PeriodicCleanup>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub logs_deleted: u64,
    pub alerts_deleted: u64,
    /// False when either delete failed; counts reflect what did succeed
    pub completed: bool,
}

/// Entry point for batch processors and admin tooling.
///
/// Producer calls (`start_monitoring`, `log_event`, `log_batch_event`,
/// `stop_monitoring`) never block; persistence happens on background
/// consumers. Nothing here returns an error to the caller: failures are
/// logged and surface as `false`, `None` or an empty list.
pub struct MigrationMonitor {
    config: MonitorConfig,
    repository: Arc<dyn MonitoringRepository>,
    registry: MigrationRegistry,
    sink: EventSink,
    evaluator: AlertEvaluator,
    health: HealthMetricsCalculator,
    sampler: ResourceSampler,
    memory: Arc<MemoryPressureManager>,
    optimizer: Arc<ThroughputOptimizer>,
    recommendations: RecommendationEngine,
    resource_history: Arc<MetricsHistory<SystemResourceMetrics>>,
    performance_history: Arc<MetricsHistory<PerformanceMetrics>>,
    metrics: Arc<MonitorMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
    last_cleanup: Mutex<Instant>,
    shut_down: AtomicBool,
}

impl MigrationMonitor {
    /// Build the monitor and spawn its consumers and loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: MonitorConfig,
        repository: Arc<dyn MonitoringRepository>,
    ) -> Result<Arc<Self>> {
        let monitor = Arc::new(Self::build(config, repository)?);
        let loops = vec![monitor.spawn_monitoring_loop(), monitor.spawn_retention_loop()];
        *monitor
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = loops;

        info!(
            "Migration monitor started (interval {}s, retention every {}s)",
            monitor.config.monitoring_interval_secs, monitor.config.retention.cleanup_interval_secs
        );
        Ok(monitor)
    }

    /// Build without background loops; the sink consumers still run.
    ///
    /// Cycles and retention can then be driven by hand.
    pub fn start_without_loops(
        config: MonitorConfig,
        repository: Arc<dyn MonitoringRepository>,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::build(config, repository)?))
    }

    fn build(config: MonitorConfig, repository: Arc<dyn MonitoringRepository>) -> Result<Self> {
        let metrics = Arc::new(MonitorMetrics::new()?);
        let (shutdown_tx, _) = broadcast::channel(4);
        let sink = EventSink::start(
            repository.clone(),
            &config.sink,
            metrics.clone(),
            shutdown_tx.clone(),
        );

        let memory = Arc::new(MemoryPressureManager::new(config.memory.clone()));
        let optimizer = Arc::new(ThroughputOptimizer::new(config.optimizer.clone()));
        let resource_history = Arc::new(MetricsHistory::new(
            "resource_history",
            config.history_capacity,
        ));
        let performance_history = Arc::new(MetricsHistory::new(
            "performance_history",
            config.history_capacity,
        ));
        memory.register_reclaimable(resource_history.clone());
        memory.register_reclaimable(performance_history.clone());

        metrics.update_tuning(optimizer.current_batch_size(), optimizer.current_thread_count());

        Ok(Self {
            evaluator: AlertEvaluator::new(config.alerting.clone()),
            health: HealthMetricsCalculator::new(config.health.clone()),
            sampler: ResourceSampler::new(config.sampler.clone()),
            recommendations: RecommendationEngine::new(
                config.targets.clone(),
                config.memory.max_memory_usage_percent,
            ),
            registry: MigrationRegistry::new(),
            repository,
            sink,
            memory,
            optimizer,
            resource_history,
            performance_history,
            metrics,
            shutdown_tx,
            background: Mutex::new(Vec::new()),
            last_cleanup: Mutex::new(Instant::now()),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Structures batch processors fill so memory relief has something to give back.
    ///
    /// Cache lookups for reusable rows go through `cache()`, payload buffers
    /// are taken from and returned to `buffer_pool()`, and large transient
    /// objects are registered in `weak_refs()`. Each pressure tier then evicts
    /// from the cache, shrinks the pool and drops the weak handles, and the
    /// cache hit rate feeds the per-migration performance figures.
    pub fn memory_manager(&self) -> &Arc<MemoryPressureManager> {
        &self.memory
    }

    pub fn optimizer(&self) -> &Arc<ThroughputOptimizer> {
        &self.optimizer
    }

    // ---- batch processor API ----

    /// Begin tracking a migration. False if it is already active.
    pub fn start_monitoring(&self, migration_id: &str, user_id: &str, configuration_id: &str) -> bool {
        if migration_id.trim().is_empty() {
            warn!("Refusing to monitor a migration with an empty id");
            return false;
        }

        let state = MigrationState::new(migration_id, user_id, configuration_id);
        if !self.registry.insert(state) {
            warn!("Migration {} is already being monitored", migration_id);
            return false;
        }
        self.metrics.active_migrations.set(self.registry.len() as i64);

        self.sink.enqueue_event(MonitoringEvent::new(
            migration_id,
            Some(user_id.to_string()),
            MonitoringEventType::MigrationStarted,
            json!({ "configuration_id": configuration_id }),
            MONITOR_SOURCE,
        ));
        self.sink.enqueue_log(
            LogEntry::new(
                migration_id,
                LogLevel::Info,
                "Migration monitoring started",
                MONITOR_SOURCE,
            )
            .with_user(Some(user_id.to_string()))
            .with_details(LogDetails::Lifecycle(LifecycleDetails {
                configuration_id: configuration_id.to_string(),
                status: MigrationStatus::Running,
            })),
        );

        info!("Started monitoring migration {} for user {}", migration_id, user_id);
        true
    }

    pub fn set_total_activities(&self, migration_id: &str, total: u64) -> bool {
        let updated = self
            .registry
            .update(migration_id, |state| state.set_total_activities(total))
            .is_some();
        if !updated {
            debug!("set_total_activities for inactive migration {}", migration_id);
        }
        updated
    }

    /// Move an active migration between non-terminal statuses (e.g. pause/resume).
    pub fn update_status(&self, migration_id: &str, status: MigrationStatus) -> bool {
        if status.is_terminal() {
            warn!(
                "Status {} for {} must be set through stop_monitoring",
                status, migration_id
            );
            return false;
        }

        let change = self.registry.update(migration_id, |state| {
            let previous = state.status;
            state.status = status;
            state.last_activity = Utc::now();
            (previous, state.user_id.clone(), state.configuration_id.clone())
        });
        let Some((previous, user_id, configuration_id)) = change else {
            return false;
        };

        if previous != status {
            self.sink.enqueue_event(MonitoringEvent::new(
                migration_id,
                Some(user_id.clone()),
                MonitoringEventType::StatusChanged,
                json!({ "from": previous, "to": status }),
                MONITOR_SOURCE,
            ));
            self.sink.enqueue_log(
                LogEntry::new(
                    migration_id,
                    LogLevel::Info,
                    format!("Migration status changed from {previous} to {status}"),
                    MONITOR_SOURCE,
                )
                .with_user(Some(user_id))
                .with_details(LogDetails::Lifecycle(LifecycleDetails {
                    configuration_id,
                    status,
                })),
            );
            info!("Migration {} status {} -> {}", migration_id, previous, status);
        }
        true
    }

    /// Ingest a log entry: update counters, evaluate alert rules, enqueue.
    ///
    /// Entries for migrations that are not active are still persisted and
    /// checked by the rules that do not need running counters.
    pub fn log_event(&self, entry: LogEntry) -> bool {
        mirror_to_tracing(&entry);

        let fired = self
            .registry
            .update(&entry.migration_id, |state| {
                state.record_log(entry.level);
                self.evaluator.evaluate(&entry, Some(state))
            })
            .unwrap_or_else(|| self.evaluator.evaluate(&entry, None));

        let accepted = self.sink.enqueue_log(entry);

        for fired in fired {
            self.metrics.record_alert(fired.alert.alert_type.as_str());
            self.sink.enqueue_alert(fired.alert);
            self.sink.enqueue_log(fired.log);
            self.sink.enqueue_event(fired.event);
        }

        accepted
    }

    /// Convenience wrapper for a plain message without details.
    pub fn log(&self, migration_id: &str, level: LogLevel, message: &str, source: &str) -> bool {
        self.log_event(LogEntry::new(migration_id, level, message, source))
    }

    /// Record one batch outcome. False if the migration is not active.
    pub fn log_batch_event(&self, migration_id: &str, user_id: Option<&str>, batch: BatchDetails) -> bool {
        let recorded = self
            .registry
            .update(migration_id, |state| {
                state.record_batch(batch.success, batch.activities_count, batch.processing_time_s);
                state.user_id.clone()
            });
        let Some(state_user) = recorded else {
            warn!("Batch event for inactive migration {}", migration_id);
            return false;
        };
        let user_id = user_id.map(str::to_string).unwrap_or(state_user);

        self.metrics.record_batch(batch.success, batch.processing_time_s);

        let (event_type, level, message) = if batch.success {
            (
                MonitoringEventType::BatchCompleted,
                LogLevel::Info,
                format!(
                    "Batch {} completed: {} activities in {:.2}s",
                    batch.batch_number, batch.activities_count, batch.processing_time_s
                ),
            )
        } else {
            (
                MonitoringEventType::BatchFailed,
                LogLevel::Error,
                format!(
                    "Batch {} failed: {}",
                    batch.batch_number,
                    batch.error_message.as_deref().unwrap_or("unknown error")
                ),
            )
        };

        self.sink.enqueue_event(MonitoringEvent::new(
            migration_id,
            Some(user_id.clone()),
            event_type,
            json!({
                "batch_number": batch.batch_number,
                "success": batch.success,
                "activities_count": batch.activities_count,
                "processing_time_s": batch.processing_time_s,
                "error_message": batch.error_message,
            }),
            MONITOR_SOURCE,
        ));

        let execution_time = Some(batch.processing_time_s);
        self.log_event(
            LogEntry::new(migration_id, level, message, MONITOR_SOURCE)
                .with_user(Some(user_id))
                .with_details(LogDetails::Batch(batch))
                .with_execution_time(execution_time),
        );
        true
    }

    /// Finalize a migration with a terminal status. False when it is not
    /// active, so a second call is harmless, and for non-terminal statuses.
    pub fn stop_monitoring(&self, migration_id: &str, final_status: MigrationStatus) -> bool {
        if !final_status.is_terminal() {
            warn!(
                "Status {} for {} is not a final status; use update_status",
                final_status, migration_id
            );
            return false;
        }

        let Some(state) = self.registry.remove(migration_id) else {
            debug!("stop_monitoring for inactive migration {}", migration_id);
            return false;
        };
        self.metrics.active_migrations.set(self.registry.len() as i64);

        let now = Utc::now();
        let summary = MigrationSummaryDetails {
            final_status,
            duration_seconds: (now - state.start_time)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            batch_count: state.batch_count,
            completed_batches: state.completed_batches,
            failed_batches: state.failed_batches,
            total_activities: state.total_activities,
            processed_activities: state.processed_activities,
            error_count: state.error_count,
            warning_count: state.warning_count,
        };

        let payload = serde_json::to_value(&summary).unwrap_or_else(|e| {
            warn!("Failed to encode migration summary: {}", e);
            json!({ "final_status": final_status })
        });
        self.sink.enqueue_event(MonitoringEvent::new(
            migration_id,
            Some(state.user_id.clone()),
            MonitoringEventType::for_final_status(final_status),
            payload,
            MONITOR_SOURCE,
        ));
        self.sink.enqueue_log(
            LogEntry::new(
                migration_id,
                if final_status == MigrationStatus::Failed {
                    LogLevel::Error
                } else {
                    LogLevel::Info
                },
                format!("Migration monitoring stopped with status {final_status}"),
                MONITOR_SOURCE,
            )
            .with_user(Some(state.user_id.clone()))
            .with_details(LogDetails::Summary(summary)),
        );

        info!(
            "Stopped monitoring migration {} ({}): {}/{} batches succeeded",
            migration_id, final_status, state.completed_batches, state.batch_count
        );
        true
    }

    /// Sample resources and compute the next batch size and thread count.
    #[instrument(skip(self))]
    pub async fn optimize_batch(
        &self,
        migration_id: &str,
        current_batch_size: usize,
        processing_time_s: f64,
        error_rate: f64,
    ) -> BatchOptimization {
        let resources = self.sample_resources().await;
        let optimization = self.optimizer.optimize_batch(
            migration_id,
            current_batch_size,
            processing_time_s,
            error_rate,
            &resources,
        );
        self.metrics
            .update_tuning(optimization.new_batch_size, optimization.new_thread_count);

        if optimization.new_batch_size != optimization.previous_batch_size
            || optimization.new_thread_count != optimization.previous_thread_count
            || optimization.new_strategy != optimization.previous_strategy
        {
            let payload = serde_json::to_value(&optimization).unwrap_or_else(|_| json!({}));
            self.sink.enqueue_event(MonitoringEvent::new(
                migration_id,
                self.registry.snapshot(migration_id).map(|s| s.user_id),
                MonitoringEventType::OptimizationApplied,
                payload,
                MONITOR_SOURCE,
            ));
        }
        optimization
    }

    /// Sample resources and run the cleanup cascade for the current pressure.
    #[instrument(skip(self))]
    pub async fn manage_memory(&self) -> MemoryManagementReport {
        let resources = self.sample_resources().await;
        self.apply_memory_management(&resources)
    }

    fn apply_memory_management(&self, resources: &SystemResourceMetrics) -> MemoryManagementReport {
        let report = self
            .memory
            .manage_memory(resources, self.optimizer.current_batch_size());

        self.metrics.memory_pressure_level.set(report.pressure.ordinal());
        self.metrics.memory_freed_mb_total.set(self.memory.total_freed_mb());

        if let Some(batch_size) = report.new_batch_size {
            let adopted = self.optimizer.adopt_batch_size(batch_size);
            self.metrics
                .update_tuning(adopted, self.optimizer.current_thread_count());
        }

        if report.pressure >= PressureLevel::Medium {
            let payload = serde_json::to_value(&report).unwrap_or_else(|_| json!({}));
            for state in self.registry.snapshot_all() {
                self.sink.enqueue_event(MonitoringEvent::new(
                    state.migration_id,
                    Some(state.user_id),
                    MonitoringEventType::MemoryPressure,
                    payload.clone(),
                    MONITOR_SOURCE,
                ));
            }
        }
        report
    }

    // ---- admin API ----

    pub fn get_health_metrics(&self, migration_id: &str) -> Option<MigrationHealthMetrics> {
        let state = self.registry.snapshot(migration_id)?;
        Some(self.health.calculate(&state, Utc::now()))
    }

    pub fn active_migrations(&self) -> Vec<String> {
        self.registry.active_ids()
    }

    #[instrument(skip(self))]
    pub async fn get_logs(&self, migration_id: &str, level: Option<LogLevel>, limit: usize) -> Vec<LogEntry> {
        let query = LogQuery {
            migration_id: migration_id.to_string(),
            level,
            limit,
        };
        match self.repository.fetch_logs(&query).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!("Failed to fetch logs for {}: {}", migration_id, e);
                Vec::new()
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn get_alerts(
        &self,
        migration_id: &str,
        severity: Option<AlertSeverity>,
        acknowledged: Option<bool>,
    ) -> Vec<Alert> {
        let query = AlertQuery {
            migration_id: migration_id.to_string(),
            severity,
            acknowledged,
            limit: None,
        };
        match self.repository.fetch_alerts(&query).await {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!("Failed to fetch alerts for {}: {}", migration_id, e);
                Vec::new()
            }
        }
    }

    /// Acknowledge a stored alert. Repeating the call succeeds and keeps the
    /// original acknowledgement time. Alerts not yet persisted are not found.
    #[instrument(skip(self))]
    pub async fn acknowledge_alert(&self, alert_id: Uuid, acknowledged_by: &str) -> bool {
        let outcome = self
            .repository
            .acknowledge_alert(alert_id, acknowledged_by, Utc::now())
            .await;
        self.finish_alert_transition(
            alert_id,
            outcome,
            MonitoringEventType::AlertAcknowledged,
            json!({ "alert_id": alert_id, "acknowledged_by": acknowledged_by }),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn resolve_alert(&self, alert_id: Uuid) -> bool {
        let outcome = self.repository.resolve_alert(alert_id, Utc::now()).await;
        self.finish_alert_transition(
            alert_id,
            outcome,
            MonitoringEventType::AlertResolved,
            json!({ "alert_id": alert_id }),
        )
        .await
    }

    async fn finish_alert_transition(
        &self,
        alert_id: Uuid,
        outcome: Result<FlagTransition>,
        event_type: MonitoringEventType,
        payload: serde_json::Value,
    ) -> bool {
        match outcome {
            Ok(FlagTransition::Applied) => {
                match self.repository.get_alert(alert_id).await {
                    Ok(Some(alert)) => {
                        self.sink.enqueue_event(MonitoringEvent::new(
                            alert.migration_id,
                            alert.user_id,
                            event_type,
                            payload,
                            MONITOR_SOURCE,
                        ));
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Could not load alert {} for event: {}", alert_id, e),
                }
                info!("Alert {} {}", alert_id, event_type.as_str());
                true
            }
            Ok(FlagTransition::AlreadySet) => true,
            Ok(FlagTransition::NotFound) => {
                debug!("Alert {} not found", alert_id);
                false
            }
            Err(e) => {
                warn!("Failed to update alert {}: {}", alert_id, e);
                false
            }
        }
    }

    pub fn get_optimization_summary(&self) -> OptimizationSummary {
        OptimizationSummary {
            active_migrations: self.registry.len(),
            optimizer: self.optimizer.summary(SUMMARY_RECENT_OPTIMIZATIONS),
            memory: self.memory.summary(),
            latest_resources: self.resource_history.latest(),
            latest_recommendations: self.recommendations.latest(),
            resource_samples: self.resource_history.len(),
            performance_samples: self.performance_history.len(),
            sink: self.sink.stats(),
        }
    }

    pub fn sink_stats(&self) -> SinkStatsSnapshot {
        self.sink.stats()
    }

    /// Prometheus exposition text
    pub fn metrics_text(&self) -> String {
        self.metrics.gather_text()
    }

    pub fn metrics(&self) -> &Arc<MonitorMetrics> {
        &self.metrics
    }

    // ---- background work ----

    async fn sample_resources(&self) -> SystemResourceMetrics {
        let resources = self.sampler.sample().await;
        self.record_resources(resources.clone());
        resources
    }

    fn record_resources(&self, resources: SystemResourceMetrics) {
        self.metrics
            .update_resources(resources.cpu_percent, resources.memory_percent);
        self.resource_history.push(resources);
    }

    /// One monitoring pass: sample, derive per-migration performance,
    /// recommend, auto-apply, and relieve memory pressure.
    #[instrument(skip(self))]
    pub async fn run_monitoring_cycle(&self) -> MonitoringCycleReport {
        let resources = self.sample_resources().await;
        self.run_cycle_with(resources)
    }

    /// Same as [`run_monitoring_cycle`](Self::run_monitoring_cycle) with a
    /// caller-supplied resource snapshot.
    pub fn run_cycle_with(&self, resources: SystemResourceMetrics) -> MonitoringCycleReport {
        if self.resource_history.latest().as_ref() != Some(&resources) {
            self.record_resources(resources.clone());
        }

        let now = Utc::now();
        let persist_ms = self.sink.average_persist_ms();
        let cache_hit_rate = self.memory.cache().hit_rate();

        let states = self.registry.snapshot_all();
        let performance: Vec<PerformanceMetrics> = states
            .iter()
            .map(|state| {
                let health = self.health.calculate(state, now);
                performance_from(state, &health, &resources, persist_ms, cache_hit_rate)
            })
            .collect();
        for p in &performance {
            self.performance_history.push(p.clone());
        }

        // The weakest migration with at least one batch drives the analysis.
        let focus = performance
            .iter()
            .zip(&states)
            .filter(|(_, state)| state.batch_count > 0)
            .map(|(p, _)| p)
            .min_by(|a, b| {
                a.optimization_score
                    .partial_cmp(&b.optimization_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        let process_memory_mean_mb = self
            .resource_history
            .mean_by(|r| r.process_memory_mb)
            .filter(|_| self.resource_history.len() > 1);

        let recommendations = self.recommendations.analyze(RecommendationInput {
            performance: focus,
            resources: &resources,
            process_memory_mean_mb,
        });
        self.optimizer.observe_cpu_count(resources.cpu_count);
        let applied = self
            .recommendations
            .auto_apply(&recommendations, &self.memory, &self.optimizer);
        if !applied.is_empty() {
            self.metrics
                .recommendations_auto_applied_total
                .inc_by(applied.len() as u64);
            self.metrics.update_tuning(
                self.optimizer.current_batch_size(),
                self.optimizer.current_thread_count(),
            );
        }

        let memory = if self.memory.classify_pressure(&resources) > PressureLevel::Low {
            Some(self.apply_memory_management(&resources))
        } else {
            self.metrics.memory_pressure_level.set(PressureLevel::Low.ordinal());
            None
        };

        let periodic_cleanup = self.periodic_cleanup_due().then(|| {
            self.memory
                .run_periodic_cleanup(resources.memory_percent)
        });

        debug!(
            "Monitoring cycle: {} migrations, {} recommendations, {} applied",
            performance.len(),
            recommendations.len(),
            applied.len()
        );

        MonitoringCycleReport {
            resources,
            performance,
            recommendations,
            applied,
            memory,
            periodic_cleanup,
        }
    }

    fn periodic_cleanup_due(&self) -> bool {
        let interval = Duration::from_secs(self.config.memory.cleanup_interval_seconds);
        let mut last = self.last_cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        if last.elapsed() >= interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Delete old logs and old resolved alerts.
    #[instrument(skip(self))]
    pub async fn run_retention(&self) -> RetentionReport {
        let now = Utc::now();
        let mut report = RetentionReport {
            completed: true,
            ..RetentionReport::default()
        };

        let log_cutoff = now - ChronoDuration::days(self.config.retention.log_retention_days);
        match self.repository.delete_logs_before(log_cutoff).await {
            Ok(deleted) => report.logs_deleted = deleted,
            Err(e) => {
                error!("Log retention failed: {}", e);
                report.completed = false;
            }
        }

        let alert_cutoff = now - ChronoDuration::days(self.config.retention.alert_retention_days);
        match self.repository.delete_resolved_alerts_before(alert_cutoff).await {
            Ok(deleted) => report.alerts_deleted = deleted,
            Err(e) => {
                error!("Alert retention failed: {}", e);
                report.completed = false;
            }
        }

        info!(
            "Retention removed {} logs and {} resolved alerts",
            report.logs_deleted, report.alerts_deleted
        );
        report
    }

    fn spawn_monitoring_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.monitoring_interval_secs.max(1));
        spawn_periodic(
            Arc::downgrade(self),
            self.shutdown_tx.subscribe(),
            period,
            "monitoring",
            |monitor| {
                async move {
                    monitor.run_monitoring_cycle().await;
                }
                .boxed()
            },
        )
    }

    fn spawn_retention_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.retention.cleanup_interval_secs.max(1));
        spawn_periodic(
            Arc::downgrade(self),
            self.shutdown_tx.subscribe(),
            period,
            "retention",
            |monitor| {
                async move {
                    monitor.run_retention().await;
                }
                .boxed()
            },
        )
    }

    /// Stop loops and consumers. Queued records are drained up to the sink's
    /// deadline. Returns false when something had to be aborted; repeated
    /// calls return true without doing anything.
    pub async fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!("Shutting down migration monitor");
        let _ = self.shutdown_tx.send(());

        let loops = std::mem::take(
            &mut *self.background.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let deadline = Duration::from_secs(self.config.sink.shutdown_timeout_secs.max(1));
        let mut clean = true;
        for mut handle in loops {
            if tokio::time::timeout(deadline, &mut handle).await.is_err() {
                handle.abort();
                warn!("Background loop did not stop in time; aborted");
                clean = false;
            }
        }

        clean &= self.sink.shutdown().await;
        clean
    }
}

impl std::fmt::Debug for MigrationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationMonitor")
            .field("active_migrations", &self.registry.len())
            .field("sink", &self.sink)
            .finish()
    }
}

/// Run `work` every `period` until shutdown fires or the monitor is dropped.
fn spawn_periodic(
    monitor: Weak<MigrationMonitor>,
    mut shutdown_rx: broadcast::Receiver<()>,
    period: Duration,
    name: &'static str,
    work: fn(Arc<MigrationMonitor>) -> BoxFuture<'static, ()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(monitor) = monitor.upgrade() else { break };
                    work(monitor).await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("{} loop stopped", name);
    })
}

fn performance_from(
    state: &MigrationState,
    health: &MigrationHealthMetrics,
    resources: &SystemResourceMetrics,
    database_query_time_ms: f64,
    cache_hit_rate: f64,
) -> PerformanceMetrics {
    PerformanceMetrics {
        timestamp: health.timestamp,
        migration_id: state.migration_id.clone(),
        throughput_activities_per_second: health.throughput_activities_per_second,
        average_latency_ms: if state.batch_count > 0 {
            state.total_batch_processing_time_s / state.batch_count as f64 * 1000.0
        } else {
            0.0
        },
        memory_usage_mb: resources.process_memory_mb,
        cpu_usage_percent: resources.cpu_percent,
        io_wait_percent: resources.io_wait_percent,
        error_rate: state.batch_error_rate(),
        success_rate: if state.batch_count > 0 {
            health.success_rate
        } else {
            1.0
        },
        batch_processing_time_ms: state.last_batch_processing_time_s * 1000.0,
        database_query_time_ms,
        cache_hit_rate,
        optimization_score: health.performance_score,
    }
}

fn mirror_to_tracing(entry: &LogEntry) {
    match entry.level {
        LogLevel::Debug => debug!(migration_id = %entry.migration_id, source = %entry.source, "{}", entry.message),
        LogLevel::Info => info!(migration_id = %entry.migration_id, source = %entry.source, "{}", entry.message),
        LogLevel::Warning => warn!(migration_id = %entry.migration_id, source = %entry.source, "{}", entry.message),
        LogLevel::Error | LogLevel::Critical => {
            error!(migration_id = %entry.migration_id, source = %entry.source, "{}", entry.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{AlertType, InMemoryMonitoringRepository, QueueKind};
    use tracing_test::traced_test;

    fn config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.sampler.cpu_sample_window_ms = 10;
        config.sampler.include_processes = false;
        config
    }

    fn monitor() -> (Arc<MigrationMonitor>, Arc<InMemoryMonitoringRepository>) {
        let repo = Arc::new(InMemoryMonitoringRepository::new());
        let monitor = MigrationMonitor::start_without_loops(config(), repo.clone()).unwrap();
        (monitor, repo)
    }

    fn batch(n: u64, success: bool) -> BatchDetails {
        BatchDetails {
            batch_number: n,
            success,
            activities_count: 100,
            processing_time_s: 1.5,
            error_message: (!success).then(|| "constraint violation".to_string()),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let (monitor, repo) = monitor();

        assert!(monitor.start_monitoring("m1", "u1", "c1"));
        assert!(!monitor.start_monitoring("m1", "u1", "c1"));
        assert_eq!(monitor.active_migrations(), vec!["m1".to_string()]);

        assert!(monitor.stop_monitoring("m1", MigrationStatus::Completed));
        assert!(!monitor.stop_monitoring("m1", MigrationStatus::Completed));
        assert!(monitor.get_health_metrics("m1").is_none());

        monitor.shutdown().await;
        let events: Vec<MonitoringEventType> =
            repo.all_events().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            events,
            vec![
                MonitoringEventType::MigrationStarted,
                MonitoringEventType::MigrationCompleted
            ]
        );
    }

    #[tokio::test]
    async fn test_batches_update_counters() {
        let (monitor, _) = monitor();
        monitor.start_monitoring("m1", "u1", "c1");
        monitor.set_total_activities("m1", 1000);

        for n in 0..5 {
            assert!(monitor.log_batch_event("m1", None, batch(n, true)));
        }
        let health = monitor.get_health_metrics("m1").unwrap();
        assert_eq!(health.batch_count, 5);
        assert_eq!(health.completed_batches, 5);
        assert_eq!(health.progress_percentage, 50.0);

        assert!(!monitor.log_batch_event("unknown", None, batch(0, true)));
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_status_rejects_terminal() {
        let (monitor, repo) = monitor();
        monitor.start_monitoring("m1", "u1", "c1");

        assert!(monitor.update_status("m1", MigrationStatus::Paused));
        assert!(!monitor.update_status("m1", MigrationStatus::Completed));
        assert!(!monitor.update_status("missing", MigrationStatus::Paused));

        monitor.shutdown().await;
        assert!(repo
            .all_events()
            .iter()
            .any(|e| e.event_type == MonitoringEventType::StatusChanged));
    }

    #[tokio::test]
    async fn test_stop_rejects_non_terminal_status() {
        let (monitor, repo) = monitor();
        monitor.start_monitoring("m1", "u1", "c1");

        for status in [
            MigrationStatus::Pending,
            MigrationStatus::Running,
            MigrationStatus::Paused,
        ] {
            assert!(!monitor.stop_monitoring("m1", status));
        }
        assert_eq!(monitor.active_migrations(), vec!["m1".to_string()]);

        assert!(monitor.stop_monitoring("m1", MigrationStatus::RolledBack));
        monitor.shutdown().await;

        let events: Vec<MonitoringEventType> =
            repo.all_events().into_iter().map(|e| e.event_type).collect();
        assert_eq!(
            events,
            vec![
                MonitoringEventType::MigrationStarted,
                MonitoringEventType::MigrationRolledBack
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_batches_raise_single_error_rate_alert() {
        let (monitor, repo) = monitor();
        monitor.start_monitoring("m1", "u1", "c1");

        for n in 0..20 {
            monitor.log_batch_event("m1", Some("u1"), batch(n, n >= 15));
        }
        monitor.shutdown().await;

        let alerts: Vec<Alert> = repo
            .all_alerts()
            .into_iter()
            .filter(|a| a.alert_type == AlertType::HighErrorRate)
            .collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
    }

    #[tokio::test]
    async fn test_cycle_with_pressure_adopts_smaller_batch() {
        let (monitor, _) = monitor();
        monitor.start_monitoring("m1", "u1", "c1");
        let before = monitor.optimizer().current_batch_size();

        let resources = SystemResourceMetrics {
            memory_percent: 96.0,
            cpu_percent: 50.0,
            cpu_count: 4,
            ..SystemResourceMetrics::zeroed()
        };
        let report = monitor.run_cycle_with(resources);

        let memory = report.memory.unwrap();
        assert_eq!(memory.pressure, PressureLevel::Critical);
        assert_eq!(
            monitor.optimizer().current_batch_size(),
            ((before as f64 * 0.3).round() as usize).max(100)
        );
        assert!(report
            .applied
            .iter()
            .any(|a| a.metric == crate::performance::RecommendationMetric::MemoryUsage));
        assert_eq!(report.performance.len(), 1);
        monitor.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_timeout_error_alert_is_logged() {
        let (monitor, repo) = monitor();
        monitor.start_monitoring("m1", "u1", "c1");

        assert!(monitor.log_event(
            LogEntry::new(
                "m1",
                LogLevel::Error,
                "Connection timeout while fetching batch",
                "batch_worker",
            )
            .with_user(Some("u1".to_string()))
        ));
        monitor.shutdown().await;

        assert!(logs_contain("ALERT [timeout_error]"));
        let alerts = repo.all_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Medium);
        assert!(repo
            .all_events()
            .iter()
            .any(|e| e.event_type == MonitoringEventType::AlertTriggered));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_full_log_queue_drops_and_warns() {
        let repo = Arc::new(InMemoryMonitoringRepository::new());
        repo.set_write_delay(Duration::from_millis(300));
        let mut config = config();
        config.sink.log_queue_capacity = 2;
        config.sink.shutdown_timeout_secs = 1;
        let monitor = MigrationMonitor::start_without_loops(config, repo.clone()).unwrap();

        let accepted = (0..10)
            .filter(|i| monitor.log("m1", LogLevel::Info, &format!("entry {i}"), "test"))
            .count();

        assert!(accepted <= 3);
        assert!(monitor.sink_stats().queue(QueueKind::Log).dropped >= 7);
        assert!(logs_contain("log queue full"));
        monitor.shutdown().await;
    }
}
