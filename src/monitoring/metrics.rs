use prometheus::{
    exponential_buckets, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry,
};
use crate::error::Result;
use std::sync::Arc;
use tracing::{error, info};

/// Queue labels used on per-queue counters.
pub const QUEUE_LABELS: [&str; 3] = ["log", "alert", "event"];

/// Prometheus metrics for the migration monitor
pub struct MonitorMetrics {
    registry: Arc<Registry>,

    // Queue metrics
    pub queue_enqueued_total: IntCounterVec,
    pub queue_dropped_total: IntCounterVec,
    pub queue_persisted_total: IntCounterVec,
    pub queue_persist_failures_total: IntCounterVec,

    // Migration metrics
    pub active_migrations: IntGauge,
    pub batches_total: IntCounter,
    pub batch_failures_total: IntCounter,
    pub batch_processing_seconds: Histogram,
    pub alerts_fired_total: IntCounterVec,

    // Resource metrics
    pub cpu_usage_percent: Gauge,
    pub memory_usage_percent: Gauge,
    pub memory_pressure_level: IntGauge,
    pub memory_freed_mb_total: Gauge,

    // Tuning metrics
    pub adaptive_batch_size: IntGauge,
    pub adaptive_thread_count: IntGauge,
    pub recommendations_auto_applied_total: IntCounter,
}

impl MonitorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let queue_enqueued_total = IntCounterVec::new(
            Opts::new(
                "monitor_queue_enqueued_total",
                "Records accepted into a telemetry queue",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(queue_enqueued_total.clone()))?;

        let queue_dropped_total = IntCounterVec::new(
            Opts::new(
                "monitor_queue_dropped_total",
                "Records dropped because a telemetry queue was full or closed",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(queue_dropped_total.clone()))?;

        let queue_persisted_total = IntCounterVec::new(
            Opts::new(
                "monitor_queue_persisted_total",
                "Records written to storage by a queue consumer",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(queue_persisted_total.clone()))?;

        let queue_persist_failures_total = IntCounterVec::new(
            Opts::new(
                "monitor_queue_persist_failures_total",
                "Records discarded after a storage write failed",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(queue_persist_failures_total.clone()))?;

        let active_migrations = IntGauge::with_opts(Opts::new(
            "monitor_active_migrations",
            "Migrations currently registered for monitoring",
        ))?;
        registry.register(Box::new(active_migrations.clone()))?;

        let batches_total = IntCounter::with_opts(Opts::new(
            "monitor_batches_total",
            "Batches reported by migrations",
        ))?;
        registry.register(Box::new(batches_total.clone()))?;

        let batch_failures_total = IntCounter::with_opts(Opts::new(
            "monitor_batch_failures_total",
            "Batches reported as failed",
        ))?;
        registry.register(Box::new(batch_failures_total.clone()))?;

        let batch_processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "monitor_batch_processing_seconds",
                "Reported batch processing time in seconds",
            )
            .buckets(exponential_buckets(0.05, 2.0, 14)?),
        )?;
        registry.register(Box::new(batch_processing_seconds.clone()))?;

        let alerts_fired_total = IntCounterVec::new(
            Opts::new("monitor_alerts_fired_total", "Alerts fired by type"),
            &["alert_type"],
        )?;
        registry.register(Box::new(alerts_fired_total.clone()))?;

        let cpu_usage_percent = Gauge::with_opts(Opts::new(
            "monitor_cpu_usage_percent",
            "Most recent sampled CPU usage percentage",
        ))?;
        registry.register(Box::new(cpu_usage_percent.clone()))?;

        let memory_usage_percent = Gauge::with_opts(Opts::new(
            "monitor_memory_usage_percent",
            "Most recent sampled memory usage percentage",
        ))?;
        registry.register(Box::new(memory_usage_percent.clone()))?;

        let memory_pressure_level = IntGauge::with_opts(Opts::new(
            "monitor_memory_pressure_level",
            "Memory pressure tier (0=low, 1=medium, 2=high, 3=critical)",
        ))?;
        registry.register(Box::new(memory_pressure_level.clone()))?;

        let memory_freed_mb_total = Gauge::with_opts(Opts::new(
            "monitor_memory_freed_mb_total",
            "Estimated megabytes released by memory management",
        ))?;
        registry.register(Box::new(memory_freed_mb_total.clone()))?;

        let adaptive_batch_size = IntGauge::with_opts(Opts::new(
            "monitor_adaptive_batch_size",
            "Current adaptive batch size",
        ))?;
        registry.register(Box::new(adaptive_batch_size.clone()))?;

        let adaptive_thread_count = IntGauge::with_opts(Opts::new(
            "monitor_adaptive_thread_count",
            "Current adaptive worker thread count",
        ))?;
        registry.register(Box::new(adaptive_thread_count.clone()))?;

        let recommendations_auto_applied_total = IntCounter::with_opts(Opts::new(
            "monitor_recommendations_auto_applied_total",
            "Recommendations applied without operator involvement",
        ))?;
        registry.register(Box::new(recommendations_auto_applied_total.clone()))?;

        // Pre-create per-queue series so they are exported at zero.
        for queue in QUEUE_LABELS {
            queue_enqueued_total.with_label_values(&[queue]);
            queue_dropped_total.with_label_values(&[queue]);
            queue_persisted_total.with_label_values(&[queue]);
            queue_persist_failures_total.with_label_values(&[queue]);
        }

        info!("Initialized Prometheus metrics for migration monitor");

        Ok(Self {
            registry,
            queue_enqueued_total,
            queue_dropped_total,
            queue_persisted_total,
            queue_persist_failures_total,
            active_migrations,
            batches_total,
            batch_failures_total,
            batch_processing_seconds,
            alerts_fired_total,
            cpu_usage_percent,
            memory_usage_percent,
            memory_pressure_level,
            memory_freed_mb_total,
            adaptive_batch_size,
            adaptive_thread_count,
            recommendations_auto_applied_total,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn record_batch(&self, success: bool, processing_time_s: f64) {
        self.batches_total.inc();
        if !success {
            self.batch_failures_total.inc();
        }
        if processing_time_s.is_finite() && processing_time_s >= 0.0 {
            self.batch_processing_seconds.observe(processing_time_s);
        }
    }

    pub fn record_alert(&self, alert_type: &str) {
        self.alerts_fired_total.with_label_values(&[alert_type]).inc();
    }

    pub fn update_resources(&self, cpu_percent: f64, memory_percent: f64) {
        self.cpu_usage_percent.set(cpu_percent);
        self.memory_usage_percent.set(memory_percent);
    }

    pub fn update_tuning(&self, batch_size: usize, thread_count: usize) {
        self.adaptive_batch_size.set(batch_size as i64);
        self.adaptive_thread_count.set(thread_count as i64);
    }

    /// Get metrics in Prometheus format
    pub fn gather_text(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MonitorMetrics::new().unwrap();
        assert_eq!(metrics.batches_total.get(), 0);
        assert_eq!(metrics.active_migrations.get(), 0);
        assert_eq!(
            metrics.queue_dropped_total.with_label_values(&["log"]).get(),
            0
        );
    }

    #[test]
    fn test_batch_recording() {
        let metrics = MonitorMetrics::new().unwrap();
        metrics.record_batch(true, 1.2);
        metrics.record_batch(false, 0.4);
        metrics.record_batch(false, f64::NAN);

        assert_eq!(metrics.batches_total.get(), 3);
        assert_eq!(metrics.batch_failures_total.get(), 2);
        assert_eq!(metrics.batch_processing_seconds.get_sample_count(), 2);
    }

    #[test]
    fn test_gather_text_exports_queue_series() {
        let metrics = MonitorMetrics::new().unwrap();
        metrics.record_alert("timeout_error");
        metrics.update_tuning(1300, 6);

        let text = metrics.gather_text();
        assert!(text.contains("monitor_queue_dropped_total"));
        assert!(text.contains("queue=\"event\""));
        assert!(text.contains("monitor_alerts_fired_total"));
        assert_eq!(metrics.adaptive_batch_size.get(), 1300);
    }
}
