//! Monitoring cycles: recommendations, auto-apply and memory relief

mod test_helpers;

use migration_monitor::performance::{PressureLevel, RecommendationMetric};
use migration_monitor::{MonitoringEventType, SystemResourceMetrics};
use test_helpers::{failed_batch, successful_batch, TestMonitor};

fn resources(memory_percent: f64, cpu_percent: f64) -> SystemResourceMetrics {
    SystemResourceMetrics {
        memory_percent,
        cpu_percent,
        cpu_count: 4,
        ..SystemResourceMetrics::zeroed()
    }
}

#[tokio::test]
async fn test_cycle_recommends_for_failing_migration() {
    let env = TestMonitor::new();
    env.monitor.start_monitoring("mig-c", "user-1", "cfg-1");
    for n in 0..15 {
        env.monitor
            .log_batch_event("mig-c", None, failed_batch(n, "duplicate key"));
    }
    for n in 15..20 {
        env.monitor
            .log_batch_event("mig-c", None, successful_batch(n, 100));
    }

    let report = env.monitor.run_cycle_with(resources(40.0, 50.0));

    assert_eq!(report.performance.len(), 1);
    assert!((report.performance[0].error_rate - 0.75).abs() < 1e-9);
    let first = report.recommendations.first().expect("recommendations");
    assert_eq!(first.metric, RecommendationMetric::ErrorRate);
    assert_eq!(first.priority, 10);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.metric == RecommendationMetric::SuccessRate));
    // Neither error recommendation is low effort
    assert!(report.applied.is_empty());
    assert!(report.memory.is_none());

    env.monitor.shutdown().await;
}

#[tokio::test]
async fn test_idle_migrations_do_not_drive_recommendations() {
    let env = TestMonitor::new();
    env.monitor.start_monitoring("mig-idle", "user-1", "cfg-1");

    let report = env.monitor.run_cycle_with(resources(40.0, 50.0));
    assert_eq!(report.performance.len(), 1);
    assert!(report.recommendations.is_empty());

    env.monitor.shutdown().await;
}

#[tokio::test]
async fn test_high_pressure_cycle_shrinks_batch_and_emits_events() {
    let env = TestMonitor::new();
    env.monitor.start_monitoring("mig-p", "user-1", "cfg-1");
    let before = env.monitor.optimizer().current_batch_size();

    let report = env.monitor.run_cycle_with(resources(88.0, 50.0));

    let memory = report.memory.expect("memory was managed");
    assert_eq!(memory.pressure, PressureLevel::High);
    assert!(memory.gc_performed);
    assert!(memory.cache_cleared);
    assert!(!memory.pool_shrunk);
    assert_eq!(
        env.monitor.optimizer().current_batch_size(),
        (before as f64 * 0.6).round() as usize
    );
    assert!(report
        .applied
        .iter()
        .any(|a| a.metric == RecommendationMetric::MemoryUsage));

    env.monitor.shutdown().await;
    assert!(env
        .repository
        .all_events()
        .iter()
        .any(|e| e.event_type == MonitoringEventType::MemoryPressure));
    let text = env.monitor.metrics_text();
    assert!(text.contains("monitor_memory_pressure_level 2"));
}

#[tokio::test]
async fn test_low_cpu_recommendation_is_not_auto_applied() {
    let env = TestMonitor::new();
    let threads = env.monitor.optimizer().current_thread_count();

    let report = env.monitor.run_cycle_with(resources(40.0, 10.0));
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.metric == RecommendationMetric::CpuLow));
    assert!(report.applied.is_empty());
    assert_eq!(env.monitor.optimizer().current_thread_count(), threads);

    env.monitor.shutdown().await;
}

#[tokio::test]
async fn test_live_cycle_samples_resources() {
    let env = TestMonitor::new();
    let report = env.monitor.run_monitoring_cycle().await;

    assert!((0.0..=100.0).contains(&report.resources.memory_percent));
    let summary = env.monitor.get_optimization_summary();
    assert!(summary.resource_samples >= 1);

    env.monitor.shutdown().await;
}
