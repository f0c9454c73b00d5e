//! Retention and alert state transitions through the monitor

mod test_helpers;

use chrono::{Duration as ChronoDuration, Utc};
use migration_monitor::monitoring::{AlertDetails, MonitoringEventType};
use migration_monitor::{
    Alert, AlertSeverity, AlertType, LogEntry, LogLevel, MonitoringRepository,
};
use test_helpers::TestMonitor;
use uuid::Uuid;

fn timeout_alert(migration_id: &str) -> Alert {
    Alert::new(
        migration_id,
        Some("user-1".to_string()),
        AlertSeverity::Medium,
        AlertType::TimeoutError,
        "Timeout error",
        "Connection timeout",
        AlertDetails::TimeoutError {
            source: "batch_worker".to_string(),
            log_message: "Connection timeout".to_string(),
        },
    )
}

#[tokio::test]
async fn test_retention_deletes_old_logs_and_old_resolved_alerts_only() {
    let env = TestMonitor::new();
    let repo = &env.repository;

    let mut old_log = LogEntry::new("mig-r", LogLevel::Info, "old", "test");
    old_log.timestamp = Utc::now() - ChronoDuration::days(31);
    let recent_log = LogEntry::new("mig-r", LogLevel::Info, "recent", "test");
    repo.insert_log(&old_log).await.unwrap();
    repo.insert_log(&recent_log).await.unwrap();

    let old = Utc::now() - ChronoDuration::days(91);
    let mut old_resolved = timeout_alert("mig-r");
    old_resolved.timestamp = old;
    old_resolved.resolve(old);
    let mut old_open = timeout_alert("mig-r");
    old_open.timestamp = old;
    let mut recent_resolved = timeout_alert("mig-r");
    recent_resolved.resolve(Utc::now());
    for alert in [&old_resolved, &old_open, &recent_resolved] {
        repo.insert_alert(alert).await.unwrap();
    }

    let report = env.monitor.run_retention().await;
    assert!(report.completed);
    assert_eq!(report.logs_deleted, 1);
    assert_eq!(report.alerts_deleted, 1);

    let logs = repo.all_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].id, recent_log.id);

    let remaining: Vec<Uuid> = repo.all_alerts().iter().map(|a| a.id).collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&old_open.id));
    assert!(remaining.contains(&recent_resolved.id));

    env.monitor.shutdown().await;
}

#[tokio::test]
async fn test_retention_reports_storage_failure() {
    let env = TestMonitor::new();
    env.repository.set_fail_writes(true);

    let report = env.monitor.run_retention().await;
    assert!(!report.completed);
    assert_eq!(report.logs_deleted, 0);

    env.repository.set_fail_writes(false);
    env.monitor.shutdown().await;
}

#[tokio::test]
async fn test_acknowledge_is_idempotent() {
    let env = TestMonitor::new();
    let alert = timeout_alert("mig-ack");
    env.repository.insert_alert(&alert).await.unwrap();

    assert!(env.monitor.acknowledge_alert(alert.id, "ops").await);
    let first = env.repository.get_alert(alert.id).await.unwrap().unwrap();
    assert!(first.acknowledged);
    assert_eq!(first.acknowledged_by.as_deref(), Some("ops"));

    assert!(env.monitor.acknowledge_alert(alert.id, "someone-else").await);
    let second = env.repository.get_alert(alert.id).await.unwrap().unwrap();
    assert_eq!(second.acknowledged_at, first.acknowledged_at);
    assert_eq!(second.acknowledged_by.as_deref(), Some("ops"));

    let unacked = env
        .monitor
        .get_alerts("mig-ack", None, Some(false))
        .await;
    assert!(unacked.is_empty());

    env.monitor.shutdown().await;
    let acknowledged_events = env
        .repository
        .all_events()
        .into_iter()
        .filter(|e| e.event_type == MonitoringEventType::AlertAcknowledged)
        .count();
    assert_eq!(acknowledged_events, 1);
}

#[tokio::test]
async fn test_unknown_alert_cannot_be_acknowledged_or_resolved() {
    let env = TestMonitor::new();
    assert!(!env.monitor.acknowledge_alert(Uuid::new_v4(), "ops").await);
    assert!(!env.monitor.resolve_alert(Uuid::new_v4()).await);
    env.monitor.shutdown().await;
}

#[tokio::test]
async fn test_resolve_alert_sets_flag_once() {
    let env = TestMonitor::new();
    let alert = timeout_alert("mig-resolve");
    env.repository.insert_alert(&alert).await.unwrap();

    assert!(env.monitor.resolve_alert(alert.id).await);
    let resolved_at = env
        .repository
        .get_alert(alert.id)
        .await
        .unwrap()
        .and_then(|a| a.resolved_at);
    assert!(resolved_at.is_some());

    assert!(env.monitor.resolve_alert(alert.id).await);
    let again = env
        .repository
        .get_alert(alert.id)
        .await
        .unwrap()
        .and_then(|a| a.resolved_at);
    assert_eq!(again, resolved_at);

    env.monitor.shutdown().await;
}
