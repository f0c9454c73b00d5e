use super::{
    Alert, AlertDetails, AlertSeverity, AlertType, LogDetails, LogEntry, LogLevel,
    MonitoringEvent, MonitoringEventType,
};
use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const SCHEMA_SQL: &str = include_str!("../../migrations/001_monitoring_tables.sql");

/// Filter for `fetch_logs`; results are newest first.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub migration_id: String,
    pub level: Option<LogLevel>,
    pub limit: usize,
}

/// Filter for `fetch_alerts`; results are newest first.
#[derive(Debug, Clone)]
pub struct AlertQuery {
    pub migration_id: String,
    pub severity: Option<AlertSeverity>,
    pub acknowledged: Option<bool>,
    pub limit: Option<usize>,
}

/// Result of a monotonic flag transition on a stored alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagTransition {
    Applied,
    AlreadySet,
    NotFound,
}

/// Durable storage for telemetry records.
#[async_trait]
pub trait MonitoringRepository: Send + Sync + std::fmt::Debug {
    async fn ensure_schema(&self) -> Result<()>;
    async fn insert_log(&self, entry: &LogEntry) -> Result<()>;
    async fn insert_alert(&self, alert: &Alert) -> Result<()>;
    async fn insert_event(&self, event: &MonitoringEvent) -> Result<()>;
    async fn fetch_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>>;
    async fn fetch_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>>;
    async fn fetch_events(&self, migration_id: &str, limit: usize) -> Result<Vec<MonitoringEvent>>;
    async fn get_alert(&self, alert_id: Uuid) -> Result<Option<Alert>>;
    async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
        acknowledged_by: &str,
        at: DateTime<Utc>,
    ) -> Result<FlagTransition>;
    async fn resolve_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<FlagTransition>;
    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    /// Only resolved alerts are eligible; unresolved alerts are kept regardless of age.
    async fn delete_resolved_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse::<T>().map_err(|e| MonitorError::InvalidData {
        message: format!("{column}: {e}"),
    })
}

#[derive(Debug, FromRow)]
struct LogRow {
    log_id: Uuid,
    migration_id: String,
    user_id: Option<String>,
    timestamp: DateTime<Utc>,
    level: String,
    message: String,
    details: Value,
    source: String,
    thread_id: String,
    execution_time: Option<f64>,
    error_trace: Option<String>,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = MonitorError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(LogEntry {
            id: row.log_id,
            migration_id: row.migration_id,
            user_id: row.user_id,
            timestamp: row.timestamp,
            level: parse_column(&row.level, "level")?,
            message: row.message,
            details: serde_json::from_value::<LogDetails>(row.details)?,
            source: row.source,
            thread_id: row.thread_id,
            execution_time: row.execution_time,
            error_trace: row.error_trace,
        })
    }
}

#[derive(Debug, FromRow)]
struct AlertRow {
    alert_id: Uuid,
    migration_id: String,
    user_id: Option<String>,
    timestamp: DateTime<Utc>,
    severity: String,
    alert_type: String,
    title: String,
    message: String,
    details: Value,
    acknowledged: bool,
    acknowledged_by: Option<String>,
    acknowledged_at: Option<DateTime<Utc>>,
    resolved: bool,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = MonitorError;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            id: row.alert_id,
            migration_id: row.migration_id,
            user_id: row.user_id,
            timestamp: row.timestamp,
            severity: parse_column::<AlertSeverity>(&row.severity, "severity")?,
            alert_type: parse_column::<AlertType>(&row.alert_type, "alert_type")?,
            title: row.title,
            message: row.message,
            details: serde_json::from_value::<AlertDetails>(row.details)?,
            acknowledged: row.acknowledged,
            acknowledged_by: row.acknowledged_by,
            acknowledged_at: row.acknowledged_at,
            resolved: row.resolved,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    event_id: Uuid,
    migration_id: String,
    user_id: Option<String>,
    timestamp: DateTime<Utc>,
    event_type: String,
    data: Value,
    source: String,
}

impl TryFrom<EventRow> for MonitoringEvent {
    type Error = MonitorError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(MonitoringEvent {
            id: row.event_id,
            migration_id: row.migration_id,
            user_id: row.user_id,
            timestamp: row.timestamp,
            event_type: parse_column::<MonitoringEventType>(&row.event_type, "event_type")?,
            payload: row.data,
            source: row.source,
        })
    }
}

const ALERT_COLUMNS: &str = "alert_id, migration_id, user_id, timestamp, severity, alert_type, \
     title, message, details, acknowledged, acknowledged_by, acknowledged_at, resolved, resolved_at";

/// PostgreSQL implementation of monitoring repository
#[derive(Debug)]
pub struct PostgresMonitoringRepository {
    db_pool: Arc<PgPool>,
}

impl PostgresMonitoringRepository {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    async fn flag_state(&self, alert_id: Uuid, column: &str) -> Result<FlagTransition> {
        let query = format!("SELECT {column} FROM migration_alerts WHERE alert_id = $1");
        let current = sqlx::query_scalar::<_, bool>(&query)
            .bind(alert_id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;

        Ok(match current {
            Some(_) => FlagTransition::AlreadySet,
            None => FlagTransition::NotFound,
        })
    }
}

#[async_trait]
impl MonitoringRepository for PostgresMonitoringRepository {
    async fn ensure_schema(&self) -> Result<()> {
        debug!("Ensuring monitoring schema");
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }

    async fn insert_log(&self, entry: &LogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO migration_logs
                (log_id, migration_id, user_id, timestamp, level, message, details,
                 source, thread_id, execution_time, error_trace)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (log_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.migration_id)
        .bind(&entry.user_id)
        .bind(entry.timestamp)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(serde_json::to_value(&entry.details)?)
        .bind(&entry.source)
        .bind(&entry.thread_id)
        .bind(entry.execution_time)
        .bind(&entry.error_trace)
        .execute(self.db_pool.as_ref())
        .await?;
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO migration_alerts
                (alert_id, migration_id, user_id, timestamp, severity, alert_type, title,
                 message, details, acknowledged, acknowledged_by, acknowledged_at,
                 resolved, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (alert_id) DO NOTHING
            "#,
        )
        .bind(alert.id)
        .bind(&alert.migration_id)
        .bind(&alert.user_id)
        .bind(alert.timestamp)
        .bind(alert.severity.as_str())
        .bind(alert.alert_type.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(serde_json::to_value(&alert.details)?)
        .bind(alert.acknowledged)
        .bind(&alert.acknowledged_by)
        .bind(alert.acknowledged_at)
        .bind(alert.resolved)
        .bind(alert.resolved_at)
        .execute(self.db_pool.as_ref())
        .await?;
        Ok(())
    }

    async fn insert_event(&self, event: &MonitoringEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO migration_events
                (event_id, migration_id, user_id, timestamp, event_type, data, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(&event.migration_id)
        .bind(&event.user_id)
        .bind(event.timestamp)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(&event.source)
        .execute(self.db_pool.as_ref())
        .await?;
        Ok(())
    }

    async fn fetch_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT log_id, migration_id, user_id, timestamp, level, message, details,
                   source, thread_id, execution_time, error_trace
            FROM migration_logs
            WHERE migration_id = $1
              AND ($2::TEXT IS NULL OR level = $2)
            ORDER BY timestamp DESC
            LIMIT $3
            "#,
        )
        .bind(&query.migration_id)
        .bind(query.level.map(|l| l.as_str()))
        .bind(query.limit as i64)
        .fetch_all(self.db_pool.as_ref())
        .await?;

        rows.into_iter().map(LogEntry::try_from).collect()
    }

    async fn fetch_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let sql = format!(
            r#"
            SELECT {ALERT_COLUMNS}
            FROM migration_alerts
            WHERE migration_id = $1
              AND ($2::TEXT IS NULL OR severity = $2)
              AND ($3::BOOLEAN IS NULL OR acknowledged = $3)
            ORDER BY timestamp DESC
            LIMIT $4
            "#
        );
        let rows = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(&query.migration_id)
            .bind(query.severity.map(|s| s.as_str()))
            .bind(query.acknowledged)
            .bind(query.limit.map(|l| l as i64))
            .fetch_all(self.db_pool.as_ref())
            .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }

    async fn fetch_events(&self, migration_id: &str, limit: usize) -> Result<Vec<MonitoringEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, migration_id, user_id, timestamp, event_type, data, source
            FROM migration_events
            WHERE migration_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(migration_id)
        .bind(limit as i64)
        .fetch_all(self.db_pool.as_ref())
        .await?;

        rows.into_iter().map(MonitoringEvent::try_from).collect()
    }

    async fn get_alert(&self, alert_id: Uuid) -> Result<Option<Alert>> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM migration_alerts WHERE alert_id = $1");
        let row = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(alert_id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;

        row.map(Alert::try_from).transpose()
    }

    async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
        acknowledged_by: &str,
        at: DateTime<Utc>,
    ) -> Result<FlagTransition> {
        let result = sqlx::query(
            r#"
            UPDATE migration_alerts
            SET acknowledged = TRUE, acknowledged_by = $2, acknowledged_at = $3
            WHERE alert_id = $1 AND acknowledged = FALSE
            "#,
        )
        .bind(alert_id)
        .bind(acknowledged_by)
        .bind(at)
        .execute(self.db_pool.as_ref())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(FlagTransition::Applied);
        }
        self.flag_state(alert_id, "acknowledged").await
    }

    async fn resolve_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<FlagTransition> {
        let result = sqlx::query(
            r#"
            UPDATE migration_alerts
            SET resolved = TRUE, resolved_at = $2
            WHERE alert_id = $1 AND resolved = FALSE
            "#,
        )
        .bind(alert_id)
        .bind(at)
        .execute(self.db_pool.as_ref())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(FlagTransition::Applied);
        }
        self.flag_state(alert_id, "resolved").await
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM migration_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_resolved_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM migration_alerts WHERE timestamp < $1 AND resolved = TRUE")
                .bind(cutoff)
                .execute(self.db_pool.as_ref())
                .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct InMemoryTables {
    logs: Vec<LogEntry>,
    alerts: Vec<Alert>,
    events: Vec<MonitoringEvent>,
}

/// Process-local repository used by tests and by dry runs without a database.
///
/// Writes can be made to fail or to stall so consumer behaviour under storage
/// trouble can be exercised.
#[derive(Debug, Default)]
pub struct InMemoryMonitoringRepository {
    tables: RwLock<InMemoryTables>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl InMemoryMonitoringRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn log_count(&self) -> usize {
        self.read().logs.len()
    }

    pub fn alert_count(&self) -> usize {
        self.read().alerts.len()
    }

    pub fn event_count(&self) -> usize {
        self.read().events.len()
    }

    pub fn all_logs(&self) -> Vec<LogEntry> {
        self.read().logs.clone()
    }

    pub fn all_alerts(&self) -> Vec<Alert> {
        self.read().alerts.clone()
    }

    pub fn all_events(&self) -> Vec<MonitoringEvent> {
        self.read().events.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryTables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryTables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn before_write(&self) -> Result<()> {
        let delay = self.write_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(MonitorError::Storage {
                message: "simulated write failure".to_string(),
            });
        }
        Ok(())
    }

    fn transition(
        &self,
        alert_id: Uuid,
        apply: impl FnOnce(&mut Alert) -> bool,
    ) -> FlagTransition {
        let mut tables = self.write();
        match tables.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                if apply(alert) {
                    FlagTransition::Applied
                } else {
                    FlagTransition::AlreadySet
                }
            }
            None => FlagTransition::NotFound,
        }
    }
}

#[async_trait]
impl MonitoringRepository for InMemoryMonitoringRepository {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_log(&self, entry: &LogEntry) -> Result<()> {
        self.before_write().await?;
        self.write().logs.push(entry.clone());
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        self.before_write().await?;
        let mut tables = self.write();
        if !tables.alerts.iter().any(|a| a.id == alert.id) {
            tables.alerts.push(alert.clone());
        }
        Ok(())
    }

    async fn insert_event(&self, event: &MonitoringEvent) -> Result<()> {
        self.before_write().await?;
        self.write().events.push(event.clone());
        Ok(())
    }

    async fn fetch_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>> {
        let mut logs: Vec<LogEntry> = self
            .read()
            .logs
            .iter()
            .filter(|l| l.migration_id == query.migration_id)
            .filter(|l| query.level.map_or(true, |level| l.level == level))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(query.limit);
        Ok(logs)
    }

    async fn fetch_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let mut alerts: Vec<Alert> = self
            .read()
            .alerts
            .iter()
            .filter(|a| a.migration_id == query.migration_id)
            .filter(|a| query.severity.map_or(true, |s| a.severity == s))
            .filter(|a| query.acknowledged.map_or(true, |ack| a.acknowledged == ack))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = query.limit {
            alerts.truncate(limit);
        }
        Ok(alerts)
    }

    async fn fetch_events(&self, migration_id: &str, limit: usize) -> Result<Vec<MonitoringEvent>> {
        let mut events: Vec<MonitoringEvent> = self
            .read()
            .events
            .iter()
            .filter(|e| e.migration_id == migration_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    async fn get_alert(&self, alert_id: Uuid) -> Result<Option<Alert>> {
        Ok(self.read().alerts.iter().find(|a| a.id == alert_id).cloned())
    }

    async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
        acknowledged_by: &str,
        at: DateTime<Utc>,
    ) -> Result<FlagTransition> {
        Ok(self.transition(alert_id, |alert| alert.acknowledge(acknowledged_by, at)))
    }

    async fn resolve_alert(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<FlagTransition> {
        Ok(self.transition(alert_id, |alert| alert.resolve(at)))
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.before_write().await?;
        let mut tables = self.write();
        let before = tables.logs.len();
        tables.logs.retain(|l| l.timestamp >= cutoff);
        Ok((before - tables.logs.len()) as u64)
    }

    async fn delete_resolved_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.before_write().await?;
        let mut tables = self.write();
        let before = tables.alerts.len();
        tables
            .alerts
            .retain(|a| !(a.resolved && a.timestamp < cutoff));
        Ok((before - tables.alerts.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn timeout_alert(migration_id: &str) -> Alert {
        Alert::new(
            migration_id,
            None,
            AlertSeverity::Medium,
            AlertType::TimeoutError,
            "Timeout error detected",
            "timeout",
            AlertDetails::TimeoutError {
                source: "worker".to_string(),
                log_message: "timeout".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_fetch_logs_filters_and_limits() {
        let repo = InMemoryMonitoringRepository::new();
        for i in 0..5 {
            let level = if i % 2 == 0 { LogLevel::Info } else { LogLevel::Error };
            repo.insert_log(&LogEntry::new("m1", level, format!("line {i}"), "test"))
                .await
                .unwrap();
        }
        repo.insert_log(&LogEntry::new("m2", LogLevel::Info, "other", "test"))
            .await
            .unwrap();

        let all = repo
            .fetch_logs(&LogQuery {
                migration_id: "m1".to_string(),
                level: None,
                limit: 3,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let errors = repo
            .fetch_logs(&LogQuery {
                migration_id: "m1".to_string(),
                level: Some(LogLevel::Error),
                limit: 100,
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|l| l.level == LogLevel::Error));
    }

    #[tokio::test]
    async fn test_acknowledge_transitions() {
        let repo = InMemoryMonitoringRepository::new();
        let alert = timeout_alert("m1");
        repo.insert_alert(&alert).await.unwrap();

        let at = Utc::now();
        assert_eq!(
            repo.acknowledge_alert(alert.id, "ops", at).await.unwrap(),
            FlagTransition::Applied
        );
        assert_eq!(
            repo.acknowledge_alert(alert.id, "ops", at + ChronoDuration::seconds(10))
                .await
                .unwrap(),
            FlagTransition::AlreadySet
        );
        assert_eq!(
            repo.acknowledge_alert(Uuid::new_v4(), "ops", at).await.unwrap(),
            FlagTransition::NotFound
        );

        let stored = repo.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.acknowledged_at, Some(at));
    }

    #[tokio::test]
    async fn test_retention_keeps_unresolved_alerts() {
        let repo = InMemoryMonitoringRepository::new();
        let old = Utc::now() - ChronoDuration::days(120);

        let mut resolved_old = timeout_alert("m1");
        resolved_old.timestamp = old;
        resolved_old.resolve(old);
        let mut unresolved_old = timeout_alert("m1");
        unresolved_old.timestamp = old;
        let recent_resolved = {
            let mut alert = timeout_alert("m1");
            alert.resolve(Utc::now());
            alert
        };

        for alert in [&resolved_old, &unresolved_old, &recent_resolved] {
            repo.insert_alert(alert).await.unwrap();
        }

        let deleted = repo
            .delete_resolved_alerts_before(Utc::now() - ChronoDuration::days(90))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining: Vec<Uuid> = repo.all_alerts().iter().map(|a| a.id).collect();
        assert!(remaining.contains(&unresolved_old.id));
        assert!(remaining.contains(&recent_resolved.id));
    }

    #[tokio::test]
    async fn test_simulated_write_failure() {
        let repo = InMemoryMonitoringRepository::new();
        repo.set_fail_writes(true);
        let result = repo
            .insert_log(&LogEntry::new("m1", LogLevel::Info, "x", "test"))
            .await;
        assert!(matches!(result, Err(MonitorError::Storage { .. })));
        assert_eq!(repo.log_count(), 0);
    }

    #[test]
    fn test_schema_declares_all_tables() {
        for table in ["migration_logs", "migration_alerts", "migration_events"] {
            assert!(SCHEMA_SQL.contains(table), "missing {table}");
        }
    }
}
