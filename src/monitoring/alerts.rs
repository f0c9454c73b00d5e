use super::{
    AlertLogDetails, AlertSeverity, LogDetails, LogEntry, LogLevel, MigrationState,
    MonitoringEvent, MonitoringEventType,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const ALERT_SOURCE: &str = "alert_evaluator";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighErrorRate,
    TimeoutError,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::TimeoutError => "timeout_error",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high_error_rate" => Ok(AlertType::HighErrorRate),
            "timeout_error" => Ok(AlertType::TimeoutError),
            other => Err(format!("unknown alert type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertDetails {
    HighErrorRate {
        error_rate: f64,
        threshold: f64,
        failed_batches: u64,
        batch_count: u64,
    },
    TimeoutError {
        source: String,
        log_message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub migration_id: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub alert_type: AlertType,
    pub title: String,
    pub message: String,
    pub details: AlertDetails,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(
        migration_id: impl Into<String>,
        user_id: Option<String>,
        severity: AlertSeverity,
        alert_type: AlertType,
        title: impl Into<String>,
        message: impl Into<String>,
        details: AlertDetails,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            migration_id: migration_id.into(),
            user_id,
            timestamp: Utc::now(),
            severity,
            alert_type,
            title: title.into(),
            message: message.into(),
            details,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
        }
    }

    /// Mark acknowledged. Returns false (and changes nothing) if already acknowledged.
    pub fn acknowledge(&mut self, acknowledged_by: &str, at: DateTime<Utc>) -> bool {
        if self.acknowledged {
            return false;
        }
        self.acknowledged = true;
        self.acknowledged_by = Some(acknowledged_by.to_string());
        self.acknowledged_at = Some(at);
        true
    }

    /// Mark resolved. Returns false (and changes nothing) if already resolved.
    pub fn resolve(&mut self, at: DateTime<Utc>) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.resolved_at = Some(at);
        true
    }
}

/// Thresholds used by the inline alert rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Fraction of failed batches above which `high_error_rate` fires
    pub error_rate_threshold: f64,
    /// Error rate is only evaluated once more batches than this have run
    pub min_batches_for_error_rate: u64,
    /// Case-insensitive needle for `timeout_error`
    pub timeout_keyword: String,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate_threshold: 0.05,
            min_batches_for_error_rate: 10,
            timeout_keyword: "timeout".to_string(),
        }
    }
}

/// Everything an evaluation produced: the alert plus its companion records.
#[derive(Debug, Clone)]
pub struct FiredAlert {
    pub alert: Alert,
    pub log: LogEntry,
    pub event: MonitoringEvent,
}

/// Inline rule evaluation for freshly ingested log entries.
#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Evaluate all rules for `entry`.
    ///
    /// `state` is the migration's live state, if it is still registered. The
    /// error-rate rule records itself in `state.active_alerts` so it fires once
    /// per excursion above the threshold.
    pub fn evaluate(&self, entry: &LogEntry, state: Option<&mut MigrationState>) -> Vec<FiredAlert> {
        let mut fired = Vec::new();

        if let Some(state) = state {
            if let Some(alert) = self.check_error_rate(entry, state) {
                fired.push(alert);
            }
        }

        if let Some(alert) = self.check_timeout(entry) {
            fired.push(alert);
        }

        fired.into_iter().map(|alert| self.companions(alert)).collect()
    }

    fn check_error_rate(&self, entry: &LogEntry, state: &mut MigrationState) -> Option<Alert> {
        let rate = state.batch_error_rate();
        let over = state.batch_count > self.thresholds.min_batches_for_error_rate
            && rate > self.thresholds.error_rate_threshold;

        if !over {
            if state.active_alerts.remove(&AlertType::HighErrorRate) {
                info!(
                    "Error rate for migration {} recovered to {:.1}%",
                    state.migration_id,
                    rate * 100.0
                );
            }
            return None;
        }

        if !state.active_alerts.insert(AlertType::HighErrorRate) {
            return None;
        }

        Some(Alert::new(
            state.migration_id.clone(),
            entry.user_id.clone().or_else(|| Some(state.user_id.clone())),
            AlertSeverity::High,
            AlertType::HighErrorRate,
            "High error rate detected",
            format!(
                "Batch error rate {:.1}% exceeds threshold {:.1}% ({} of {} batches failed)",
                rate * 100.0,
                self.thresholds.error_rate_threshold * 100.0,
                state.failed_batches,
                state.batch_count
            ),
            AlertDetails::HighErrorRate {
                error_rate: rate,
                threshold: self.thresholds.error_rate_threshold,
                failed_batches: state.failed_batches,
                batch_count: state.batch_count,
            },
        ))
    }

    fn check_timeout(&self, entry: &LogEntry) -> Option<Alert> {
        if entry.level != LogLevel::Error {
            return None;
        }

        let keyword = self.thresholds.timeout_keyword.to_lowercase();
        if keyword.is_empty() || !entry.message.to_lowercase().contains(&keyword) {
            return None;
        }

        Some(Alert::new(
            entry.migration_id.clone(),
            entry.user_id.clone(),
            AlertSeverity::Medium,
            AlertType::TimeoutError,
            "Timeout error detected",
            format!("Timeout reported by {}: {}", entry.source, entry.message),
            AlertDetails::TimeoutError {
                source: entry.source.clone(),
                log_message: entry.message.clone(),
            },
        ))
    }

    fn companions(&self, alert: Alert) -> FiredAlert {
        match alert.severity {
            AlertSeverity::Critical => error!("CRITICAL ALERT: {}", alert.message),
            AlertSeverity::High | AlertSeverity::Medium => {
                warn!("ALERT [{}] {}", alert.alert_type, alert.message)
            }
            AlertSeverity::Low => info!("ALERT [{}] {}", alert.alert_type, alert.message),
        }

        let log = LogEntry::new(
            alert.migration_id.clone(),
            LogLevel::Warning,
            format!("Alert created: {}", alert.title),
            ALERT_SOURCE,
        )
        .with_user(alert.user_id.clone())
        .with_details(LogDetails::Alert(AlertLogDetails {
            alert_id: alert.id,
            alert_type: alert.alert_type,
            severity: alert.severity,
        }));

        let event = MonitoringEvent::new(
            alert.migration_id.clone(),
            alert.user_id.clone(),
            MonitoringEventType::AlertTriggered,
            json!({
                "alert_id": alert.id,
                "alert_type": alert.alert_type,
                "severity": alert.severity,
                "title": alert.title,
            }),
            ALERT_SOURCE,
        );

        FiredAlert { alert, log, event }
    }
}
