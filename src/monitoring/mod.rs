pub mod alerts;
pub mod health;
pub mod metrics;
pub mod repository;
pub mod service;
pub mod sink;
pub mod state;

pub use alerts::*;
pub use health::*;
pub use metrics::*;
pub use repository::*;
pub use service::*;
pub use sink::*;
pub use state::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(AlertSeverity::Low),
            "medium" => Ok(AlertSeverity::Medium),
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(format!("unknown alert severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Running => "running",
            MigrationStatus::Paused => "paused",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }

    /// Terminal statuses can only be reached through `stop_monitoring`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Completed
                | MigrationStatus::Failed
                | MigrationStatus::Cancelled
                | MigrationStatus::RolledBack
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringEventType {
    MigrationStarted,
    MigrationCompleted,
    MigrationFailed,
    MigrationCancelled,
    MigrationRolledBack,
    StatusChanged,
    BatchCompleted,
    BatchFailed,
    AlertTriggered,
    AlertAcknowledged,
    AlertResolved,
    MemoryPressure,
    OptimizationApplied,
}

impl MonitoringEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringEventType::MigrationStarted => "migration_started",
            MonitoringEventType::MigrationCompleted => "migration_completed",
            MonitoringEventType::MigrationFailed => "migration_failed",
            MonitoringEventType::MigrationCancelled => "migration_cancelled",
            MonitoringEventType::MigrationRolledBack => "migration_rolled_back",
            MonitoringEventType::StatusChanged => "status_changed",
            MonitoringEventType::BatchCompleted => "batch_completed",
            MonitoringEventType::BatchFailed => "batch_failed",
            MonitoringEventType::AlertTriggered => "alert_triggered",
            MonitoringEventType::AlertAcknowledged => "alert_acknowledged",
            MonitoringEventType::AlertResolved => "alert_resolved",
            MonitoringEventType::MemoryPressure => "memory_pressure",
            MonitoringEventType::OptimizationApplied => "optimization_applied",
        }
    }

    /// Event emitted when a migration is finalized with `status`.
    pub fn for_final_status(status: MigrationStatus) -> Self {
        match status {
            MigrationStatus::Failed => MonitoringEventType::MigrationFailed,
            MigrationStatus::Cancelled => MonitoringEventType::MigrationCancelled,
            MigrationStatus::RolledBack => MonitoringEventType::MigrationRolledBack,
            _ => MonitoringEventType::MigrationCompleted,
        }
    }
}

impl FromStr for MonitoringEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Structured payload attached to a log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogDetails {
    #[default]
    None,
    Lifecycle(LifecycleDetails),
    Batch(BatchDetails),
    Alert(AlertLogDetails),
    Summary(MigrationSummaryDetails),
    /// Free-form fields supplied by the batch processor.
    Custom { fields: Map<String, Value> },
}

impl LogDetails {
    pub fn custom(fields: Map<String, Value>) -> Self {
        if fields.is_empty() {
            LogDetails::None
        } else {
            LogDetails::Custom { fields }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleDetails {
    pub configuration_id: String,
    pub status: MigrationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchDetails {
    pub batch_number: u64,
    pub success: bool,
    pub activities_count: u64,
    pub processing_time_s: f64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertLogDetails {
    pub alert_id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationSummaryDetails {
    pub final_status: MigrationStatus,
    pub duration_seconds: f64,
    pub batch_count: u64,
    pub completed_batches: u64,
    pub failed_batches: u64,
    pub total_activities: u64,
    pub processed_activities: u64,
    pub error_count: u64,
    pub warning_count: u64,
}

/// A single structured log line produced for a migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: Uuid,
    pub migration_id: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub details: LogDetails,
    pub source: String,
    pub thread_id: String,
    pub execution_time: Option<f64>,
    pub error_trace: Option<String>,
}

impl LogEntry {
    pub fn new(
        migration_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            migration_id: migration_id.into(),
            user_id: None,
            timestamp: Utc::now(),
            level,
            message: message.into(),
            details: LogDetails::None,
            source: source.into(),
            thread_id: current_thread_label(),
            execution_time: None,
            error_trace: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_details(mut self, details: LogDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_execution_time(mut self, execution_time: Option<f64>) -> Self {
        self.execution_time = execution_time;
        self
    }

    pub fn with_trace(mut self, error_trace: Option<String>) -> Self {
        self.error_trace = error_trace;
        self
    }
}

/// Append-only lifecycle/batch/alert transition record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringEvent {
    pub id: Uuid,
    pub migration_id: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event_type: MonitoringEventType,
    pub payload: Value,
    pub source: String,
}

impl MonitoringEvent {
    pub fn new(
        migration_id: impl Into<String>,
        user_id: Option<String>,
        event_type: MonitoringEventType,
        payload: Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            migration_id: migration_id.into(),
            user_id,
            timestamp: Utc::now(),
            event_type,
            payload,
            source: source.into(),
        }
    }
}

fn current_thread_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}
