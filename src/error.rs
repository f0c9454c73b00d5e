use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration not found: {migration_id}")]
    MigrationNotFound { migration_id: String },

    #[error("Alert not found: {alert_id}")]
    AlertNotFound { alert_id: String },

    #[error("Invalid stored data: {message}")]
    InvalidData { message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
