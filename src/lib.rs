pub mod config;
pub mod error;
pub mod monitoring;
pub mod performance;

pub use config::MonitorConfig;
pub use error::{MonitorError, Result};

// Re-export the facade and the types callers pass through it
pub use monitoring::{
    Alert, AlertSeverity, AlertType, BatchDetails, InMemoryMonitoringRepository, LogDetails,
    LogEntry, LogLevel, MigrationHealthMetrics, MigrationMonitor, MigrationStatus,
    MonitoringCycleReport, MonitoringEvent, MonitoringEventType, MonitoringRepository,
    OptimizationSummary, PostgresMonitoringRepository, RetentionReport,
};

// Re-export tuning types
pub use performance::{
    BatchOptimization, MemoryManagementReport, MemoryPressureManager, OptimizationRecommendation,
    OptimizationStrategy, PressureLevel, ResourceSampler, SystemResourceMetrics,
    ThroughputOptimizer,
};
