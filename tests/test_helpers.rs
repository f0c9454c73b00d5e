//! Shared setup for the monitor integration tests
//!
//! Everything runs against the in-memory repository so no database is needed.

#![allow(dead_code)]

use migration_monitor::monitoring::BatchDetails;
use migration_monitor::{InMemoryMonitoringRepository, MigrationMonitor, MonitorConfig};
use std::sync::Arc;
use std::time::Duration;

/// Test environment holding a monitor without background loops
pub struct TestMonitor {
    pub monitor: Arc<MigrationMonitor>,
    pub repository: Arc<InMemoryMonitoringRepository>,
}

impl TestMonitor {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MonitorConfig) -> Self {
        let repository = Arc::new(InMemoryMonitoringRepository::new());
        let monitor = MigrationMonitor::start_without_loops(config, repository.clone())
            .expect("monitor should start");
        Self {
            monitor,
            repository,
        }
    }

    /// Poll until `condition` holds or two seconds pass
    pub async fn wait_until(&self, condition: impl Fn(&InMemoryMonitoringRepository) -> bool) -> bool {
        for _ in 0..200 {
            if condition(&self.repository) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(&self.repository)
    }
}

/// Defaults with a short sampling window
pub fn test_config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.sampler.cpu_sample_window_ms = 10;
    config.sampler.include_processes = false;
    config.sink.shutdown_timeout_secs = 2;
    config
}

pub fn successful_batch(batch_number: u64, activities: u64) -> BatchDetails {
    BatchDetails {
        batch_number,
        success: true,
        activities_count: activities,
        processing_time_s: 0.8,
        error_message: None,
    }
}

pub fn failed_batch(batch_number: u64, error: &str) -> BatchDetails {
    BatchDetails {
        batch_number,
        success: false,
        activities_count: 0,
        processing_time_s: 2.5,
        error_message: Some(error.to_string()),
    }
}
