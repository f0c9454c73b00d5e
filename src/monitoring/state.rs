//! In-memory per-migration counters and the registry that guards them.

use super::{AlertType, LogLevel, MigrationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Running counters for one active migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationState {
    pub migration_id: String,
    pub user_id: String,
    pub configuration_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: MigrationStatus,
    pub error_count: u64,
    pub warning_count: u64,
    pub batch_count: u64,
    pub completed_batches: u64,
    pub failed_batches: u64,
    pub total_activities: u64,
    pub processed_activities: u64,
    pub last_batch_processing_time_s: f64,
    pub total_batch_processing_time_s: f64,
    /// Alert types currently firing; cleared when their condition recovers.
    pub active_alerts: HashSet<AlertType>,
}

impl MigrationState {
    pub fn new(
        migration_id: impl Into<String>,
        user_id: impl Into<String>,
        configuration_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            migration_id: migration_id.into(),
            user_id: user_id.into(),
            configuration_id: configuration_id.into(),
            start_time: now,
            last_activity: now,
            status: MigrationStatus::Running,
            error_count: 0,
            warning_count: 0,
            batch_count: 0,
            completed_batches: 0,
            failed_batches: 0,
            total_activities: 0,
            processed_activities: 0,
            last_batch_processing_time_s: 0.0,
            total_batch_processing_time_s: 0.0,
            active_alerts: HashSet::new(),
        }
    }

    pub fn record_log(&mut self, level: LogLevel) {
        match level {
            LogLevel::Error | LogLevel::Critical => self.error_count += 1,
            LogLevel::Warning => self.warning_count += 1,
            LogLevel::Debug | LogLevel::Info => {}
        }
        self.last_activity = Utc::now();
    }

    pub fn record_batch(&mut self, success: bool, activities_count: u64, processing_time_s: f64) {
        self.batch_count += 1;
        if success {
            self.completed_batches += 1;
            self.add_processed(activities_count);
        } else {
            self.failed_batches += 1;
        }

        let processing_time_s = if processing_time_s.is_finite() {
            processing_time_s.max(0.0)
        } else {
            0.0
        };
        self.last_batch_processing_time_s = processing_time_s;
        self.total_batch_processing_time_s += processing_time_s;
        self.last_activity = Utc::now();
    }

    /// Processed activities never exceed a known total.
    fn add_processed(&mut self, activities_count: u64) {
        let processed = self.processed_activities.saturating_add(activities_count);
        self.processed_activities = if self.total_activities > 0 {
            processed.min(self.total_activities).max(self.processed_activities)
        } else {
            processed
        };
    }

    /// The total can grow but is never set below what was already processed.
    pub fn set_total_activities(&mut self, total: u64) {
        self.total_activities = total.max(self.processed_activities);
        self.last_activity = Utc::now();
    }

    pub fn batch_error_rate(&self) -> f64 {
        if self.batch_count == 0 {
            0.0
        } else {
            self.failed_batches as f64 / self.batch_count as f64
        }
    }
}

/// Lock-guarded map of active migrations.
///
/// Every mutation goes through the write lock; readers get snapshot copies so
/// derived metrics are never computed from a torn view.
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    inner: RwLock<HashMap<String, MigrationState>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new migration. Returns false if it is already active.
    pub fn insert(&self, state: MigrationState) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&state.migration_id) {
            return false;
        }
        debug!("Registered migration {}", state.migration_id);
        map.insert(state.migration_id.clone(), state);
        true
    }

    /// Apply `f` to the migration's state under the write lock.
    pub fn update<R>(&self, migration_id: &str, f: impl FnOnce(&mut MigrationState) -> R) -> Option<R> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.get_mut(migration_id).map(f)
    }

    pub fn snapshot(&self, migration_id: &str) -> Option<MigrationState> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(migration_id).cloned()
    }

    pub fn snapshot_all(&self) -> Vec<MigrationState> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.values().cloned().collect()
    }

    pub fn remove(&self, migration_id: &str) -> Option<MigrationState> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(migration_id)
    }

    pub fn contains(&self, migration_id: &str) -> bool {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.contains_key(migration_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = map.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_counters() {
        let mut state = MigrationState::new("m1", "u1", "c1");
        state.record_batch(true, 100, 2.0);
        state.record_batch(false, 100, 3.0);
        state.record_batch(true, 50, 1.0);

        assert_eq!(state.batch_count, 3);
        assert_eq!(state.completed_batches, 2);
        assert_eq!(state.failed_batches, 1);
        assert_eq!(state.processed_activities, 150);
        assert_eq!(state.last_batch_processing_time_s, 1.0);
        assert_eq!(state.total_batch_processing_time_s, 6.0);
    }

    #[test]
    fn test_processed_never_exceeds_total() {
        let mut state = MigrationState::new("m1", "u1", "c1");
        state.set_total_activities(120);
        state.record_batch(true, 100, 1.0);
        state.record_batch(true, 100, 1.0);
        assert_eq!(state.processed_activities, 120);

        // Shrinking the total below processed keeps the invariant.
        state.set_total_activities(10);
        assert_eq!(state.total_activities, 120);
    }

    #[test]
    fn test_log_level_counters() {
        let mut state = MigrationState::new("m1", "u1", "c1");
        state.record_log(LogLevel::Info);
        state.record_log(LogLevel::Warning);
        state.record_log(LogLevel::Error);
        state.record_log(LogLevel::Critical);
        assert_eq!(state.warning_count, 1);
        assert_eq!(state.error_count, 2);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = MigrationRegistry::new();
        assert!(registry.insert(MigrationState::new("m1", "u1", "c1")));
        assert!(!registry.insert(MigrationState::new("m1", "u2", "c2")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot("m1").unwrap().user_id, "u1");
    }

    #[test]
    fn test_registry_update_and_remove() {
        let registry = MigrationRegistry::new();
        registry.insert(MigrationState::new("m1", "u1", "c1"));

        let count = registry.update("m1", |s| {
            s.record_batch(true, 10, 0.5);
            s.batch_count
        });
        assert_eq!(count, Some(1));
        assert_eq!(registry.update("missing", |s| s.batch_count), None);

        assert!(registry.remove("m1").is_some());
        assert!(registry.remove("m1").is_none());
        assert!(registry.is_empty());
    }
}
