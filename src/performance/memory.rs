//! Memory pressure classification and cascading cleanup
//!
//! There is no tracing collector to trigger, so a "GC" here is a reclamation
//! pass: every registered [`Reclaimable`] is asked to hand back retained
//! capacity. The cache, buffer pool and weak registry are the structures this
//! module manages directly.

use super::SystemResourceMetrics;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Something that can release retained memory on request.
pub trait Reclaimable: Send + Sync {
    fn name(&self) -> &str;

    /// Release what can be released; returns an estimate of bytes freed.
    fn reclaim(&self) -> u64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagementConfig {
    /// Memory percent above which the memory recommendation fires
    pub max_memory_usage_percent: f64,
    /// Memory percent at which periodic cleanup also runs a reclamation pass
    pub gc_threshold: f64,
    pub medium_pressure_threshold: f64,
    pub high_pressure_threshold: f64,
    pub critical_pressure_threshold: f64,
    pub cache_size_limit_mb: f64,
    pub cache_max_entries: usize,
    pub cache_ttl_seconds: u64,
    /// Batch size factor under medium pressure
    pub batch_size_reduction_factor: f64,
    pub high_pressure_batch_factor: f64,
    pub critical_pressure_batch_factor: f64,
    pub cleanup_interval_seconds: u64,
    pub buffer_size_bytes: usize,
    pub max_idle_buffers: usize,
    pub enable_gc: bool,
    pub enable_cache_eviction: bool,
    pub enable_pool_management: bool,
    pub enable_weak_references: bool,
}

impl Default for MemoryManagementConfig {
    fn default() -> Self {
        Self {
            max_memory_usage_percent: 80.0,
            gc_threshold: 75.0,
            medium_pressure_threshold: 70.0,
            high_pressure_threshold: 85.0,
            critical_pressure_threshold: 95.0,
            cache_size_limit_mb: 256.0,
            cache_max_entries: 500,
            cache_ttl_seconds: 3600,
            batch_size_reduction_factor: 0.8,
            high_pressure_batch_factor: 0.6,
            critical_pressure_batch_factor: 0.3,
            cleanup_interval_seconds: 300,
            buffer_size_bytes: 64 * 1024,
            max_idle_buffers: 32,
            enable_gc: true,
            enable_cache_eviction: true,
            enable_pool_management: true,
            enable_weak_references: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Low => "LOW",
            PressureLevel::Medium => "MEDIUM",
            PressureLevel::High => "HIGH",
            PressureLevel::Critical => "CRITICAL",
        }
    }

    /// Numeric tier used by the pressure gauge.
    pub fn ordinal(&self) -> i64 {
        match self {
            PressureLevel::Low => 0,
            PressureLevel::Medium => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryManagementReport {
    pub pressure: PressureLevel,
    pub memory_percent: f64,
    pub actions: Vec<String>,
    pub gc_performed: bool,
    pub cache_cleared: bool,
    pub pool_shrunk: bool,
    pub weak_refs_released: bool,
    pub memory_freed_mb: f64,
    pub new_batch_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEviction {
    pub expired: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
}

impl CacheEviction {
    pub fn removed(&self) -> usize {
        self.expired + self.evicted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct CacheEntry {
    value: Value,
    size_bytes: u64,
    created_at: Instant,
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    size_bytes: u64,
}

impl CacheInner {
    fn pop(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, entry) = self.entries.pop_lru()?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }
}

/// Keyed JSON cache with TTL expiry and least-recently-used eviction.
pub struct ObjectCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: NonZeroUsize,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ObjectCache {
    pub fn new(ttl: Duration, max_entries: usize, max_size_mb: f64) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(max_entries),
                size_bytes: 0,
            }),
            ttl,
            max_entries,
            max_bytes: (max_size_mb.max(0.0) * BYTES_PER_MB) as u64,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &MemoryManagementConfig) -> Self {
        Self::new(
            Duration::from_secs(config.cache_ttl_seconds),
            config.cache_max_entries,
            config.cache_size_limit_mb,
        )
    }

    /// Insert or replace; the least recently used entry makes room when full.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let size_bytes = estimate_size(&key, &value);
        let mut inner = self.lock();

        let entry = CacheEntry {
            value,
            size_bytes,
            created_at: Instant::now(),
        };
        inner.size_bytes += size_bytes;
        // `push` hands back either the replaced value or the evicted LRU entry.
        if let Some((_, displaced)) = inner.entries.push(key, entry) {
            inner.size_bytes = inner.size_bytes.saturating_sub(displaced.size_bytes);
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.lock();
        let expired = match inner.entries.peek(key) {
            Some(entry) => entry.created_at.elapsed() >= self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            inner.pop(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().pop(key).is_some()
    }

    /// Drop entries older than the TTL.
    pub fn purge_expired(&self) -> CacheEviction {
        let mut inner = self.lock();
        self.purge_expired_locked(&mut inner)
    }

    /// Expired entries first, then least recently used ones until both the
    /// entry limit and the byte limit hold.
    pub fn evict(&self) -> CacheEviction {
        let mut inner = self.lock();
        let mut result = self.purge_expired_locked(&mut inner);

        while inner.entries.len() > self.max_entries.get() || inner.size_bytes > self.max_bytes {
            let Some(entry) = inner.pop_lru() else { break };
            result.evicted += 1;
            result.bytes_freed += entry.size_bytes;
        }
        result
    }

    pub fn clear(&self) -> CacheEviction {
        let mut inner = self.lock();
        let result = CacheEviction {
            expired: 0,
            evicted: inner.entries.len(),
            bytes_freed: inner.size_bytes,
        };
        inner.entries.clear();
        inner.size_bytes = 0;
        result
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.lock().size_bytes
    }

    /// Fraction of lookups served from the cache, 0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, size_bytes) = {
            let inner = self.lock();
            (inner.entries.len(), inner.size_bytes)
        };
        CacheStats {
            entries,
            size_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }

    fn purge_expired_locked(&self, inner: &mut CacheInner) -> CacheEviction {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();

        let mut result = CacheEviction::default();
        for key in expired {
            if let Some(entry) = inner.pop(&key) {
                result.expired += 1;
                result.bytes_freed += entry.size_bytes;
            }
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("stats", &self.stats())
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

fn estimate_size(key: &str, value: &Value) -> u64 {
    let encoded = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
    (key.len() + encoded + std::mem::size_of::<CacheEntry>()) as u64
}

/// Reusable byte buffers for batch payload assembly.
#[derive(Debug)]
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            buffer_size,
            max_idle,
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    /// Return a buffer; it is dropped when the pool already holds `max_idle`.
    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(buffer);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.lock().len()
    }

    pub fn idle_bytes(&self) -> u64 {
        self.lock().iter().map(|b| b.capacity() as u64).sum()
    }

    /// Drop idle buffers beyond `keep`; returns bytes released.
    pub fn shrink(&self, keep: usize) -> u64 {
        let mut idle = self.lock();
        if idle.len() <= keep {
            return 0;
        }
        let freed = idle.drain(keep..).map(|b| b.capacity() as u64).sum();
        idle.shrink_to_fit();
        freed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Weak handles to objects owned elsewhere, so they can be let go under pressure.
#[derive(Default)]
pub struct WeakRegistry {
    refs: Mutex<Vec<(String, Weak<dyn Any + Send + Sync>)>>,
}

impl WeakRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any + Send + Sync>(&self, name: impl Into<String>, object: &Arc<T>) {
        let object: Arc<dyn Any + Send + Sync> = object.clone();
        let weak = Arc::downgrade(&object);
        self.lock().push((name.into(), weak));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_count(&self) -> usize {
        self.lock().iter().filter(|(_, w)| w.strong_count() > 0).count()
    }

    /// Remove entries whose target is gone.
    pub fn purge_dead(&self) -> usize {
        let mut refs = self.lock();
        let before = refs.len();
        refs.retain(|(_, w)| w.strong_count() > 0);
        before - refs.len()
    }

    /// Forget every registered reference.
    pub fn release_all(&self) -> usize {
        let mut refs = self.lock();
        let released = refs.len();
        refs.clear();
        refs.shrink_to_fit();
        released
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, Weak<dyn Any + Send + Sync>)>> {
        self.refs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for WeakRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let refs = self.lock();
        f.debug_struct("WeakRegistry")
            .field("names", &refs.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodicCleanup {
    pub expired_cache_entries: usize,
    pub dead_weak_refs: usize,
    pub reclamation_pass: bool,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryManagerSummary {
    pub total_memory_freed_mb: f64,
    pub reclamation_passes: u64,
    pub last_pressure: Option<PressureLevel>,
    pub cache: CacheStats,
    pub idle_buffers: usize,
    pub weak_references: usize,
    pub reclaimable_components: usize,
}

/// Classifies memory pressure and runs the cleanup cascade for each tier.
pub struct MemoryPressureManager {
    config: MemoryManagementConfig,
    cache: Arc<ObjectCache>,
    pool: Arc<BufferPool>,
    weak_refs: Arc<WeakRegistry>,
    reclaimables: RwLock<Vec<Arc<dyn Reclaimable>>>,
    total_freed_bytes: AtomicU64,
    reclamation_passes: AtomicU64,
    last_pressure: Mutex<Option<PressureLevel>>,
}

impl MemoryPressureManager {
    pub fn new(config: MemoryManagementConfig) -> Self {
        let cache = Arc::new(ObjectCache::from_config(&config));
        let pool = Arc::new(BufferPool::new(config.buffer_size_bytes, config.max_idle_buffers));
        Self {
            config,
            cache,
            pool,
            weak_refs: Arc::new(WeakRegistry::new()),
            reclaimables: RwLock::new(Vec::new()),
            total_freed_bytes: AtomicU64::new(0),
            reclamation_passes: AtomicU64::new(0),
            last_pressure: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MemoryManagementConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn weak_refs(&self) -> &Arc<WeakRegistry> {
        &self.weak_refs
    }

    pub fn register_reclaimable(&self, component: Arc<dyn Reclaimable>) {
        debug!("Registered reclaimable component {}", component.name());
        self.reclaimables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(component);
    }

    pub fn classify_pressure(&self, metrics: &SystemResourceMetrics) -> PressureLevel {
        self.classify_percent(metrics.memory_percent)
    }

    fn classify_percent(&self, memory_percent: f64) -> PressureLevel {
        let c = &self.config;
        if memory_percent >= c.critical_pressure_threshold {
            PressureLevel::Critical
        } else if memory_percent >= c.high_pressure_threshold {
            PressureLevel::High
        } else if memory_percent >= c.medium_pressure_threshold {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }

    /// Run the cleanup cascade for the current pressure tier.
    pub fn manage_memory(
        &self,
        metrics: &SystemResourceMetrics,
        adaptive_batch_size: usize,
    ) -> MemoryManagementReport {
        let pressure = self.classify_pressure(metrics);
        *self.last_pressure.lock().unwrap_or_else(PoisonError::into_inner) = Some(pressure);

        let mut report = MemoryManagementReport {
            pressure,
            memory_percent: metrics.memory_percent,
            actions: Vec::new(),
            gc_performed: false,
            cache_cleared: false,
            pool_shrunk: false,
            weak_refs_released: false,
            memory_freed_mb: 0.0,
            new_batch_size: None,
        };

        let (reclaim, evict_cache, shrink_pool, release_weak, factor) = match pressure {
            PressureLevel::Critical => (
                true,
                true,
                true,
                true,
                self.config.critical_pressure_batch_factor,
            ),
            PressureLevel::High => (true, true, false, false, self.config.high_pressure_batch_factor),
            PressureLevel::Medium => (false, true, false, false, self.config.batch_size_reduction_factor),
            PressureLevel::Low => return report,
        };

        let mut freed: u64 = 0;

        if reclaim && self.config.enable_gc {
            let bytes = self.run_reclamation();
            freed += bytes;
            report.gc_performed = true;
            report
                .actions
                .push(format!("reclamation pass released {:.2} MB", bytes as f64 / BYTES_PER_MB));
        }

        if evict_cache && self.config.enable_cache_eviction {
            let eviction = self.cache.evict();
            freed += eviction.bytes_freed;
            report.cache_cleared = true;
            report.actions.push(format!(
                "cache eviction removed {} entries ({} expired)",
                eviction.removed(),
                eviction.expired
            ));
        }

        if shrink_pool && self.config.enable_pool_management {
            let bytes = self.pool.shrink(0);
            freed += bytes;
            report.pool_shrunk = true;
            report
                .actions
                .push(format!("buffer pool shrunk, {:.2} MB released", bytes as f64 / BYTES_PER_MB));
        }

        if release_weak && self.config.enable_weak_references {
            let released = self.weak_refs.release_all();
            freed += (released * std::mem::size_of::<(String, Weak<dyn Any + Send + Sync>)>()) as u64;
            report.weak_refs_released = true;
            report
                .actions
                .push(format!("released {released} weak references"));
        }

        let new_batch_size = (adaptive_batch_size as f64 * factor).round() as usize;
        report.new_batch_size = Some(new_batch_size);
        report
            .actions
            .push(format!("batch size {adaptive_batch_size} -> {new_batch_size}"));

        self.total_freed_bytes.fetch_add(freed, Ordering::Relaxed);
        report.memory_freed_mb = freed as f64 / BYTES_PER_MB;

        match pressure {
            PressureLevel::Critical => warn!(
                "Critical memory pressure ({:.1}%): {}",
                metrics.memory_percent,
                report.actions.join("; ")
            ),
            _ => info!(
                "{} memory pressure ({:.1}%): {}",
                pressure,
                metrics.memory_percent,
                report.actions.join("; ")
            ),
        }

        report
    }

    /// Ask every registered component to release retained memory.
    pub fn run_reclamation(&self) -> u64 {
        let components = self
            .reclaimables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let freed = components.iter().map(|c| {
            let bytes = c.reclaim();
            debug!("{} released {} bytes", c.name(), bytes);
            bytes
        });
        let freed: u64 = freed.sum();
        self.reclamation_passes.fetch_add(1, Ordering::Relaxed);
        freed
    }

    /// Routine housekeeping: expired cache entries, dead weak references, and
    /// a reclamation pass once memory use reaches `gc_threshold`.
    pub fn run_periodic_cleanup(&self, memory_percent: f64) -> PeriodicCleanup {
        let eviction = self.cache.purge_expired();
        let dead_weak_refs = self.weak_refs.purge_dead();
        let mut cleanup = PeriodicCleanup {
            expired_cache_entries: eviction.expired,
            dead_weak_refs,
            reclamation_pass: false,
            bytes_freed: eviction.bytes_freed,
        };

        if self.config.enable_gc && memory_percent >= self.config.gc_threshold {
            cleanup.bytes_freed += self.run_reclamation();
            cleanup.reclamation_pass = true;
        }

        self.total_freed_bytes
            .fetch_add(cleanup.bytes_freed, Ordering::Relaxed);
        debug!(
            "Periodic memory cleanup: {} expired entries, {} dead refs, reclamation={}",
            cleanup.expired_cache_entries, cleanup.dead_weak_refs, cleanup.reclamation_pass
        );
        cleanup
    }

    pub fn total_freed_mb(&self) -> f64 {
        self.total_freed_bytes.load(Ordering::Relaxed) as f64 / BYTES_PER_MB
    }

    pub fn summary(&self) -> MemoryManagerSummary {
        MemoryManagerSummary {
            total_memory_freed_mb: self.total_freed_mb(),
            reclamation_passes: self.reclamation_passes.load(Ordering::Relaxed),
            last_pressure: *self.last_pressure.lock().unwrap_or_else(PoisonError::into_inner),
            cache: self.cache.stats(),
            idle_buffers: self.pool.idle_count(),
            weak_references: self.weak_refs.len(),
            reclaimable_components: self
                .reclaimables
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

impl fmt::Debug for MemoryPressureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPressureManager")
            .field("summary", &self.summary())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CountingReclaimable {
        calls: AtomicU64,
    }

    impl Reclaimable for CountingReclaimable {
        fn name(&self) -> &str {
            "counting"
        }

        fn reclaim(&self) -> u64 {
            self.calls.fetch_add(1, Ordering::Relaxed);
            1024 * 1024
        }
    }

    fn metrics_at(memory_percent: f64) -> SystemResourceMetrics {
        SystemResourceMetrics {
            memory_percent,
            ..SystemResourceMetrics::zeroed()
        }
    }

    #[test]
    fn test_pressure_tiers() {
        let manager = MemoryPressureManager::new(MemoryManagementConfig::default());
        assert_eq!(manager.classify_pressure(&metrics_at(50.0)), PressureLevel::Low);
        assert_eq!(manager.classify_pressure(&metrics_at(70.0)), PressureLevel::Medium);
        assert_eq!(manager.classify_pressure(&metrics_at(85.0)), PressureLevel::High);
        assert_eq!(manager.classify_pressure(&metrics_at(95.0)), PressureLevel::Critical);
    }

    #[test]
    fn test_critical_runs_every_step() {
        let manager = MemoryPressureManager::new(MemoryManagementConfig::default());
        let component = Arc::new(CountingReclaimable {
            calls: AtomicU64::new(0),
        });
        manager.register_reclaimable(component.clone());
        manager.buffer_pool().release(Vec::with_capacity(4096));

        let report = manager.manage_memory(&metrics_at(96.0), 1000);

        assert_eq!(report.pressure, PressureLevel::Critical);
        assert!(report.gc_performed);
        assert!(report.cache_cleared);
        assert!(report.pool_shrunk);
        assert!(report.weak_refs_released);
        assert_eq!(report.new_batch_size, Some(300));
        assert!(report.memory_freed_mb >= 1.0);
        assert_eq!(component.calls.load(Ordering::Relaxed), 1);
        assert_eq!(manager.buffer_pool().idle_count(), 0);
    }

    #[test]
    fn test_high_and_medium_cascades() {
        let manager = MemoryPressureManager::new(MemoryManagementConfig::default());

        let high = manager.manage_memory(&metrics_at(88.0), 1001);
        assert!(high.gc_performed && high.cache_cleared);
        assert!(!high.pool_shrunk && !high.weak_refs_released);
        assert_eq!(high.new_batch_size, Some(601));

        let medium = manager.manage_memory(&metrics_at(72.0), 1000);
        assert!(!medium.gc_performed && medium.cache_cleared);
        assert_eq!(medium.new_batch_size, Some(800));

        let low = manager.manage_memory(&metrics_at(10.0), 1000);
        assert!(low.actions.is_empty());
        assert_eq!(low.new_batch_size, None);
    }

    #[test]
    fn test_toggles_gate_steps() {
        let config = MemoryManagementConfig {
            enable_gc: false,
            enable_pool_management: false,
            ..MemoryManagementConfig::default()
        };
        let manager = MemoryPressureManager::new(config);
        let report = manager.manage_memory(&metrics_at(99.0), 500);
        assert!(!report.gc_performed);
        assert!(!report.pool_shrunk);
        assert!(report.cache_cleared);
        assert!(report.weak_refs_released);
        assert_eq!(report.new_batch_size, Some(150));
    }

    #[test]
    fn test_cache_lru_and_limits() {
        let cache = ObjectCache::new(Duration::from_secs(3600), 3, 256.0);
        for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
            cache.insert(key, json!(value));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(cache.get("a"), Some(json!(1)));

        // "b" is now least recently used.
        cache.insert("d", json!(4));
        assert_eq!(cache.len(), 3);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.hit_rate() > 0.0 && cache.hit_rate() < 1.0);
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = ObjectCache::new(Duration::ZERO, 10, 1.0);
        cache.insert("a", json!({"x": 1}));
        let eviction = cache.purge_expired();
        assert_eq!(eviction.expired, 1);
        assert!(eviction.bytes_freed > 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_byte_limit_eviction() {
        let cache = ObjectCache::new(Duration::from_secs(3600), 100, 0.0);
        cache.insert("a", json!("payload"));
        cache.insert("b", json!("payload"));
        let eviction = cache.evict();
        assert_eq!(eviction.evicted, 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_tracks_bytes_across_replace_and_eviction() {
        let cache = ObjectCache::new(Duration::from_secs(3600), 2, 256.0);
        cache.insert("a", json!("first"));
        let single = cache.size_bytes();
        cache.insert("a", json!("first"));
        assert_eq!(cache.size_bytes(), single);

        cache.insert("b", json!("first"));
        cache.insert("c", json!("first"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.size_bytes(), single * 2);

        let cleared = cache.clear();
        assert_eq!(cleared.evicted, 2);
        assert_eq!(cleared.bytes_freed, single * 2);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_evict_pops_oldest_until_byte_cap_holds() {
        let sizing = ObjectCache::new(Duration::from_secs(3600), 10, 256.0);
        sizing.insert("k0", json!("payload"));
        let entry_bytes = sizing.size_bytes();

        // Room for two and a half entries; four are inserted before eviction runs.
        let cap_mb = (entry_bytes * 5 / 2) as f64 / BYTES_PER_MB;
        let cache = ObjectCache::new(Duration::from_secs(3600), 10, cap_mb);
        for key in ["k0", "k1", "k2", "k3"] {
            cache.insert(key, json!("payload"));
        }
        assert!(cache.get("k0").is_some());

        let eviction = cache.evict();
        assert_eq!(eviction.expired, 0);
        assert_eq!(eviction.evicted, 2);
        assert_eq!(eviction.bytes_freed, entry_bytes * 2);
        assert!(cache.get("k0").is_some());
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_none());
        assert!(cache.get("k3").is_some());
    }

    #[test]
    fn test_weak_registry_purges_dead() {
        let registry = WeakRegistry::new();
        let kept = Arc::new(5u32);
        {
            let dropped = Arc::new(String::from("transient"));
            registry.register("dropped", &dropped);
        }
        registry.register("kept", &kept);

        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.purge_dead(), 1);
        assert_eq!(registry.release_all(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_periodic_cleanup_reclaims_above_threshold() {
        let manager = MemoryPressureManager::new(MemoryManagementConfig::default());
        manager.register_reclaimable(Arc::new(CountingReclaimable {
            calls: AtomicU64::new(0),
        }));

        assert!(!manager.run_periodic_cleanup(40.0).reclamation_pass);
        let cleanup = manager.run_periodic_cleanup(80.0);
        assert!(cleanup.reclamation_pass);
        assert_eq!(manager.summary().reclamation_passes, 1);
    }
}
