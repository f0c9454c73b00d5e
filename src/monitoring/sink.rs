//! Bounded telemetry queues drained into the repository by background consumers.

use super::{Alert, LogEntry, MonitorMetrics, MonitoringEvent, MonitoringRepository};
use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub log_queue_capacity: usize,
    pub alert_queue_capacity: usize,
    pub event_queue_capacity: usize,
    /// How long `shutdown` waits for consumers to drain before aborting them
    pub shutdown_timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            log_queue_capacity: 10_000,
            alert_queue_capacity: 1_000,
            event_queue_capacity: 5_000,
            shutdown_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Log,
    Alert,
    Event,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Log => "log",
            QueueKind::Alert => "alert",
            QueueKind::Event => "event",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// Lock-free counters shared between producers and consumers.
#[derive(Debug, Default)]
pub struct SinkStats {
    log: QueueCounters,
    alert: QueueCounters,
    event: QueueCounters,
    persist_count: AtomicU64,
    persist_total_us: AtomicU64,
    last_persist_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub persisted: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkStatsSnapshot {
    pub log: QueueStatsSnapshot,
    pub alert: QueueStatsSnapshot,
    pub event: QueueStatsSnapshot,
    pub average_persist_ms: f64,
    pub last_persist_ms: f64,
}

impl SinkStatsSnapshot {
    pub fn queue(&self, kind: QueueKind) -> QueueStatsSnapshot {
        match kind {
            QueueKind::Log => self.log,
            QueueKind::Alert => self.alert,
            QueueKind::Event => self.event,
        }
    }

    pub fn total_dropped(&self) -> u64 {
        self.log.dropped + self.alert.dropped + self.event.dropped
    }
}

impl SinkStats {
    fn counters(&self, kind: QueueKind) -> &QueueCounters {
        match kind {
            QueueKind::Log => &self.log,
            QueueKind::Alert => &self.alert,
            QueueKind::Event => &self.event,
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.persist_count.fetch_add(1, Ordering::Relaxed);
        self.persist_total_us.fetch_add(micros, Ordering::Relaxed);
        self.last_persist_us.store(micros, Ordering::Relaxed);
    }

    /// Mean repository write latency in milliseconds, 0 before the first write.
    pub fn average_persist_ms(&self) -> f64 {
        let count = self.persist_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.persist_total_us.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    pub fn snapshot(&self) -> SinkStatsSnapshot {
        let queue = |c: &QueueCounters| QueueStatsSnapshot {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            persisted: c.persisted.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        };
        SinkStatsSnapshot {
            log: queue(&self.log),
            alert: queue(&self.alert),
            event: queue(&self.event),
            average_persist_ms: self.average_persist_ms(),
            last_persist_ms: self.last_persist_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

type PersistFn<T> =
    Arc<dyn Fn(Arc<dyn MonitoringRepository>, T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Three independent bounded queues, each with exactly one consumer task.
///
/// Enqueueing never blocks: when a queue is full the newest record is dropped
/// and counted. Nothing is retried.
pub struct EventSink {
    log_tx: mpsc::Sender<LogEntry>,
    alert_tx: mpsc::Sender<Alert>,
    event_tx: mpsc::Sender<MonitoringEvent>,
    shutdown_tx: broadcast::Sender<()>,
    consumers: Mutex<Vec<(QueueKind, JoinHandle<()>)>>,
    stats: Arc<SinkStats>,
    metrics: Arc<MonitorMetrics>,
    shutdown_timeout: Duration,
}

impl EventSink {
    /// Spawn the consumers. Must be called from within a tokio runtime.
    ///
    /// Consumers stop when `shutdown_tx` fires, after draining what is queued.
    pub fn start(
        repository: Arc<dyn MonitoringRepository>,
        config: &SinkConfig,
        metrics: Arc<MonitorMetrics>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let stats = Arc::new(SinkStats::default());

        let (log_tx, log_rx) = mpsc::channel(config.log_queue_capacity.max(1));
        let (alert_tx, alert_rx) = mpsc::channel(config.alert_queue_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity.max(1));

        let persist_log: PersistFn<LogEntry> = Arc::new(|repo, entry: LogEntry| {
            async move { repo.insert_log(&entry).await }.boxed()
        });
        let persist_alert: PersistFn<Alert> = Arc::new(|repo, alert: Alert| {
            async move { repo.insert_alert(&alert).await }.boxed()
        });
        let persist_event: PersistFn<MonitoringEvent> =
            Arc::new(|repo, event: MonitoringEvent| {
                async move { repo.insert_event(&event).await }.boxed()
            });

        let consumers = vec![
            (
                QueueKind::Log,
                spawn_consumer(
                    QueueKind::Log,
                    log_rx,
                    shutdown_tx.subscribe(),
                    repository.clone(),
                    persist_log,
                    stats.clone(),
                    metrics.clone(),
                ),
            ),
            (
                QueueKind::Alert,
                spawn_consumer(
                    QueueKind::Alert,
                    alert_rx,
                    shutdown_tx.subscribe(),
                    repository.clone(),
                    persist_alert,
                    stats.clone(),
                    metrics.clone(),
                ),
            ),
            (
                QueueKind::Event,
                spawn_consumer(
                    QueueKind::Event,
                    event_rx,
                    shutdown_tx.subscribe(),
                    repository,
                    persist_event,
                    stats.clone(),
                    metrics.clone(),
                ),
            ),
        ];

        info!(
            "Event sink started (log={}, alert={}, event={})",
            config.log_queue_capacity, config.alert_queue_capacity, config.event_queue_capacity
        );

        Self {
            log_tx,
            alert_tx,
            event_tx,
            shutdown_tx,
            consumers: Mutex::new(consumers),
            stats,
            metrics,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        }
    }

    pub fn enqueue_log(&self, entry: LogEntry) -> bool {
        self.offer(QueueKind::Log, &self.log_tx, entry)
    }

    pub fn enqueue_alert(&self, alert: Alert) -> bool {
        self.offer(QueueKind::Alert, &self.alert_tx, alert)
    }

    pub fn enqueue_event(&self, event: MonitoringEvent) -> bool {
        self.offer(QueueKind::Event, &self.event_tx, event)
    }

    fn offer<T>(&self, kind: QueueKind, tx: &mpsc::Sender<T>, item: T) -> bool {
        let counters = self.stats.counters(kind);
        match tx.try_send(item) {
            Ok(()) => {
                counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .queue_enqueued_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                true
            }
            Err(e) => {
                let dropped = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.metrics
                    .queue_dropped_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                // First drop and every thousandth after it, to keep the log readable.
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!("{} queue {}, dropped {} records so far", kind, reason, dropped);
                } else {
                    debug!("{} queue {}, record dropped", kind, reason);
                }
                false
            }
        }
    }

    /// Records currently waiting in a queue.
    pub fn pending(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Log => self.log_tx.max_capacity() - self.log_tx.capacity(),
            QueueKind::Alert => self.alert_tx.max_capacity() - self.alert_tx.capacity(),
            QueueKind::Event => self.event_tx.max_capacity() - self.event_tx.capacity(),
        }
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn average_persist_ms(&self) -> f64 {
        self.stats.average_persist_ms()
    }

    /// Signal consumers, let them drain, and abort any still running at the deadline.
    ///
    /// Returns true when every consumer finished on its own. Calling it again is a no-op.
    pub async fn shutdown(&self) -> bool {
        let _ = self.shutdown_tx.send(());

        let consumers = {
            let mut guard = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        if consumers.is_empty() {
            return true;
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut clean = true;
        for (kind, mut handle) in consumers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!("{} consumer stopped", kind),
                Ok(Err(e)) => {
                    warn!("{} consumer ended abnormally: {}", kind, e);
                    clean = false;
                }
                Err(_) => {
                    handle.abort();
                    warn!(
                        "{} consumer did not drain within {:?}; aborted with {} records queued",
                        kind,
                        self.shutdown_timeout,
                        self.pending(kind)
                    );
                    clean = false;
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            "Event sink stopped (persisted log={} alert={} event={}, dropped={})",
            stats.log.persisted,
            stats.alert.persisted,
            stats.event.persisted,
            stats.total_dropped()
        );
        clean
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("stats", &self.stats.snapshot())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

fn spawn_consumer<T: Send + 'static>(
    kind: QueueKind,
    mut rx: mpsc::Receiver<T>,
    mut shutdown_rx: broadcast::Receiver<()>,
    repository: Arc<dyn MonitoringRepository>,
    persist: PersistFn<T>,
    stats: Arc<SinkStats>,
    metrics: Arc<MonitorMetrics>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let persist_one = |item: T| {
            let fut = persist(repository.clone(), item);
            let stats = stats.clone();
            let metrics = metrics.clone();
            async move {
                let started = Instant::now();
                let result = fut.await;
                stats.record_latency(started.elapsed());
                let counters = stats.counters(kind);
                match result {
                    Ok(()) => {
                        counters.persisted.fetch_add(1, Ordering::Relaxed);
                        metrics
                            .queue_persisted_total
                            .with_label_values(&[kind.as_str()])
                            .inc();
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        metrics
                            .queue_persist_failures_total
                            .with_label_values(&[kind.as_str()])
                            .inc();
                        warn!("Failed to persist {} record, discarding: {}", kind, e);
                    }
                }
            }
        };

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => persist_one(item).await,
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(item) = rx.recv().await {
                        persist_one(item).await;
                        drained += 1;
                    }
                    debug!("{} consumer drained {} records on shutdown", kind, drained);
                    break;
                }
            }
        }
    })
}
