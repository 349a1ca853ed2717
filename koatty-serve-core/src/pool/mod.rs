//! Protocol-agnostic connection pool.
//!
//! The pool owns admission control, health rollup, the event bus, metrics,
//! and config snapshots. Protocol particulars (validation, liveness, close
//! semantics, background tasks) are plugged in through [`PoolStrategy`].

pub mod grpc;
pub mod http2;
pub mod socket;
pub mod websocket;

use crate::config::{ConnectionPoolConfig, PoolConfigPatch, Protocol};
use crate::logging::{ConnectionEvent, LogContext, StructuredLogger};
use crate::scheduler::MonitoringTask;
use crate::util::generate_connection_id;
use crate::ServeError;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pool and server health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Overloaded,
    Unhealthy,
}

impl HealthStatus {
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Overloaded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Overloaded => "overloaded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Status derived from a utilization ratio.
    pub fn from_utilization(ratio: f64) -> HealthStatus {
        if ratio > 0.95 {
            HealthStatus::Overloaded
        } else if ratio > 0.8 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Pool event kinds, used for listener subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEventKind {
    ConnectionAdded,
    ConnectionRemoved,
    ConnectionTimeout,
    ConnectionError,
    PoolLimitReached,
    HealthStatusChanged,
}

/// Events emitted by the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    ConnectionAdded {
        id: String,
        remote_addr: Option<SocketAddr>,
        active: usize,
    },
    ConnectionRemoved {
        id: String,
        reason: String,
        active: usize,
    },
    ConnectionTimeout {
        id: String,
    },
    ConnectionError {
        id: Option<String>,
        message: String,
    },
    PoolLimitReached {
        active: usize,
        max: usize,
    },
    HealthStatusChanged {
        from: HealthStatus,
        to: HealthStatus,
    },
}

impl PoolEvent {
    pub fn kind(&self) -> PoolEventKind {
        match self {
            PoolEvent::ConnectionAdded { .. } => PoolEventKind::ConnectionAdded,
            PoolEvent::ConnectionRemoved { .. } => PoolEventKind::ConnectionRemoved,
            PoolEvent::ConnectionTimeout { .. } => PoolEventKind::ConnectionTimeout,
            PoolEvent::ConnectionError { .. } => PoolEventKind::ConnectionError,
            PoolEvent::PoolLimitReached { .. } => PoolEventKind::PoolLimitReached,
            PoolEvent::HealthStatusChanged { .. } => PoolEventKind::HealthStatusChanged,
        }
    }
}

pub type PoolListener = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

/// An admitted connection with its common metadata.
///
/// The native handle is owned exclusively by the pool from register until
/// release; removal is terminal and triggers native cleanup exactly once.
pub struct PoolEntry<S: PoolStrategy> {
    pub id: String,
    pub handle: S::Handle,
    pub created_at: Instant,
    pub last_used: Instant,
    /// In-pool-idle (`true`) vs in-pool-busy (`false`).
    pub available: bool,
    pub remote_addr: Option<SocketAddr>,
}

/// Protocol-specific behavior plugged into the pool.
pub trait PoolStrategy: Sized + Send + Sync + 'static {
    /// Opaque handle to the native connection. Handles are cheap bundles of
    /// cancellation tokens and channels, cloned for bounded close phases.
    type Handle: Clone + Send + Sync + 'static;

    fn protocol(&self) -> Protocol;

    /// Admission-time validation; rejected handles never enter the map.
    fn validate(&self, handle: &Self::Handle) -> bool;

    /// Protocol-specific liveness for an admitted entry.
    fn is_healthy(&self, entry: &PoolEntry<Self>, config: &ConnectionPoolConfig) -> bool;

    /// Cleanup on removal; invoked exactly once per entry.
    fn cleanup(&self, handle: &Self::Handle, reason: &str);

    /// Orderly close used by `close_all_connections`; the caller bounds it.
    fn graceful_close(&self, handle: &Self::Handle) -> impl Future<Output = ()> + Send;

    /// Immediate teardown for stragglers.
    fn force_close(&self, handle: &Self::Handle);

    /// Hook invoked right after admission (per-connection timers etc.).
    fn after_admit(_pool: &Arc<ConnectionPool<Self>>, _id: &str) {}

    /// Periodic tasks this strategy needs, registered with the unified
    /// scheduler under `prefix`.
    fn monitoring_tasks(pool: &Arc<ConnectionPool<Self>>, prefix: &str) -> Vec<MonitoringTask>;
}

/// Composite pool metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetricsSnapshot {
    pub protocol: String,
    pub health: PoolHealth,
    pub active_connections: usize,
    pub available_connections: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub max_connections: usize,
    pub connection_timeout_ms: u64,
    pub uptime_ms: u64,
}

/// Pool health with the derived utilization ratio.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolHealth {
    pub status: HealthStatus,
    pub utilization_ratio: f64,
    pub active_connections: usize,
    pub max_connections: usize,
}

/// Generic connection pool; one per server.
pub struct ConnectionPool<S: PoolStrategy> {
    strategy: S,
    config: StdRwLock<Arc<ConnectionPoolConfig>>,
    connections: DashMap<String, PoolEntry<S>>,
    /// Per-connection cancellation handles (admission timers), cleaned with
    /// the connection.
    timers: DashMap<String, CancellationToken>,
    listeners: StdRwLock<Vec<(usize, PoolEventKind, PoolListener)>>,
    next_listener_id: AtomicUsize,
    active: AtomicUsize,
    total_admitted: AtomicU64,
    rejected: AtomicU64,
    draining: AtomicBool,
    destroyed: AtomicBool,
    created_at: Instant,
    last_status: StdMutex<HealthStatus>,
    logger: StructuredLogger,
}

impl<S: PoolStrategy> ConnectionPool<S> {
    /// Creates a pool; invalid configuration is refused here.
    pub fn new(
        strategy: S,
        config: ConnectionPoolConfig,
        logger: &StructuredLogger,
    ) -> Result<Arc<Self>, ServeError> {
        config.validate()?;
        let protocol = strategy.protocol();
        Ok(Arc::new(Self {
            strategy,
            config: StdRwLock::new(Arc::new(config)),
            connections: DashMap::new(),
            timers: DashMap::new(),
            listeners: StdRwLock::new(Vec::new()),
            next_listener_id: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            total_admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            created_at: Instant::now(),
            last_status: StdMutex::new(HealthStatus::Healthy),
            logger: logger.child(LogContext {
                protocol: Some(protocol.as_str().to_string()),
                ..Default::default()
            }),
        }))
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn config(&self) -> Arc<ConnectionPoolConfig> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stops admissions without closing anything yet; step 1 of a graceful
    /// shutdown.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Re-opens admissions after a restart re-bind.
    pub fn reset_draining(&self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            self.draining.store(false, Ordering::SeqCst);
        }
    }

    /// True iff a new connection would currently be admitted.
    pub fn can_accept_connection(&self) -> bool {
        if self.draining.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        self.active.load(Ordering::SeqCst) < self.config().max_connections
    }

    /// Admits a connection, returning its pool id, or `None` on capacity or
    /// validation rejection. Never panics.
    pub fn register_connection(
        self: &Arc<Self>,
        handle: S::Handle,
        remote_addr: Option<SocketAddr>,
    ) -> Option<String> {
        if self.draining.load(Ordering::SeqCst) || self.destroyed.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            debug!(protocol = %self.strategy.protocol(), "Rejecting connection: pool draining");
            return None;
        }
        let max = self.config().max_connections;
        // Reserve a slot atomically with the capacity check.
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            self.emit_event(&PoolEvent::PoolLimitReached { active: max, max });
            return None;
        }
        if !self.strategy.validate(&handle) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.rejected.fetch_add(1, Ordering::SeqCst);
            self.logger.log_connection_event(
                ConnectionEvent::Error,
                "connection failed validation, not admitted",
                None,
            );
            return None;
        }

        let id = generate_connection_id(self.strategy.protocol().as_str());
        let now = Instant::now();
        self.connections.insert(
            id.clone(),
            PoolEntry {
                id: id.clone(),
                handle,
                created_at: now,
                last_used: now,
                available: true,
                remote_addr,
            },
        );
        self.total_admitted.fetch_add(1, Ordering::SeqCst);
        let active = self.active.load(Ordering::SeqCst);
        self.emit_event(&PoolEvent::ConnectionAdded {
            id: id.clone(),
            remote_addr,
            active,
        });
        self.logger.connection(&id).log_connection_event(
            ConnectionEvent::Connected,
            "connection admitted",
            None,
        );
        S::after_admit(self, &id);
        Some(id)
    }

    /// Single-shot removal: cancels pending timers, runs strategy cleanup,
    /// and emits `ConnectionRemoved`. A second call for the same id is a
    /// no-op.
    pub fn remove_connection(&self, id: &str, reason: &str) -> bool {
        let Some((_, entry)) = self.connections.remove(id) else {
            return false;
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some((_, timer)) = self.timers.remove(id) {
            timer.cancel();
        }
        self.strategy.cleanup(&entry.handle, reason);
        let active = self.active.load(Ordering::SeqCst);
        self.emit_event(&PoolEvent::ConnectionRemoved {
            id: id.to_string(),
            reason: reason.to_string(),
            active,
        });
        self.logger.connection(id).log_connection_event(
            ConnectionEvent::Disconnected,
            &format!("connection removed: {}", reason),
            None,
        );
        true
    }

    pub fn get_active_connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Protocol-specific health check; false when the id is unknown.
    pub fn is_connection_healthy(&self, id: &str) -> bool {
        let config = self.config();
        match self.connections.get(id) {
            Some(entry) => self.strategy.is_healthy(&entry, &config),
            None => false,
        }
    }

    /// Marks activity on a connection.
    pub fn touch(&self, id: &str) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.last_used = Instant::now();
        }
    }

    /// Marks a connection as serving work.
    pub fn mark_busy(&self, id: &str) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.available = false;
            entry.last_used = Instant::now();
        }
    }

    /// Marks a connection as idle again.
    pub fn mark_idle(&self, id: &str) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.available = true;
            entry.last_used = Instant::now();
        }
    }

    /// Runs `f` against an entry when present.
    pub fn with_entry<R>(&self, id: &str, f: impl FnOnce(&PoolEntry<S>) -> R) -> Option<R> {
        self.connections.get(id).map(|entry| f(&entry))
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Registers a per-connection cancellation handle, replacing (and
    /// cancelling) any previous one for the id.
    pub fn register_timer(&self, id: &str, token: CancellationToken) {
        if let Some(previous) = self.timers.insert(id.to_string(), token) {
            previous.cancel();
        }
    }

    /// Races graceful close of every connection against `timeout`, then
    /// force-closes stragglers. No admissions are observed once this starts.
    pub async fn close_all_connections(&self, timeout: Duration) {
        self.draining.store(true, Ordering::SeqCst);
        let snapshot: Vec<(String, S::Handle)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.handle.clone()))
            .collect();
        if !snapshot.is_empty() {
            debug!(
                protocol = %self.strategy.protocol(),
                connections = snapshot.len(),
                "Closing all pooled connections"
            );
            let graceful = join_all(
                snapshot
                    .iter()
                    .map(|(_, handle)| self.strategy.graceful_close(handle)),
            );
            if tokio::time::timeout(timeout, graceful).await.is_err() {
                warn!(
                    protocol = %self.strategy.protocol(),
                    "Graceful close timed out, forcing remaining connections"
                );
            }
        }
        for (id, handle) in snapshot {
            if self.connections.contains_key(&id) {
                self.strategy.force_close(&handle);
                self.remove_connection(&id, "force_closed");
            }
        }
    }

    /// Recomputes utilization and status, emitting `HealthStatusChanged` on
    /// transitions.
    pub fn get_health(&self) -> PoolHealth {
        let config = self.config();
        let active = self.active.load(Ordering::SeqCst);
        let max = config.max_connections;
        let ratio = if max == 0 {
            0.0
        } else {
            (active as f64 / max as f64).clamp(0.0, 1.0)
        };
        let status = if self.destroyed.load(Ordering::SeqCst) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::from_utilization(ratio)
        };

        let previous = {
            let mut last = self.last_status.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *last, status)
        };
        if previous != status {
            self.emit_event(&PoolEvent::HealthStatusChanged {
                from: previous,
                to: status,
            });
        }
        PoolHealth {
            status,
            utilization_ratio: ratio,
            active_connections: active,
            max_connections: max,
        }
    }

    /// Composite metrics: config, health, counters, uptime.
    pub fn get_metrics(&self) -> PoolMetricsSnapshot {
        let config = self.config();
        let health = self.get_health();
        let available = self.connections.iter().filter(|e| e.available).count();
        PoolMetricsSnapshot {
            protocol: self.strategy.protocol().as_str().to_string(),
            health,
            active_connections: health.active_connections,
            available_connections: available,
            total_connections: self.total_admitted.load(Ordering::SeqCst),
            rejected_connections: self.rejected.load(Ordering::SeqCst),
            max_connections: config.max_connections,
            connection_timeout_ms: config.connection_timeout_ms,
            uptime_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }

    /// Validates the merged snapshot and swaps it atomically. The prior
    /// snapshot stays intact on failure.
    pub fn update_config(&self, patch: &PoolConfigPatch) -> bool {
        let merged = self.config().merged(patch);
        if let Err(error) = merged.validate() {
            warn!(
                protocol = %self.strategy.protocol(),
                error = %error,
                "Rejected pool config update"
            );
            return false;
        }
        let mut slot = self.config.write().unwrap_or_else(|e| e.into_inner());
        *slot = Arc::new(merged);
        true
    }

    /// Subscribes to one event kind; returns the subscription id for `off`.
    pub fn on(&self, kind: PoolEventKind, listener: PoolListener) -> usize {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, kind, listener));
        id
    }

    pub fn off(&self, subscription: usize) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(id, _, _)| *id != subscription);
        listeners.len() != before
    }

    /// Dispatches an event to subscribers in registration order; listener
    /// panics are caught and logged without affecting siblings.
    pub fn emit_event(&self, event: &PoolEvent) {
        let kind = event.kind();
        let targets: Vec<PoolListener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, l)| l.clone())
                .collect()
        };
        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(protocol = %self.strategy.protocol(), event = ?kind, "Pool event listener panicked");
            }
        }
    }

    /// Closes everything (5 s budget) and clears listeners. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_all_connections(Duration::from_secs(5)).await;
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Health-refresh task shared by every strategy; keeps status
    /// transitions flowing while the pool is otherwise quiet.
    pub fn health_task(self: &Arc<Self>, prefix: &str) -> MonitoringTask {
        let pool = Arc::downgrade(self);
        MonitoringTask::new(
            &format!("{}:health", prefix),
            Duration::from_secs(30),
            2,
            move || {
                let pool = pool.clone();
                async move {
                    if let Some(pool) = pool.upgrade() {
                        pool.get_health();
                    }
                    Ok(())
                }
            },
        )
        .with_description("pool health rollup")
    }

    /// Staleness sweep shared by socket-style strategies.
    pub fn cleanup_task(self: &Arc<Self>, prefix: &str, reason: &'static str) -> MonitoringTask {
        let pool = Arc::downgrade(self);
        MonitoringTask::new(
            &format!("{}:cleanup", prefix),
            Duration::from_secs(30),
            5,
            move || {
                let pool = pool.clone();
                async move {
                    if let Some(pool) = pool.upgrade() {
                        pool.sweep_unhealthy(reason);
                    }
                    Ok(())
                }
            },
        )
        .with_description("stale connection sweep")
    }

    /// Removes entries the strategy no longer considers healthy.
    pub fn sweep_unhealthy(&self, reason: &str) -> usize {
        let config = self.config();
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| !self.strategy.is_healthy(entry, &config))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for id in stale {
            if self.remove_connection(&id, reason) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(
                protocol = %self.strategy.protocol(),
                removed,
                "Swept stale connections"
            );
        }
        removed
    }
}
