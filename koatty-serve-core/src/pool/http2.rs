//! HTTP/2 pool strategy.
//!
//! Entries are sessions, not sockets. The session task owns the `h2`
//! connection; the pool drives keepalive pings through a command channel and
//! tracks per-session stream counters and GOAWAY state for shutdown
//! decisions.

use crate::config::{ConnectionPoolConfig, Protocol};
use crate::pool::{ConnectionPool, PoolEntry, PoolStrategy};
use crate::scheduler::MonitoringTask;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Commands sent from the pool to a session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H2Command {
    /// Send a keepalive ping.
    Ping,
    /// Send GOAWAY and stop accepting new streams.
    GoAway,
}

/// Pool handle for one HTTP/2 session.
#[derive(Clone)]
pub struct H2SessionHandle {
    pub cancel: CancellationToken,
    pub closed: CancellationToken,
    pub commands: mpsc::UnboundedSender<H2Command>,
    pub active_streams: Arc<AtomicUsize>,
    goaway: Arc<AtomicBool>,
    /// Effective local window configured for the session.
    pub initial_window: u32,
    last_ping: Arc<StdMutex<Option<Instant>>>,
    last_ping_ack: Arc<StdMutex<Option<Instant>>>,
}

impl H2SessionHandle {
    pub fn new(commands: mpsc::UnboundedSender<H2Command>, initial_window: u32) -> Self {
        Self {
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            commands,
            active_streams: Arc::new(AtomicUsize::new(0)),
            goaway: Arc::new(AtomicBool::new(false)),
            initial_window,
            last_ping: Arc::new(StdMutex::new(None)),
            last_ping_ack: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Marks the session as draining: new streams are refused while existing
    /// streams complete.
    pub fn mark_goaway(&self) {
        self.goaway.store(true, Ordering::SeqCst);
    }

    pub fn goaway_received(&self) -> bool {
        self.goaway.load(Ordering::SeqCst)
    }

    pub fn stream_opened(&self) -> usize {
        self.active_streams.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn stream_closed(&self) -> usize {
        let previous = self.active_streams.load(Ordering::SeqCst);
        if previous > 0 {
            self.active_streams.fetch_sub(1, Ordering::SeqCst);
        }
        self.active_streams.load(Ordering::SeqCst)
    }

    pub fn record_ping(&self) {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn record_ping_ack(&self) {
        *self.last_ping_ack.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_ping_ack(&self) -> Option<Instant> {
        *self.last_ping_ack.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True when the last ping went unacknowledged beyond `ack_budget`.
    pub fn ping_overdue(&self, ack_budget: Duration) -> bool {
        let Some(ping) = self.last_ping() else {
            return false;
        };
        if ping.elapsed() < ack_budget {
            return false;
        }
        match self.last_ping_ack() {
            Some(ack) => ack < ping,
            None => true,
        }
    }
}

/// Strategy for HTTP/2 session pools.
pub struct H2SessionStrategy;

pub type H2SessionPool = ConnectionPool<H2SessionStrategy>;

impl PoolStrategy for H2SessionStrategy {
    type Handle = H2SessionHandle;

    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn validate(&self, handle: &H2SessionHandle) -> bool {
        !handle.is_closed() && !handle.goaway_received() && handle.initial_window > 0
    }

    fn is_healthy(&self, entry: &PoolEntry<Self>, config: &ConnectionPoolConfig) -> bool {
        let handle = &entry.handle;
        if handle.is_closed() {
            return false;
        }
        // Draining sessions stay until their streams complete.
        if handle.goaway_received() {
            return handle.active_streams.load(Ordering::SeqCst) > 0;
        }
        let keep_alive = Duration::from_millis(config.http2().keep_alive_time_ms);
        !handle.ping_overdue(keep_alive)
    }

    fn cleanup(&self, handle: &H2SessionHandle, _reason: &str) {
        let _ = handle.commands.send(H2Command::GoAway);
        handle.cancel.cancel();
    }

    async fn graceful_close(&self, handle: &H2SessionHandle) {
        let _ = handle.commands.send(H2Command::GoAway);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle.closed.cancelled()).await;
    }

    fn force_close(&self, handle: &H2SessionHandle) {
        handle.cancel.cancel();
        handle.closed.cancel();
    }

    fn monitoring_tasks(pool: &Arc<ConnectionPool<Self>>, prefix: &str) -> Vec<MonitoringTask> {
        let keep_alive =
            Duration::from_millis(pool.config().http2().keep_alive_time_ms.max(1_000));
        let weak = Arc::downgrade(pool);
        let ping = MonitoringTask::new(&format!("{}:ping", prefix), keep_alive, 3, move || {
            let weak = weak.clone();
            async move {
                if let Some(pool) = weak.upgrade() {
                    for id in pool.connection_ids() {
                        pool.with_entry(&id, |entry| {
                            if !entry.handle.goaway_received() {
                                entry.handle.record_ping();
                                let _ = entry.handle.commands.send(H2Command::Ping);
                            }
                        });
                    }
                }
                Ok(())
            }
        })
        .with_description("session keepalive ping");

        vec![
            ping,
            pool.health_task(prefix),
            pool.cleanup_task(prefix, "stale_session"),
        ]
    }
}
