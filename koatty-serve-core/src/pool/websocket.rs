//! WebSocket pool strategy.
//!
//! The server never originates connections; accepted upgrades are registered
//! here. A ping task clears each entry's liveness flag and a heartbeat task
//! sweeps entries whose pong never arrived, removing them with reason
//! `dead_connection`.

use crate::config::{ConnectionPoolConfig, Protocol};
use crate::pool::{ConnectionPool, PoolEntry, PoolStrategy};
use crate::scheduler::MonitoringTask;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Close code for orderly pool cleanup.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent when admission is denied due to overload.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Close code sent on internal failure.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Commands sent from the pool to a socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsCommand {
    Ping,
    Close { code: u16, reason: String },
}

/// Pool handle for one accepted WebSocket.
#[derive(Clone)]
pub struct WsHandle {
    pub cancel: CancellationToken,
    pub closed: CancellationToken,
    pub commands: mpsc::UnboundedSender<WsCommand>,
    is_alive: Arc<AtomicBool>,
    last_ping: Arc<StdMutex<Option<Instant>>>,
    last_pong: Arc<StdMutex<Option<Instant>>>,
}

impl WsHandle {
    pub fn new(commands: mpsc::UnboundedSender<WsCommand>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            commands,
            // Liveness starts true; the first ping clears it.
            is_alive: Arc::new(AtomicBool::new(true)),
            last_ping: Arc::new(StdMutex::new(None)),
            last_pong: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::SeqCst)
    }

    /// Ping sent: clear liveness until the pong arrives.
    pub fn record_ping(&self) {
        self.is_alive.store(false, Ordering::SeqCst);
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// Pong received: the peer is alive.
    pub fn record_pong(&self) {
        self.is_alive.store(true, Ordering::SeqCst);
        *self.last_pong.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Strategy for WS and WSS pools.
pub struct WsSocketStrategy {
    protocol: Protocol,
}

impl WsSocketStrategy {
    pub fn ws() -> Self {
        Self {
            protocol: Protocol::Ws,
        }
    }

    pub fn wss() -> Self {
        Self {
            protocol: Protocol::Wss,
        }
    }
}

pub type WsSocketPool = ConnectionPool<WsSocketStrategy>;

impl PoolStrategy for WsSocketStrategy {
    type Handle = WsHandle;

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn validate(&self, handle: &WsHandle) -> bool {
        !handle.is_closed()
    }

    fn is_healthy(&self, entry: &PoolEntry<Self>, _config: &ConnectionPoolConfig) -> bool {
        !entry.handle.is_closed() && entry.handle.is_alive()
    }

    fn cleanup(&self, handle: &WsHandle, reason: &str) {
        if reason == "dead_connection" {
            // Peer already failed its heartbeat; no close frame will arrive.
            handle.cancel.cancel();
            return;
        }
        let _ = handle.commands.send(WsCommand::Close {
            code: CLOSE_NORMAL,
            reason: "Connection pool cleanup".to_string(),
        });
        handle.cancel.cancel();
    }

    async fn graceful_close(&self, handle: &WsHandle) {
        let _ = handle.commands.send(WsCommand::Close {
            code: CLOSE_NORMAL,
            reason: "Connection pool cleanup".to_string(),
        });
        let _ = tokio::time::timeout(Duration::from_secs(1), handle.closed.cancelled()).await;
    }

    fn force_close(&self, handle: &WsHandle) {
        handle.cancel.cancel();
        handle.closed.cancel();
    }

    fn monitoring_tasks(pool: &Arc<ConnectionPool<Self>>, prefix: &str) -> Vec<MonitoringTask> {
        let ws_options = pool.config().websocket();
        let ping_interval = Duration::from_millis(ws_options.ping_interval_ms.max(10));
        let heartbeat_interval = Duration::from_millis(ws_options.heartbeat_interval_ms.max(10));

        let ping_pool = Arc::downgrade(pool);
        let ping = MonitoringTask::new(
            &format!("{}:ping", prefix),
            ping_interval,
            3,
            move || {
                let ping_pool = ping_pool.clone();
                async move {
                    if let Some(pool) = ping_pool.upgrade() {
                        for id in pool.connection_ids() {
                            pool.with_entry(&id, |entry| {
                                entry.handle.record_ping();
                                let _ = entry.handle.commands.send(WsCommand::Ping);
                            });
                        }
                    }
                    Ok(())
                }
            },
        )
        .with_description("websocket ping");

        let pong_timeout = Duration::from_millis(ws_options.pong_timeout_ms);
        let sweep_pool = Arc::downgrade(pool);
        let heartbeat = MonitoringTask::new(
            &format!("{}:heartbeat", prefix),
            heartbeat_interval,
            4,
            move || {
                let sweep_pool = sweep_pool.clone();
                async move {
                    if let Some(pool) = sweep_pool.upgrade() {
                        let dead: Vec<String> = pool
                            .connection_ids()
                            .into_iter()
                            .filter(|id| {
                                pool.with_entry(id, |entry| {
                                    !entry.handle.is_alive()
                                        && entry
                                            .handle
                                            .last_ping()
                                            .is_some_and(|at| at.elapsed() >= pong_timeout)
                                })
                                .unwrap_or(false)
                            })
                            .collect();
                        for id in dead {
                            pool.remove_connection(&id, "dead_connection");
                        }
                    }
                    Ok(())
                }
            },
        )
        .with_description("websocket heartbeat sweep");

        vec![ping, heartbeat, pool.health_task(prefix)]
    }
}
