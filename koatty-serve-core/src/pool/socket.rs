//! Socket pool strategies for HTTP/1.1 and HTTPS.
//!
//! Entries are accepted sockets. The serving task owns the stream; the pool
//! holds a pair of cancellation latches (`cancel` to stop serving, `closed`
//! raised by the task on exit) plus TLS metadata recorded at admission.

use crate::config::{ConnectionPoolConfig, Protocol};
use crate::pool::{ConnectionPool, PoolEntry, PoolEvent, PoolStrategy};
use crate::scheduler::MonitoringTask;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// TLS parameters negotiated at accept time.
#[derive(Debug, Clone)]
pub struct TlsConnectionInfo {
    pub version: String,
    pub cipher: String,
    /// False only when a requested client certificate failed verification.
    pub authorized: bool,
    /// SNI presented by the peer.
    pub servername: Option<String>,
}

/// Pool handle for one accepted socket.
#[derive(Clone)]
pub struct SocketHandle {
    /// Raised by the pool to stop the serving task.
    pub cancel: CancellationToken,
    /// Raised by the serving task when the socket is fully closed.
    pub closed: CancellationToken,
    pub tls: Option<TlsConnectionInfo>,
}

impl SocketHandle {
    pub fn plain() -> Self {
        Self {
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            tls: None,
        }
    }

    pub fn with_tls(info: TlsConnectionInfo) -> Self {
        Self {
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            tls: Some(info),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Marks the socket as fully closed; called by the serving task.
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }
}

/// Strategy for plain and TLS socket pools.
pub struct SocketStrategy {
    protocol: Protocol,
    require_tls: bool,
}

impl SocketStrategy {
    pub fn http() -> Self {
        Self {
            protocol: Protocol::Http,
            require_tls: false,
        }
    }

    pub fn https() -> Self {
        Self {
            protocol: Protocol::Https,
            require_tls: true,
        }
    }
}

pub type SocketPool = ConnectionPool<SocketStrategy>;

impl PoolStrategy for SocketStrategy {
    type Handle = SocketHandle;

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn validate(&self, handle: &SocketHandle) -> bool {
        if handle.is_closed() {
            return false;
        }
        if self.require_tls {
            // A socket without a negotiated cipher never enters the map.
            return handle
                .tls
                .as_ref()
                .is_some_and(|tls| !tls.cipher.is_empty());
        }
        true
    }

    fn is_healthy(&self, entry: &PoolEntry<Self>, config: &ConnectionPoolConfig) -> bool {
        if entry.handle.is_closed() {
            return false;
        }
        let budget = Duration::from_millis(config.connection_timeout_ms);
        if entry.last_used.elapsed() > budget {
            return false;
        }
        entry.handle.tls.as_ref().is_none_or(|tls| tls.authorized)
    }

    fn cleanup(&self, handle: &SocketHandle, _reason: &str) {
        handle.cancel.cancel();
    }

    async fn graceful_close(&self, handle: &SocketHandle) {
        handle.cancel.cancel();
        // Serving tasks half-close on cancellation; allow up to a second for
        // the close to be observed before the pool forces the rest.
        let _ = tokio::time::timeout(Duration::from_secs(1), handle.closed.cancelled()).await;
    }

    fn force_close(&self, handle: &SocketHandle) {
        handle.cancel.cancel();
        handle.closed.cancel();
    }

    fn after_admit(pool: &Arc<ConnectionPool<Self>>, id: &str) {
        spawn_admission_timer(pool, id);
    }

    fn monitoring_tasks(pool: &Arc<ConnectionPool<Self>>, prefix: &str) -> Vec<MonitoringTask> {
        vec![
            pool.health_task(prefix),
            pool.cleanup_task(prefix, "stale_connection"),
        ]
    }
}

/// Arms the per-connection lifetime timer: on expiry the entry is removed
/// with a `ConnectionTimeout` event. The timer is cancelled with the
/// connection.
pub(crate) fn spawn_admission_timer<S>(pool: &Arc<ConnectionPool<S>>, id: &str)
where
    S: PoolStrategy,
{
    let timeout_ms = pool.config().connection_timeout_ms;
    if timeout_ms == 0 {
        return;
    }
    let token = CancellationToken::new();
    pool.register_timer(id, token.clone());
    let weak = Arc::downgrade(pool);
    let id = id.to_string();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                if let Some(pool) = weak.upgrade() {
                    if pool.with_entry(&id, |_| ()).is_some() {
                        pool.emit_event(&PoolEvent::ConnectionTimeout { id: id.clone() });
                        pool.remove_connection(&id, "connection_timeout");
                    }
                }
            }
        }
    });
}
