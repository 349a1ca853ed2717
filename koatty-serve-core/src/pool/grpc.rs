//! gRPC pool strategy.
//!
//! Entries are logical calls keyed by service, method, and peer. Admission
//! happens per call in the server's tower layer; draining flips the pool
//! flag, which new calls observe and reject while existing calls run to
//! completion.

use crate::config::{ConnectionPoolConfig, Protocol};
use crate::pool::{ConnectionPool, PoolEntry, PoolStrategy};
use crate::scheduler::MonitoringTask;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pool handle for one in-flight call.
#[derive(Clone)]
pub struct GrpcCallHandle {
    pub cancel: CancellationToken,
    /// Raised when the call completes (response body finished or failed).
    pub completed: CancellationToken,
    pub service: String,
    pub method: String,
    pub peer: String,
}

impl GrpcCallHandle {
    pub fn new(service: &str, method: &str, peer: &str) -> Self {
        Self {
            cancel: CancellationToken::new(),
            completed: CancellationToken::new(),
            service: service.to_string(),
            method: method.to_string(),
            peer: peer.to_string(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }

    pub fn mark_completed(&self) {
        self.completed.cancel();
    }
}

/// Strategy for gRPC call pools.
pub struct GrpcCallStrategy;

pub type GrpcCallPool = ConnectionPool<GrpcCallStrategy>;

impl PoolStrategy for GrpcCallStrategy {
    type Handle = GrpcCallHandle;

    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    fn validate(&self, handle: &GrpcCallHandle) -> bool {
        !handle.is_completed() && !handle.service.is_empty()
    }

    fn is_healthy(&self, entry: &PoolEntry<Self>, config: &ConnectionPoolConfig) -> bool {
        if entry.handle.is_completed() {
            return false;
        }
        // A call that outlives the connection budget is stale.
        entry.created_at.elapsed() <= Duration::from_millis(config.connection_timeout_ms)
    }

    fn cleanup(&self, handle: &GrpcCallHandle, _reason: &str) {
        handle.cancel.cancel();
    }

    async fn graceful_close(&self, handle: &GrpcCallHandle) {
        // Existing calls drain on their own; wait briefly for completion.
        let _ = tokio::time::timeout(Duration::from_secs(1), handle.completed.cancelled()).await;
    }

    fn force_close(&self, handle: &GrpcCallHandle) {
        handle.cancel.cancel();
        handle.completed.cancel();
    }

    fn monitoring_tasks(pool: &Arc<ConnectionPool<Self>>, prefix: &str) -> Vec<MonitoringTask> {
        vec![
            pool.health_task(prefix),
            pool.cleanup_task(prefix, "stale_call"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::StructuredLogger;

    fn call_pool(max: usize) -> Arc<GrpcCallPool> {
        let config = ConnectionPoolConfig {
            max_connections: max,
            ..Default::default()
        };
        ConnectionPool::new(GrpcCallStrategy, config, &StructuredLogger::new()).unwrap()
    }

    #[tokio::test]
    async fn test_per_call_admission() {
        let pool = call_pool(2);
        let a = pool.register_connection(
            GrpcCallHandle::new("pkg.Greeter", "SayHello", "127.0.0.1:5001"),
            None,
        );
        let b = pool.register_connection(
            GrpcCallHandle::new("pkg.Greeter", "SayHello", "127.0.0.1:5002"),
            None,
        );
        let c = pool.register_connection(
            GrpcCallHandle::new("pkg.Greeter", "SayHello", "127.0.0.1:5003"),
            None,
        );
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
    }

    #[tokio::test]
    async fn test_draining_rejects_new_calls() {
        let pool = call_pool(10);
        pool.close_all_connections(Duration::from_millis(50)).await;
        assert!(pool
            .register_connection(GrpcCallHandle::new("pkg.S", "M", "peer"), None)
            .is_none());
    }

    #[tokio::test]
    async fn test_completed_call_is_invalid() {
        let pool = call_pool(10);
        let handle = GrpcCallHandle::new("pkg.S", "M", "peer");
        handle.mark_completed();
        assert!(pool.register_connection(handle, None).is_none());
    }

    #[tokio::test]
    async fn test_release_decrements_exactly_once() {
        let pool = call_pool(10);
        let id = pool
            .register_connection(GrpcCallHandle::new("pkg.S", "M", "peer"), None)
            .unwrap();
        assert_eq!(pool.get_active_connection_count(), 1);
        assert!(pool.remove_connection(&id, "call_completed"));
        assert!(!pool.remove_connection(&id, "call_completed"));
        assert_eq!(pool.get_active_connection_count(), 0);
    }
}
