//! Multi-protocol supervisor.
//!
//! Fans one configuration out to one server per protocol on sequential
//! ports. Start and stop fan out to every child; a child's failure is
//! reported without short-circuiting its siblings.

use crate::config::{HarnessConfig, ListeningOptions, Protocol};
use crate::logging::StructuredLogger;
use crate::metrics::PerformanceMetrics;
use crate::pool::socket::SocketStrategy;
use crate::pool::websocket::WsSocketStrategy;
use crate::pool::http2::H2SessionStrategy;
use crate::scheduler::MonitoringScheduler;
use crate::server::grpc::GrpcServer;
use crate::server::http::HttpAdapter;
use crate::server::http2::Http2Adapter;
use crate::server::https::HttpsAdapter;
use crate::server::websocket::WsAdapter;
use crate::server::{
    HarnessServer, HealthCheckResult, HttpHandler, ServerStatus, WsRouter,
};
use crate::ServeError;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tonic::service::Routes;
use tracing::{error, info};

/// Application collaborators consumed by the harness: the HTTP callback,
/// the WebSocket route map, and the gRPC service routes.
#[derive(Clone)]
pub struct Application {
    pub http_handler: HttpHandler,
    pub ws_routes: WsRouter,
    pub grpc_routes: Option<Routes>,
}

impl Default for Application {
    fn default() -> Self {
        Self {
            http_handler: crate::server::default_http_handler(),
            ws_routes: WsRouter::new(),
            grpc_routes: None,
        }
    }
}

/// One protocol server instance; tagged-variant dispatch over the concrete
/// adapter types.
#[derive(Clone)]
pub enum ProtocolServer {
    Http(Arc<HarnessServer<HttpAdapter>>),
    Https(Arc<HarnessServer<HttpsAdapter>>),
    Http2(Arc<HarnessServer<Http2Adapter>>),
    Ws(Arc<HarnessServer<WsAdapter>>),
    Wss(Arc<HarnessServer<WsAdapter>>),
    Grpc(Arc<GrpcServer>),
}

macro_rules! dispatch {
    ($self:expr, $server:ident => $body:expr) => {
        match $self {
            ProtocolServer::Http($server) => $body,
            ProtocolServer::Https($server) => $body,
            ProtocolServer::Http2($server) => $body,
            ProtocolServer::Ws($server) => $body,
            ProtocolServer::Wss($server) => $body,
            ProtocolServer::Grpc($server) => $body,
        }
    };
}

impl ProtocolServer {
    pub fn id(&self) -> String {
        dispatch!(self, s => s.state.id.clone())
    }

    pub fn protocol(&self) -> Protocol {
        dispatch!(self, s => s.state.protocol)
    }

    pub fn status(&self) -> ServerStatus {
        dispatch!(self, s => s.state.status())
    }

    pub fn is_listening(&self) -> bool {
        dispatch!(self, s => s.state.is_listening())
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        dispatch!(self, s => s.state.bound_addr())
    }

    pub fn port(&self) -> u16 {
        dispatch!(self, s => s.state.options().port)
    }

    pub fn uptime_ms(&self) -> u64 {
        dispatch!(self, s => s.state.uptime_ms())
    }

    pub fn active_connections(&self) -> usize {
        dispatch!(self, s => s.pool.get_active_connection_count())
    }

    pub async fn start(&self) -> Result<(), ServeError> {
        dispatch!(self, s => s.start().await)
    }

    pub async fn stop(&self, timeout: Duration) -> Result<(), ServeError> {
        dispatch!(self, s => s.stop(timeout).await)
    }

    pub async fn stop_with_drain(
        &self,
        timeout: Duration,
        drain_delay: Duration,
    ) -> Result<(), ServeError> {
        dispatch!(self, s => s.stop_with_drain(timeout, drain_delay).await)
    }

    pub async fn update_config(&self, options: ListeningOptions) -> Result<bool, ServeError> {
        dispatch!(self, s => s.update_config(options).await)
    }

    pub fn get_health(&self) -> HealthCheckResult {
        dispatch!(self, s => s.get_health())
    }

    pub fn sample_metrics(&self) -> PerformanceMetrics {
        dispatch!(self, s => s.sample_metrics())
    }

    pub fn metrics_history(&self) -> Vec<PerformanceMetrics> {
        dispatch!(self, s => s.state.history.snapshot())
    }

    pub fn set_kill_received(&self) {
        dispatch!(self, s => s.state.set_status(ServerStatus::KillReceived))
    }
}

/// Hosts one server per configured protocol on `base_port + index`.
pub struct MultiProtocolServer {
    servers: Vec<ProtocolServer>,
    scheduler: Arc<MonitoringScheduler>,
    logger: StructuredLogger,
}

impl MultiProtocolServer {
    pub fn new(
        config: &HarnessConfig,
        app: Application,
        scheduler: Arc<MonitoringScheduler>,
        logger: &StructuredLogger,
    ) -> Result<Self, ServeError> {
        config.validate()?;
        let mut servers = Vec::with_capacity(config.protocols.len());
        for (index, protocol) in config.protocols.iter().enumerate() {
            let options = config.options_for(*protocol, index as u16);
            let server = match protocol {
                Protocol::Http => ProtocolServer::Http(HarnessServer::new(
                    HttpAdapter::new(app.http_handler.clone()),
                    SocketStrategy::http(),
                    options,
                    Arc::clone(&scheduler),
                    logger,
                )?),
                Protocol::Https => ProtocolServer::Https(HarnessServer::new(
                    HttpsAdapter::new(app.http_handler.clone()),
                    SocketStrategy::https(),
                    options,
                    Arc::clone(&scheduler),
                    logger,
                )?),
                Protocol::Http2 => ProtocolServer::Http2(HarnessServer::new(
                    Http2Adapter::new(app.http_handler.clone()),
                    H2SessionStrategy,
                    options,
                    Arc::clone(&scheduler),
                    logger,
                )?),
                Protocol::Ws => ProtocolServer::Ws(HarnessServer::new(
                    WsAdapter::ws(app.ws_routes.clone()),
                    WsSocketStrategy::ws(),
                    options,
                    Arc::clone(&scheduler),
                    logger,
                )?),
                Protocol::Wss => ProtocolServer::Wss(HarnessServer::new(
                    WsAdapter::wss(app.ws_routes.clone()),
                    WsSocketStrategy::wss(),
                    options,
                    Arc::clone(&scheduler),
                    logger,
                )?),
                Protocol::Grpc => ProtocolServer::Grpc(GrpcServer::new(
                    app.grpc_routes.clone().unwrap_or_default(),
                    options,
                    Arc::clone(&scheduler),
                    logger,
                )?),
            };
            servers.push(server);
        }
        Ok(Self {
            servers,
            scheduler,
            logger: logger.clone(),
        })
    }

    pub fn servers(&self) -> &[ProtocolServer] {
        &self.servers
    }

    pub fn scheduler(&self) -> &Arc<MonitoringScheduler> {
        &self.scheduler
    }

    /// Returns a specific child, optionally narrowed by port.
    pub fn get_server(&self, protocol: Protocol, port: Option<u16>) -> Option<&ProtocolServer> {
        self.servers
            .iter()
            .find(|s| s.protocol() == protocol && port.is_none_or(|p| s.port() == p))
    }

    pub fn get_server_by_id(&self, id: &str) -> Option<&ProtocolServer> {
        self.servers.iter().find(|s| s.id() == id)
    }

    /// Starts every child concurrently; failures are reported per child.
    pub async fn start(&self) -> Vec<(String, Result<(), ServeError>)> {
        self.scheduler_handle();
        let results = join_all(self.servers.iter().map(|server| async move {
            let id = server.id();
            let result = server.start().await;
            if let Err(e) = &result {
                error!(server = %id, error = %e, "Server failed to start");
            }
            (id, result)
        }))
        .await;
        info!(servers = results.len(), "Supervisor start fan-out complete");
        results
    }

    fn scheduler_handle(&self) {
        self.scheduler.start();
    }

    /// Stops every child concurrently and resolves once all are done.
    pub async fn stop(&self, timeout: Duration) -> Vec<(String, Result<(), ServeError>)> {
        let results = join_all(self.servers.iter().map(|server| async move {
            let id = server.id();
            let result = server.stop(timeout).await;
            if let Err(e) = &result {
                error!(server = %id, error = %e, "Server failed to stop");
            }
            (id, result)
        }))
        .await;
        info!(servers = results.len(), "Supervisor stop fan-out complete");
        results
    }

    /// Marks every child as having observed the kill signal.
    pub fn mark_kill_received(&self) {
        for server in &self.servers {
            server.set_kill_received();
        }
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;

    fn config(protocols: &[Protocol]) -> HarnessConfig {
        HarnessConfig {
            protocols: protocols.to_vec(),
            hostname: "127.0.0.1".into(),
            port: 0,
            trace: false,
            ext: Default::default(),
            ssl: None,
            connection_pool: Default::default(),
            admin: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_instantiation() {
        let supervisor = MultiProtocolServer::new(
            &config(&[Protocol::Http, Protocol::Ws, Protocol::Grpc]),
            Application::default(),
            Arc::new(MonitoringScheduler::with_default_tick()),
            &StructuredLogger::new(),
        )
        .unwrap();
        assert_eq!(supervisor.servers().len(), 3);
        assert!(supervisor.get_server(Protocol::Http, None).is_some());
        assert!(supervisor.get_server(Protocol::Ws, None).is_some());
        assert!(supervisor.get_server(Protocol::Grpc, None).is_some());
        assert!(supervisor.get_server(Protocol::Https, None).is_none());
    }

    #[tokio::test]
    async fn test_sequential_ports() {
        let supervisor = MultiProtocolServer::new(
            &HarnessConfig {
                port: 4000,
                ..config(&[Protocol::Http, Protocol::Ws])
            },
            Application::default(),
            Arc::new(MonitoringScheduler::with_default_tick()),
            &StructuredLogger::new(),
        )
        .unwrap();
        assert_eq!(supervisor.servers()[0].port(), 4000);
        assert_eq!(supervisor.servers()[1].port(), 4001);
    }

    #[tokio::test]
    async fn test_unique_server_ids() {
        let supervisor = MultiProtocolServer::new(
            &config(&[Protocol::Http, Protocol::Ws]),
            Application::default(),
            Arc::new(MonitoringScheduler::with_default_tick()),
            &StructuredLogger::new(),
        )
        .unwrap();
        let ids: Vec<String> = supervisor.servers().iter().map(|s| s.id()).collect();
        assert_ne!(ids[0], ids[1]);
        assert!(supervisor.get_server_by_id(&ids[0]).is_some());
        assert!(supervisor.get_server_by_id("missing").is_none());
    }
}
