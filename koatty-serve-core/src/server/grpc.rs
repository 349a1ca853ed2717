//! gRPC server built on tonic.
//!
//! Channel options derive from the pool configuration. A tower layer wraps
//! every call: generate a call id, admit to the pool, forward, and release
//! exactly once when the response body finishes (or the call fails).
//! Draining and capacity rejections answer UNAVAILABLE without touching the
//! service.

use crate::config::{ListeningOptions, PoolConfigPatch, SslMode};
use crate::logging::ServerEvent;
use crate::metrics::PerformanceMetrics;
use crate::pool::grpc::{GrpcCallHandle, GrpcCallPool, GrpcCallStrategy};
use crate::pool::{ConnectionPool, HealthStatus, PoolStrategy};
use crate::scheduler::{MonitoringScheduler, MonitoringTask};
use crate::server::{
    base_health_checks, classify_config_change, graceful_shutdown, sample_performance,
    ConfigChange, HealthCheck, HealthCheckResult, ServerState, ServerStatus,
    DEFAULT_DRAIN_DELAY,
};
use crate::logging::StructuredLogger;
use crate::tls::pem_material;
use crate::ServeError;
use bytes::Bytes;
use http::header::HeaderValue;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::Body as TonicBody;
use tonic::service::Routes;
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};
use tonic::transport::{Certificate, Identity, Server as TonicServer, ServerTlsConfig};
use tower::{Layer, Service};
use tracing::{error, info};

/// Multi-protocol-capable gRPC endpoint sharing the server template's
/// lifecycle semantics.
pub struct GrpcServer {
    pub state: Arc<ServerState>,
    pub pool: Arc<GrpcCallPool>,
    routes: Routes,
    serve_task: StdMutex<Option<JoinHandle<()>>>,
}

impl GrpcServer {
    pub fn new(
        routes: Routes,
        options: ListeningOptions,
        scheduler: Arc<MonitoringScheduler>,
        logger: &StructuredLogger,
    ) -> Result<Arc<Self>, ServeError> {
        options.validate()?;
        let state = ServerState::new(options.clone(), scheduler, logger);
        let pool = ConnectionPool::new(
            GrpcCallStrategy,
            options.connection_pool.clone(),
            &state.logger,
        )?;
        Ok(Arc::new(Self {
            state,
            pool,
            routes,
            serve_task: StdMutex::new(None),
        }))
    }

    fn tls_config(options: &ListeningOptions) -> Result<Option<ServerTlsConfig>, ServeError> {
        let Some(ssl) = options.ssl.as_ref().filter(|ssl| ssl.enabled) else {
            return Ok(None);
        };
        let cert = ssl
            .cert
            .as_deref()
            .ok_or_else(|| ServeError::ConfigInvalid("ssl.cert is required".into()))?;
        let key = ssl
            .key
            .as_deref()
            .ok_or_else(|| ServeError::ConfigInvalid("ssl.key is required".into()))?;
        let identity = Identity::from_pem(pem_material(cert)?, pem_material(key)?);
        let mut tls = ServerTlsConfig::new().identity(identity);
        if ssl.effective_mode() == SslMode::MutualTls {
            let ca = ssl
                .ca
                .as_deref()
                .ok_or_else(|| ServeError::ConfigInvalid("ssl.ca is required for mutual TLS".into()))?;
            tls = tls.client_ca_root(Certificate::from_pem(pem_material(ca)?));
        }
        Ok(Some(tls))
    }

    /// Template start: compose the native server from channel options, bind,
    /// register monitoring. Bind failure logs `server_error` and leaves
    /// status at `created`.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServeError> {
        self.state
            .logger
            .log_server_event(ServerEvent::Starting, "server starting", None);
        self.state.set_status(ServerStatus::Starting);

        let options = self.state.options();
        let tls = Self::tls_config(&options).inspect_err(|_| {
            self.state.set_status(ServerStatus::Created);
        })?;
        let grpc_options = options.connection_pool.grpc();

        let addr = options.addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.logger.log_server_event(
                    ServerEvent::Error,
                    &format!("failed to bind {}: {}", addr, e),
                    None,
                );
                self.state.set_status(ServerStatus::Created);
                return Ok(());
            }
        };
        let local_addr = listener.local_addr()?;
        let incoming = TcpListenerStream::new(listener);
        let token = self.state.new_accept_token();

        let mut builder = TonicServer::builder()
            .tcp_nodelay(true)
            .tcp_keepalive(Some(Duration::from_millis(
                grpc_options.max_connection_idle_ms,
            )))
            .http2_keepalive_interval(Some(Duration::from_millis(
                grpc_options.keep_alive_time_ms,
            )))
            .http2_keepalive_timeout(Some(Duration::from_secs(20)))
            .max_connection_age(Duration::from_millis(grpc_options.max_connection_age_ms));
        if let Some(timeout_ms) = options.connection_pool.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(tls) = tls {
            builder = builder
                .tls_config(tls)
                .map_err(|e| ServeError::ConfigInvalid(format!("gRPC TLS rejected: {}", e)))?;
        }

        let mut layered = builder.layer(CallAdmissionLayer {
            pool: Arc::clone(&self.pool),
            state: Arc::clone(&self.state),
        });
        let router = layered.add_routes(self.routes.clone());

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let shutdown = token.cancelled_owned();
            if let Err(e) = router.serve_with_incoming_shutdown(incoming, shutdown).await {
                error!(server = %state.id, error = %e, "gRPC serve loop ended with error");
            }
        });
        *self.serve_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        self.state.mark_listening(local_addr);
        self.state.set_status(ServerStatus::Running);
        self.state.logger.log_server_event(
            ServerEvent::Started,
            &format!("listening on {}", local_addr),
            None,
        );
        self.register_monitoring();
        Ok(())
    }

    fn register_monitoring(self: &Arc<Self>) {
        let prefix = self.state.task_prefix();
        for mut task in
            GrpcCallStrategy::monitoring_tasks(&self.pool, prefix.trim_end_matches(':'))
        {
            if !task.name.starts_with(&prefix) {
                task.name = format!("{}{}", prefix, task.name);
            }
            self.state.scheduler.register(task);
        }
        if !self.state.options().ext.health_check {
            self.state
                .scheduler
                .set_enabled(&format!("{}health", prefix), false);
        }
        if self.state.options().ext.metrics {
            let weak = Arc::downgrade(self);
            let interval =
                Duration::from_millis(self.state.options().ext.metrics_interval_ms.max(100));
            let task = MonitoringTask::new(
                &format!("{}metrics", prefix),
                interval,
                6,
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(server) = weak.upgrade() {
                            let sample = server.sample_metrics();
                            server.state.history.push(sample);
                        }
                        Ok(())
                    }
                },
            )
            .with_description("metrics sampling");
            self.state.scheduler.register(task);
        }
    }

    /// Five-step graceful shutdown; step 4's native force aborts the serve
    /// loop (the `forceShutdown` equivalent).
    pub async fn stop(self: &Arc<Self>, timeout: Duration) -> Result<(), ServeError> {
        self.stop_with_drain(timeout, DEFAULT_DRAIN_DELAY.min(timeout / 2))
            .await
    }

    pub async fn stop_with_drain(
        self: &Arc<Self>,
        timeout: Duration,
        drain_delay: Duration,
    ) -> Result<(), ServeError> {
        let server = Arc::clone(self);
        graceful_shutdown(&self.state, &self.pool, timeout, drain_delay, move || {
            server.force_shutdown_native();
        })
        .await
    }

    pub fn force_shutdown_native(&self) {
        if let Some(task) = self
            .serve_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub async fn update_config(
        self: &Arc<Self>,
        new_options: ListeningOptions,
    ) -> Result<bool, ServeError> {
        if new_options.validate().is_err() {
            return Ok(false);
        }
        let old_options = self.state.options();
        match classify_config_change(&old_options, &new_options) {
            ConfigChange::None => Ok(true),
            ConfigChange::RuntimeApply => {
                let patch = PoolConfigPatch {
                    max_connections: Some(new_options.connection_pool.max_connections),
                    connection_timeout_ms: Some(new_options.connection_pool.connection_timeout_ms),
                    keep_alive_timeout_ms: new_options.connection_pool.keep_alive_timeout_ms,
                    request_timeout_ms: new_options.connection_pool.request_timeout_ms,
                    headers_timeout_ms: new_options.connection_pool.headers_timeout_ms,
                    protocol_specific: new_options.connection_pool.protocol_specific.clone(),
                };
                if !self.pool.update_config(&patch) {
                    return Ok(false);
                }
                self.state.set_options(new_options);
                self.state
                    .scheduler
                    .unregister_prefix(&self.state.task_prefix());
                self.register_monitoring();
                info!(server = %self.state.id, "Configuration applied at runtime");
                Ok(true)
            }
            ConfigChange::Restart(reason) => {
                info!(
                    server = %self.state.id,
                    reason = reason.as_str(),
                    "Configuration requires restart"
                );
                self.stop_with_drain(Duration::from_secs(5), Duration::ZERO)
                    .await?;
                self.state.reset_for_restart();
                self.pool.reset_draining();
                self.state.set_options(new_options);
                self.start().await?;
                Ok(true)
            }
        }
    }

    pub fn get_health(&self) -> HealthCheckResult {
        let mut checks = base_health_checks(&self.state, &self.pool.get_health());
        checks.push(HealthCheck {
            name: "accepting_calls".into(),
            status: if self.pool.is_draining() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            message: if self.pool.is_draining() {
                "draining, rejecting new calls".into()
            } else {
                "accepting".into()
            },
        });
        HealthCheckResult::compose(checks)
    }

    pub fn sample_metrics(&self) -> PerformanceMetrics {
        sample_performance(&self.state, &self.pool.get_metrics())
    }
}

fn split_grpc_path(path: &str) -> (String, String) {
    let mut parts = path.trim_start_matches('/').splitn(2, '/');
    let service = parts.next().unwrap_or_default().to_string();
    let method = parts.next().unwrap_or_default().to_string();
    (service, method)
}

fn peer_addr<B>(req: &http::Request<B>) -> Option<SocketAddr> {
    if let Some(info) = req.extensions().get::<TcpConnectInfo>() {
        return info.remote_addr();
    }
    req.extensions()
        .get::<TlsConnectInfo<TcpConnectInfo>>()
        .and_then(|info| info.get_ref().remote_addr())
}

/// Trailers-only UNAVAILABLE answer for rejected calls.
fn unavailable_response() -> http::Response<TonicBody> {
    let mut response = http::Response::new(TonicBody::empty());
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    headers.insert("grpc-status", HeaderValue::from_static("14"));
    headers.insert(
        "grpc-message",
        HeaderValue::from_static("connection pool at capacity"),
    );
    response
}

/// Releases the pooled call exactly once: either when the response body
/// reaches end-of-stream or, failing that, when the guard drops.
struct CallGuard {
    pool: Arc<GrpcCallPool>,
    state: Arc<ServerState>,
    handle: GrpcCallHandle,
    id: String,
    started: Instant,
    success: bool,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.handle.mark_completed();
        self.pool.remove_connection(&self.id, "call_completed");
        crate::server::record_request(&self.state, self.success, self.started);
    }
}

struct ReleaseOnEnd<B> {
    inner: B,
    guard: Option<CallGuard>,
}

impl<B> http_body::Body for ReleaseOnEnd<B>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    Self: Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, B::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(poll, Poll::Ready(None)) {
            this.guard.take();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

/// Tower layer performing per-call pool admission.
#[derive(Clone)]
pub struct CallAdmissionLayer {
    pool: Arc<GrpcCallPool>,
    state: Arc<ServerState>,
}

impl CallAdmissionLayer {
    pub fn new(pool: Arc<GrpcCallPool>, state: Arc<ServerState>) -> Self {
        Self { pool, state }
    }
}

impl<S> Layer<S> for CallAdmissionLayer {
    type Service = CallAdmission<S>;

    fn layer(&self, inner: S) -> CallAdmission<S> {
        CallAdmission {
            inner,
            pool: Arc::clone(&self.pool),
            state: Arc::clone(&self.state),
        }
    }
}

#[derive(Clone)]
pub struct CallAdmission<S> {
    inner: S,
    pool: Arc<GrpcCallPool>,
    state: Arc<ServerState>,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for CallAdmission<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<TonicBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = http::Response<TonicBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let (service, method) = split_grpc_path(req.uri().path());
        let peer = peer_addr(&req);
        let peer_label = peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let handle = GrpcCallHandle::new(&service, &method, &peer_label);
        let Some(id) = self.pool.register_connection(handle.clone(), peer) else {
            let response = unavailable_response();
            return Box::pin(async move { Ok(response) });
        };

        let guard = CallGuard {
            pool: Arc::clone(&self.pool),
            state: Arc::clone(&self.state),
            handle,
            id,
            started: Instant::now(),
            success: true,
        };
        let future = self.inner.call(req);
        Box::pin(async move {
            match future.await {
                Ok(response) => {
                    let mut guard = guard;
                    let grpc_status = response
                        .headers()
                        .get("grpc-status")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("0");
                    guard.success = response.status().is_success() && grpc_status == "0";
                    let (parts, body) = response.into_parts();
                    let wrapped = TonicBody::new(ReleaseOnEnd {
                        inner: body,
                        guard: Some(guard),
                    });
                    Ok(http::Response::from_parts(parts, wrapped))
                }
                Err(e) => {
                    drop(guard);
                    Err(e)
                }
            }
        })
    }
}
