//! HTTPS server adapter: managed TLS modes over the HTTP/1.1 machinery.
//!
//! TLS client errors are logged with the remote address and never affect
//! other connections; sockets that complete the handshake are admitted to
//! the pool with their negotiated parameters.

use crate::config::ListeningOptions;
use crate::logging::SecurityEvent;
use crate::pool::socket::{SocketHandle, SocketStrategy, TlsConnectionInfo};
use crate::pool::{ConnectionPool, HealthStatus};
use crate::server::http::serve_http1;
use crate::server::{HealthCheck, HttpHandler, ProtocolAdapter, ServerState};
use crate::tls::build_server_config;
use crate::ServeError;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

const OVERLOADED_RAW: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nconnection: close\r\ncontent-length: 0\r\n\r\n";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpsAdapter {
    handler: HttpHandler,
    acceptor: StdRwLock<Option<TlsAcceptor>>,
    client_auth: StdRwLock<bool>,
}

impl HttpsAdapter {
    pub fn new(handler: HttpHandler) -> Self {
        Self {
            handler,
            acceptor: StdRwLock::new(None),
            client_auth: StdRwLock::new(false),
        }
    }

    fn acceptor(&self) -> Option<TlsAcceptor> {
        self.acceptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProtocolAdapter for HttpsAdapter {
    type Strategy = SocketStrategy;

    fn prepare(&self, options: &ListeningOptions) -> Result<(), ServeError> {
        let ssl = options
            .ssl
            .as_ref()
            .ok_or_else(|| ServeError::ConfigInvalid("https requires ssl configuration".into()))?;
        let config = build_server_config(ssl, options.protocol)?;
        *self.acceptor.write().unwrap_or_else(|e| e.into_inner()) =
            Some(TlsAcceptor::from(config));
        *self.client_auth.write().unwrap_or_else(|e| e.into_inner()) = matches!(
            ssl.effective_mode(),
            crate::config::SslMode::MutualTls
        ) || ssl.request_cert == Some(true);
        Ok(())
    }

    fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        state: &Arc<ServerState>,
        pool: &Arc<ConnectionPool<SocketStrategy>>,
    ) {
        let Some(acceptor) = self.acceptor() else {
            return;
        };
        let client_auth = *self.client_auth.read().unwrap_or_else(|e| e.into_inner());
        let adapter = Arc::clone(self);
        let state = Arc::clone(state);
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            let accepted =
                tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await;
            let mut tls_stream = match accepted {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(e)) => {
                    state.logger.log_security_event(
                        SecurityEvent::AuthFailure,
                        &format!("TLS handshake with {} failed: {}", peer, e),
                        None,
                    );
                    return;
                }
                Err(_) => {
                    state.logger.log_security_event(
                        SecurityEvent::AuthFailure,
                        &format!("TLS handshake with {} timed out", peer),
                        None,
                    );
                    return;
                }
            };

            let info = {
                let (_, session) = tls_stream.get_ref();
                TlsConnectionInfo {
                    version: session
                        .protocol_version()
                        .map(|v| format!("{:?}", v))
                        .unwrap_or_default(),
                    cipher: session
                        .negotiated_cipher_suite()
                        .map(|s| format!("{:?}", s.suite()))
                        .unwrap_or_default(),
                    authorized: !client_auth || session.peer_certificates().is_some(),
                    servername: session.server_name().map(str::to_string),
                }
            };

            let handle = SocketHandle::with_tls(info);
            let cancel = handle.cancel.clone();
            let closed = handle.closed.clone();
            let Some(id) = pool.register_connection(handle, Some(peer)) else {
                let _ = tls_stream.write_all(OVERLOADED_RAW).await;
                let _ = tls_stream.shutdown().await;
                return;
            };

            serve_http1(
                tls_stream,
                adapter.handler.clone(),
                &state,
                &pool,
                &id,
                cancel,
            )
            .await;
            closed.cancel();
            pool.remove_connection(&id, "connection_closed");
        });
    }

    fn protocol_health_checks(&self, _state: &Arc<ServerState>) -> Vec<HealthCheck> {
        let configured = self.acceptor().is_some();
        vec![HealthCheck {
            name: "tls_acceptor".into(),
            status: if configured {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            message: if configured {
                "assembled".into()
            } else {
                "missing".into()
            },
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, SslConfig};

    fn ssl_literal() -> SslConfig {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        SslConfig {
            enabled: true,
            cert: Some(certified.cert.pem()),
            key: Some(certified.signing_key.serialize_pem()),
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_requires_ssl() {
        let adapter = HttpsAdapter::new(crate::server::default_http_handler());
        let options = ListeningOptions {
            protocol: Protocol::Https,
            ..Default::default()
        };
        assert!(adapter.prepare(&options).is_err());
    }

    #[test]
    fn test_prepare_assembles_acceptor() {
        let adapter = HttpsAdapter::new(crate::server::default_http_handler());
        let options = ListeningOptions {
            protocol: Protocol::Https,
            ssl: Some(ssl_literal()),
            ..Default::default()
        };
        adapter.prepare(&options).unwrap();
        assert!(adapter.acceptor().is_some());
    }

    #[test]
    fn test_missing_cert_file_fails_at_start() {
        let adapter = HttpsAdapter::new(crate::server::default_http_handler());
        let options = ListeningOptions {
            protocol: Protocol::Https,
            ssl: Some(SslConfig {
                enabled: true,
                cert: Some("/nonexistent/server.crt".into()),
                key: Some("/nonexistent/server.key".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = adapter.prepare(&options).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/server"));
    }
}
