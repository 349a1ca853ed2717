//! WebSocket server adapter for WS and WSS endpoints.
//!
//! The upgrade handshake is routed by request path against the application's
//! route map. Each accepted socket splits into a reader task (messages,
//! pongs, handler dispatch) and a writer task (handler replies plus pool
//! commands). Admission denial closes with 1013; handler panics close with
//! 1011.

use crate::config::ListeningOptions;
use crate::logging::SecurityEvent;
use crate::pool::websocket::{
    WsCommand, WsHandle, WsSocketStrategy, CLOSE_INTERNAL_ERROR, CLOSE_TRY_AGAIN_LATER,
};
use crate::pool::{ConnectionPool, HealthStatus, PoolEvent};
use crate::server::{record_request, HealthCheck, ProtocolAdapter, ServerState, WsRouter};
use crate::tls::build_server_config;
use crate::ServeError;
use futures::{FutureExt, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WsAdapter {
    router: Arc<WsRouter>,
    acceptor: StdRwLock<Option<TlsAcceptor>>,
    tls: bool,
}

impl WsAdapter {
    pub fn ws(router: WsRouter) -> Self {
        Self {
            router: Arc::new(router),
            acceptor: StdRwLock::new(None),
            tls: false,
        }
    }

    pub fn wss(router: WsRouter) -> Self {
        Self {
            router: Arc::new(router),
            acceptor: StdRwLock::new(None),
            tls: true,
        }
    }

    fn acceptor(&self) -> Option<TlsAcceptor> {
        self.acceptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProtocolAdapter for WsAdapter {
    type Strategy = WsSocketStrategy;

    fn prepare(&self, options: &ListeningOptions) -> Result<(), ServeError> {
        if !self.tls {
            return Ok(());
        }
        let ssl = options
            .ssl
            .as_ref()
            .ok_or_else(|| ServeError::ConfigInvalid("wss requires ssl configuration".into()))?;
        let config = build_server_config(ssl, options.protocol)?;
        *self.acceptor.write().unwrap_or_else(|e| e.into_inner()) =
            Some(TlsAcceptor::from(config));
        Ok(())
    }

    fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        state: &Arc<ServerState>,
        pool: &Arc<ConnectionPool<WsSocketStrategy>>,
    ) {
        let router = Arc::clone(&self.router);
        let state = Arc::clone(state);
        let pool = Arc::clone(pool);
        if self.tls {
            let Some(acceptor) = self.acceptor() else {
                return;
            };
            tokio::spawn(async move {
                let accepted =
                    tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await;
                match accepted {
                    Ok(Ok(tls_stream)) => {
                        serve_upgrade(tls_stream, peer, router, state, pool).await;
                    }
                    Ok(Err(e)) => {
                        state.logger.log_security_event(
                            SecurityEvent::AuthFailure,
                            &format!("TLS handshake with {} failed: {}", peer, e),
                            None,
                        );
                    }
                    Err(_) => {
                        state.logger.log_security_event(
                            SecurityEvent::AuthFailure,
                            &format!("TLS handshake with {} timed out", peer),
                            None,
                        );
                    }
                }
            });
        } else {
            tokio::spawn(async move {
                serve_upgrade(stream, peer, router, state, pool).await;
            });
        }
    }

    fn protocol_health_checks(&self, _state: &Arc<ServerState>) -> Vec<HealthCheck> {
        let mut checks = vec![HealthCheck {
            name: "routes".into(),
            status: if self.router.is_empty() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            message: format!("{} websocket routes", self.router.len()),
        }];
        if self.tls {
            let configured = self.acceptor().is_some();
            checks.push(HealthCheck {
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
            });
        }
        checks
    }
}

fn not_found_response() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("no websocket route".to_string()));
    *response.status_mut() = ::http::StatusCode::NOT_FOUND;
    response
}

/// Performs the protocol handshake and runs the reader/writer pair until the
/// peer leaves or the pool closes the socket.
async fn serve_upgrade<IO>(
    io: IO,
    peer: SocketAddr,
    router: Arc<WsRouter>,
    state: Arc<ServerState>,
    pool: Arc<ConnectionPool<WsSocketStrategy>>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut path = String::new();
    let callback = |request: &HandshakeRequest, response: HandshakeResponse| {
        path = request.uri().path().to_string();
        if router.contains_key(&path) {
            Ok(response)
        } else {
            Err(not_found_response())
        }
    };

    let mut socket = match tokio_tungstenite::accept_hdr_async(io, callback).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!(server = %state.id, %peer, error = %e, "WebSocket handshake rejected");
            return;
        }
    };

    let Some(handler) = router.get(&path).cloned() else {
        return;
    };

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = WsHandle::new(cmd_tx);
    let cancel = handle.cancel.clone();
    let closed = handle.closed.clone();
    let Some(id) = pool.register_connection(handle, Some(peer)) else {
        // Overloaded: orderly close with "try again later".
        let _ = socket
            .close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_TRY_AGAIN_LATER),
                reason: "connection pool at capacity".into(),
            }))
            .await;
        return;
    };

    let (sink, mut messages) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(write_loop(sink, cmd_rx, out_rx, cancel.clone()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = messages.next() => match incoming {
                Some(Ok(Message::Pong(_))) => {
                    pool.with_entry(&id, |entry| entry.handle.record_pong());
                    pool.touch(&id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(_) | Message::Frame(_))) => {
                    // Pongs are produced by the protocol layer on flush.
                    pool.touch(&id);
                }
                Some(Ok(message)) => {
                    pool.mark_busy(&id);
                    let started = Instant::now();
                    let outcome = AssertUnwindSafe(handler(message)).catch_unwind().await;
                    match outcome {
                        Ok(reply) => {
                            record_request(&state, true, started);
                            if let Some(reply) = reply {
                                if out_tx.send(reply).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(_) => {
                            record_request(&state, false, started);
                            pool.emit_event(&PoolEvent::ConnectionError {
                                id: Some(id.clone()),
                                message: "websocket handler panicked".into(),
                            });
                            let _ = out_tx.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(CLOSE_INTERNAL_ERROR),
                                reason: "internal error".into(),
                            })));
                            break;
                        }
                    }
                    pool.mark_idle(&id);
                }
                Some(Err(e)) => {
                    debug!(server = %state.id, connection = %id, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    }

    closed.cancel();
    let _ = writer.await;
    pool.remove_connection(&id, "connection_closed");
}

/// Writer side: pool commands (pings, closes) and handler replies share one
/// sink. A close command or cancellation ends the loop.
async fn write_loop<Sink>(
    mut sink: Sink,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    cancel: tokio_util::sync::CancellationToken,
) where
    Sink: SinkExt<Message> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush any close command queued just before cancellation.
                while let Ok(command) = commands.try_recv() {
                    if let WsCommand::Close { code, reason } = command {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
                break;
            }
            command = commands.recv() => match command {
                Some(WsCommand::Ping) => {
                    if sink.send(Message::Ping(bytes::Bytes::new())).await.is_err() {
                        break;
                    }
                }
                Some(WsCommand::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            message = outgoing.recv() => match message {
                Some(message) => {
                    let is_close = matches!(message, Message::Close(_));
                    if sink.send(message).await.is_err() || is_close {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::WsMessageHandler;

    fn echo_handler() -> WsMessageHandler {
        Arc::new(|message| {
            Box::pin(async move {
                match message {
                    Message::Text(text) => Some(Message::Text(text)),
                    Message::Binary(data) => Some(Message::Binary(data)),
                    _ => None,
                }
            })
        })
    }

    #[test]
    fn test_ws_adapter_prepare_plain() {
        let mut router = WsRouter::new();
        router.insert("/chat".to_string(), echo_handler());
        let adapter = WsAdapter::ws(router);
        let options = ListeningOptions {
            protocol: crate::config::Protocol::Ws,
            ..Default::default()
        };
        assert!(adapter.prepare(&options).is_ok());
    }

    #[test]
    fn test_wss_requires_ssl() {
        let adapter = WsAdapter::wss(WsRouter::new());
        let options = ListeningOptions {
            protocol: crate::config::Protocol::Wss,
            ..Default::default()
        };
        assert!(adapter.prepare(&options).is_err());
    }

    #[test]
    fn test_route_health() {
        let adapter = WsAdapter::ws(WsRouter::new());
        let state_checks = adapter.router.is_empty();
        assert!(state_checks);
    }
}
