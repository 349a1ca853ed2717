//! HTTP/2 server adapter over TLS with ALPN.
//!
//! Each accepted socket becomes an `h2` session owned by its own task.
//! Sessions feed the session pool; keepalive pings arrive through the pool's
//! command channel and are answered by a dedicated ping responder so the
//! accept loop keeps driving connection I/O.

use crate::config::ListeningOptions;
use crate::logging::SecurityEvent;
use crate::pool::http2::{H2Command, H2SessionHandle, H2SessionStrategy};
use crate::pool::{ConnectionPool, HealthStatus, PoolEvent};
use crate::server::{record_request, HealthCheck, HttpHandler, ProtocolAdapter, ServerState};
use crate::tls::build_server_config;
use crate::ServeError;
use bytes::{Bytes, BytesMut};
use h2::server::SendResponse;
use h2::{Ping, PingPong, Reason, RecvStream};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Http2Adapter {
    handler: HttpHandler,
    acceptor: StdRwLock<Option<TlsAcceptor>>,
}

impl Http2Adapter {
    pub fn new(handler: HttpHandler) -> Self {
        Self {
            handler,
            acceptor: StdRwLock::new(None),
        }
    }

    fn acceptor(&self) -> Option<TlsAcceptor> {
        self.acceptor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProtocolAdapter for Http2Adapter {
    type Strategy = H2SessionStrategy;

    fn prepare(&self, options: &ListeningOptions) -> Result<(), ServeError> {
        let ssl = options
            .ssl
            .as_ref()
            .ok_or_else(|| ServeError::ConfigInvalid("http2 requires ssl configuration".into()))?;
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
        pool: &Arc<ConnectionPool<H2SessionStrategy>>,
    ) {
        let Some(acceptor) = self.acceptor() else {
            return;
        };
        let handler = self.handler.clone();
        let state = Arc::clone(state);
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            let accepted =
                tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await;
            let tls_stream = match accepted {
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

            let negotiated_h2 = {
                let (_, session) = tls_stream.get_ref();
                session.alpn_protocol() == Some(b"h2".as_slice())
            };
            if !negotiated_h2 {
                let allow_http1 = state
                    .options()
                    .ssl
                    .as_ref()
                    .map(|ssl| ssl.allow_http1)
                    .unwrap_or(true);
                if allow_http1 {
                    serve_http1_fallback(tls_stream, handler, &state).await;
                } else {
                    debug!(server = %state.id, %peer, "Peer did not negotiate h2, dropping");
                }
                return;
            }

            let h2_options = pool.config().http2();
            let window = (h2_options.max_session_memory_mb as u64 * 1024 * 1024)
                .clamp(65_535, u32::MAX as u64) as u32;
            let mut builder = h2::server::Builder::new();
            builder
                .max_header_list_size(h2_options.max_header_list_size)
                .initial_connection_window_size(window);

            let mut session = match builder.handshake::<_, Bytes>(tls_stream).await {
                Ok(session) => session,
                Err(e) => {
                    debug!(server = %state.id, %peer, error = %e, "HTTP/2 handshake failed");
                    return;
                }
            };

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let handle = H2SessionHandle::new(cmd_tx, window);
            let Some(id) = pool.register_connection(handle.clone(), Some(peer)) else {
                session.abrupt_shutdown(Reason::REFUSED_STREAM);
                return;
            };

            let goaway_requested = CancellationToken::new();
            if let Some(ping_pong) = session.ping_pong() {
                tokio::spawn(ping_responder(
                    ping_pong,
                    cmd_rx,
                    handle.clone(),
                    goaway_requested.clone(),
                ));
            }

            let cancel = handle.cancel.clone();
            let mut goaway_sent = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        session.abrupt_shutdown(Reason::NO_ERROR);
                        break;
                    }
                    _ = goaway_requested.cancelled(), if !goaway_sent => {
                        session.graceful_shutdown();
                        goaway_sent = true;
                    }
                    accepted = session.accept() => match accepted {
                        Some(Ok((request, respond))) => {
                            if handle.goaway_received() {
                                // Draining: refuse the stream, let the rest finish.
                                let mut respond = respond;
                                let _ = respond.send_reset(Reason::REFUSED_STREAM);
                                continue;
                            }
                            handle.stream_opened();
                            pool.touch(&id);
                            pool.mark_busy(&id);
                            let handler = handler.clone();
                            let state = Arc::clone(&state);
                            let pool = Arc::clone(&pool);
                            let handle = handle.clone();
                            let id = id.clone();
                            tokio::spawn(async move {
                                serve_stream(request, respond, handler, &state).await;
                                if handle.stream_closed() == 0 {
                                    pool.mark_idle(&id);
                                }
                            });
                        }
                        Some(Err(e)) => {
                            if e.is_go_away() {
                                handle.mark_goaway();
                            } else {
                                pool.emit_event(&PoolEvent::ConnectionError {
                                    id: Some(id.clone()),
                                    message: e.to_string(),
                                });
                            }
                            break;
                        }
                        None => break,
                    }
                }
            }

            handle.mark_closed();
            pool.remove_connection(&id, "session_closed");
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

/// HTTP/1.1 over the same socket for peers that did not negotiate h2.
/// These connections carry requests but are not HTTP/2 sessions, so they
/// stay outside the session pool.
async fn serve_http1_fallback<IO>(io: IO, handler: HttpHandler, state: &Arc<ServerState>)
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use http_body_util::{BodyExt, Full};
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;

    let service_state = Arc::clone(state);
    let service = service_fn(move |req: ::http::Request<hyper::body::Incoming>| {
        let handler = handler.clone();
        let state = Arc::clone(&service_state);
        async move {
            let started = Instant::now();
            let (parts, body) = req.into_parts();
            let body = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            let response = handler(::http::Request::from_parts(parts, body)).await;
            let success = response.status().as_u16() < 500;
            record_request(&state, success, started);
            let (parts, payload) = response.into_parts();
            Ok::<_, std::convert::Infallible>(::http::Response::from_parts(
                parts,
                Full::new(payload),
            ))
        }
    });
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!(server = %state.id, error = %e, "HTTP/1.1 fallback connection ended with error");
    }
}

/// Answers pool commands for one session. `Ping` rides the session's
/// PING/ACK machinery; `GoAway` flips the latch the accept loop watches.
async fn ping_responder(
    mut ping_pong: PingPong,
    mut commands: mpsc::UnboundedReceiver<H2Command>,
    handle: H2SessionHandle,
    goaway: CancellationToken,
) {
    while let Some(command) = commands.recv().await {
        match command {
            H2Command::Ping => match ping_pong.ping(Ping::opaque()).await {
                Ok(_) => handle.record_ping_ack(),
                Err(e) => {
                    debug!(error = %e, "Session ping failed");
                    break;
                }
            },
            H2Command::GoAway => goaway.cancel(),
        }
    }
}

async fn serve_stream(
    request: ::http::Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    handler: HttpHandler,
    state: &Arc<ServerState>,
) {
    let started = Instant::now();
    let (parts, mut body) = request.into_parts();

    let mut collected = BytesMut::new();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(chunk) => {
                let _ = body.flow_control().release_capacity(chunk.len());
                collected.extend_from_slice(&chunk);
            }
            Err(e) => {
                debug!(error = %e, "Stream body error");
                let _ = respond.send_reset(Reason::INTERNAL_ERROR);
                record_request(state, false, started);
                return;
            }
        }
    }

    let response = handler(::http::Request::from_parts(parts, collected.freeze())).await;
    let success = response.status().as_u16() < 500;
    let (parts, payload) = response.into_parts();
    let head = ::http::Response::from_parts(parts, ());

    match respond.send_response(head, payload.is_empty()) {
        Ok(mut stream) => {
            if !payload.is_empty() {
                if let Err(e) = stream.send_data(payload, true) {
                    warn!(error = %e, "Failed to send response body");
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to send response headers");
        }
    }
    record_request(state, success, started);
}
