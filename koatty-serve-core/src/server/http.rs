//! Plain HTTP/1.1 server adapter.
//!
//! Accepted sockets are sniffed for a valid request-line method token before
//! they reach the HTTP machinery; malformed openings get a raw 400 and the
//! socket is dropped.

use crate::config::ListeningOptions;
use crate::pool::socket::{SocketHandle, SocketStrategy};
use crate::pool::ConnectionPool;
use crate::server::{record_request, HttpHandler, ProtocolAdapter, ServerState};
use crate::ServeError;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const HTTP_METHODS: [&[u8]; 8] = [
    b"GET ",
    b"POST ",
    b"HEAD ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"TRACE ",
];

const BAD_REQUEST_RAW: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const OVERLOADED_RAW: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nconnection: close\r\ncontent-length: 0\r\n\r\n";

/// True when the first peeked bytes could open a valid HTTP/1.1 request.
fn looks_like_http(prefix: &[u8]) -> bool {
    if prefix.is_empty() {
        return false;
    }
    HTTP_METHODS.iter().any(|method| {
        let len = prefix.len().min(method.len());
        method[..len] == prefix[..len]
    })
}

pub struct HttpAdapter {
    handler: HttpHandler,
}

impl HttpAdapter {
    pub fn new(handler: HttpHandler) -> Self {
        Self { handler }
    }
}

impl ProtocolAdapter for HttpAdapter {
    type Strategy = SocketStrategy;

    fn prepare(&self, _options: &ListeningOptions) -> Result<(), ServeError> {
        Ok(())
    }

    fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        state: &Arc<ServerState>,
        pool: &Arc<ConnectionPool<SocketStrategy>>,
    ) {
        let adapter = Arc::clone(self);
        let state = Arc::clone(state);
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            let mut stream = stream;
            let mut prefix = [0u8; 8];
            match stream.peek(&mut prefix).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if !looks_like_http(&prefix[..n]) {
                        debug!(server = %state.id, %peer, "Malformed request line, dropping");
                        let _ = stream.write_all(BAD_REQUEST_RAW).await;
                        return;
                    }
                }
            }

            let handle = SocketHandle::plain();
            let cancel = handle.cancel.clone();
            let closed = handle.closed.clone();
            let Some(id) = pool.register_connection(handle, Some(peer)) else {
                let _ = stream.write_all(OVERLOADED_RAW).await;
                return;
            };

            serve_http1(
                stream,
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
}

/// Serves one HTTP/1.1 connection, shared by the plain and TLS adapters.
/// Resolves when the peer closes, the handler fails, or the pool cancels.
pub(crate) async fn serve_http1<IO, S>(
    io: IO,
    handler: HttpHandler,
    state: &Arc<ServerState>,
    pool: &Arc<ConnectionPool<S>>,
    connection_id: &str,
    cancel: tokio_util::sync::CancellationToken,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: crate::pool::PoolStrategy,
{
    let config = pool.config();
    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new());
    builder.keep_alive(true);
    if let Some(headers_timeout) = config.headers_timeout_ms {
        builder.header_read_timeout(Duration::from_millis(headers_timeout));
    }

    let service_state = Arc::clone(state);
    let service_pool = Arc::clone(pool);
    let service_id = connection_id.to_string();
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        let state = Arc::clone(&service_state);
        let pool = Arc::clone(&service_pool);
        let id = service_id.clone();
        async move {
            let started = Instant::now();
            pool.mark_busy(&id);
            let (parts, body) = req.into_parts();
            let body = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            let response = handler(Request::from_parts(parts, body)).await;
            let success = response.status().as_u16() < 500;
            record_request(&state, success, started);
            pool.mark_idle(&id);
            let (parts, body) = response.into_parts();
            Ok::<_, Infallible>(Response::from_parts(parts, Full::new(body)))
        }
    });

    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(server = %state.id, connection = %connection_id, error = %e, "Connection ended with error");
            }
        }
        _ = cancel.cancelled() => {
            // Half-close: let in-flight responses finish briefly, then drop.
            conn.as_mut().graceful_shutdown();
            if tokio::time::timeout(Duration::from_secs(1), conn.as_mut())
                .await
                .is_err()
            {
                warn!(server = %state.id, connection = %connection_id, "Forced connection close");
            }
        }
    }
}
