pub mod admin;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod supervisor;
pub mod terminus;
pub mod tls;
pub mod util;

pub use koatty_serve_config as config;
pub use koatty_serve_config::Protocol;

use std::net::SocketAddr;

/// Error raised by the server harness.
///
/// Variants map to error kinds rather than source types: creation-time
/// configuration problems are `ConfigInvalid`, listener problems are
/// `BindFailed`, and so on. Handshake and handler failures are logged at
/// their site and never propagate across connections.
#[derive(Debug)]
pub enum ServeError {
    /// Invalid configuration refused at creation time.
    ConfigInvalid(String),
    /// The listening socket could not be bound.
    BindFailed { addr: String, source: std::io::Error },
    /// A TLS handshake with a client failed.
    TlsHandshakeFailed {
        remote: Option<SocketAddr>,
        message: String,
    },
    /// Admission was denied because the pool is at capacity.
    PoolOverloaded { active: usize, max: usize },
    /// A bounded operation exceeded its deadline.
    Timeout { operation: String, timeout_ms: u64 },
    /// Graceful shutdown exceeded its grace deadline.
    ShutdownForced,
    /// An application callback or event listener failed.
    HandlerError(String),
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for ServeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServeError::ConfigInvalid(reason) => write!(f, "invalid configuration: {}", reason),
            ServeError::BindFailed { addr, source } => {
                write!(f, "failed to bind {}: {}", addr, source)
            }
            ServeError::TlsHandshakeFailed { remote, message } => match remote {
                Some(addr) => write!(f, "TLS handshake with {} failed: {}", addr, message),
                None => write!(f, "TLS handshake failed: {}", message),
            },
            ServeError::PoolOverloaded { active, max } => {
                write!(f, "connection pool overloaded ({}/{})", active, max)
            }
            ServeError::Timeout {
                operation,
                timeout_ms,
            } => write!(f, "operation '{}' timed out after {}ms", operation, timeout_ms),
            ServeError::ShutdownForced => write!(f, "shutdown grace deadline exceeded"),
            ServeError::HandlerError(message) => write!(f, "handler error: {}", message),
            ServeError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServeError::BindFailed { source, .. } => Some(source),
            ServeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServeError {
    fn from(e: std::io::Error) -> Self {
        ServeError::Io(e)
    }
}

impl From<koatty_serve_config::ConfigError> for ServeError {
    fn from(e: koatty_serve_config::ConfigError) -> Self {
        ServeError::ConfigInvalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ServeError::PoolOverloaded { active: 5, max: 5 };
        assert_eq!(e.to_string(), "connection pool overloaded (5/5)");

        let e = ServeError::Timeout {
            operation: "drain".into(),
            timeout_ms: 100,
        };
        assert_eq!(e.to_string(), "operation 'drain' timed out after 100ms");
    }

    #[test]
    fn test_error_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let e = ServeError::BindFailed {
            addr: "127.0.0.1:80".into(),
            source: io,
        };
        assert!(std::error::Error::source(&e).is_some());
    }
}
