//! Context-propagating structured logger facade.
//!
//! Emits through `tracing` with a deterministic message shape: ordered
//! bracketed tags, the message, then serialized data and trace id when
//! present. Child loggers prepend their own context and delegate to the
//! process-wide subscriber.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::Level;

fn perf_registry() -> &'static DashMap<String, Instant> {
    static REGISTRY: OnceLock<DashMap<String, Instant>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Ordered context carried by a logger instance.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub module: Option<String>,
    pub protocol: Option<String>,
    pub server_id: Option<String>,
    pub connection_id: Option<String>,
    pub action: Option<String>,
    pub trace_id: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl LogContext {
    /// Merge `overlay` on top of this context; overlay fields win.
    fn merged(&self, overlay: &LogContext) -> LogContext {
        let mut extra = self.extra.clone();
        extra.extend(overlay.extra.clone());
        LogContext {
            module: overlay.module.clone().or_else(|| self.module.clone()),
            protocol: overlay.protocol.clone().or_else(|| self.protocol.clone()),
            server_id: overlay.server_id.clone().or_else(|| self.server_id.clone()),
            connection_id: overlay
                .connection_id
                .clone()
                .or_else(|| self.connection_id.clone()),
            action: overlay.action.clone().or_else(|| self.action.clone()),
            trace_id: overlay.trace_id.clone().or_else(|| self.trace_id.clone()),
            extra,
        }
    }
}

/// Process-wide logger with copy-on-write child scoping.
#[derive(Debug, Clone, Default)]
pub struct StructuredLogger {
    context: Arc<LogContext>,
}

/// Lifecycle events emitted by servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl ServerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerEvent::Starting => "server_starting",
            ServerEvent::Started => "server_started",
            ServerEvent::Stopping => "server_stopping",
            ServerEvent::Stopped => "server_stopped",
            ServerEvent::Error => "server_error",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            ServerEvent::Error => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Per-connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Timeout,
    Error,
}

impl ConnectionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected => "connection_connected",
            ConnectionEvent::Disconnected => "connection_disconnected",
            ConnectionEvent::Timeout => "connection_timeout",
            ConnectionEvent::Error => "connection_error",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            ConnectionEvent::Connected | ConnectionEvent::Disconnected => Level::INFO,
            ConnectionEvent::Timeout => Level::WARN,
            ConnectionEvent::Error => Level::ERROR,
        }
    }
}

/// Security-relevant events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    AuthSuccess,
    AuthFailure,
    RateLimit,
    Blocked,
}

impl SecurityEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEvent::AuthSuccess => "security_auth_success",
            SecurityEvent::AuthFailure => "security_auth_failure",
            SecurityEvent::RateLimit => "security_rate_limit",
            SecurityEvent::Blocked => "security_blocked",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            SecurityEvent::AuthSuccess => Level::INFO,
            _ => Level::WARN,
        }
    }
}

/// Serializes an error as `{name, message, stack}` where stack is the
/// source chain.
pub fn error_data(error: &(dyn std::error::Error + 'static)) -> Value {
    let mut stack = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        stack.push(cause.to_string());
        source = cause.source();
    }
    serde_json::json!({
        "name": "Error",
        "message": error.to_string(),
        "stack": stack,
    })
}

impl StructuredLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(context: LogContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Child logger carrying `overlay` on top of this logger's context.
    pub fn child(&self, overlay: LogContext) -> Self {
        Self {
            context: Arc::new(self.context.merged(&overlay)),
        }
    }

    /// Child scoped to one server.
    pub fn server(&self, protocol: &str, server_id: &str) -> Self {
        self.child(LogContext {
            protocol: Some(protocol.to_string()),
            server_id: Some(server_id.to_string()),
            ..Default::default()
        })
    }

    /// Child scoped to one connection.
    pub fn connection(&self, connection_id: &str) -> Self {
        self.child(LogContext {
            connection_id: Some(connection_id.to_string()),
            ..Default::default()
        })
    }

    pub fn context(&self) -> &LogContext {
        &self.context
    }

    /// Deterministic message shape: ordered bracketed tags, message, then
    /// serialized data and trace id when present.
    pub fn format(&self, message: &str, data: Option<&Value>) -> String {
        let ctx = &self.context;
        let mut out = String::new();
        if let Some(module) = &ctx.module {
            out.push_str(&format!("[{}] ", module.to_uppercase()));
        }
        if let Some(protocol) = &ctx.protocol {
            out.push_str(&format!("[{}] ", protocol.to_uppercase()));
        }
        if let Some(server_id) = &ctx.server_id {
            out.push_str(&format!("[Server:{}] ", server_id));
        }
        if let Some(conn_id) = &ctx.connection_id {
            out.push_str(&format!("[Conn:{}] ", conn_id));
        }
        if let Some(action) = &ctx.action {
            out.push_str(&format!("[{}] ", action));
        }
        out.push_str(message);
        if let Some(data) = data {
            match data {
                Value::String(s) => out.push_str(&format!(" | Data: {}", s)),
                other => {
                    let serialized =
                        serde_json::to_string(other).unwrap_or_else(|_| other.to_string());
                    out.push_str(&format!(" | Data: {}", serialized));
                }
            }
        }
        if let Some(trace_id) = &ctx.trace_id {
            out.push_str(&format!(" | TraceId: {}", trace_id));
        }
        out
    }

    pub fn log(&self, level: Level, message: &str, data: Option<&Value>) {
        let line = self.format(message, data);
        if level == Level::ERROR {
            tracing::error!("{}", line);
        } else if level == Level::WARN {
            tracing::warn!("{}", line);
        } else if level == Level::INFO {
            tracing::info!("{}", line);
        } else if level == Level::DEBUG {
            tracing::debug!("{}", line);
        } else {
            tracing::trace!("{}", line);
        }
    }

    pub fn info(&self, message: &str, data: Option<&Value>) {
        self.log(Level::INFO, message, data);
    }

    pub fn warn(&self, message: &str, data: Option<&Value>) {
        self.log(Level::WARN, message, data);
    }

    pub fn error(&self, message: &str, data: Option<&Value>) {
        self.log(Level::ERROR, message, data);
    }

    pub fn debug(&self, message: &str, data: Option<&Value>) {
        self.log(Level::DEBUG, message, data);
    }

    pub fn log_server_event(&self, event: ServerEvent, message: &str, data: Option<&Value>) {
        let scoped = self.child(LogContext {
            action: Some(event.as_str().to_string()),
            ..Default::default()
        });
        scoped.log(event.level(), message, data);
    }

    pub fn log_connection_event(
        &self,
        event: ConnectionEvent,
        message: &str,
        data: Option<&Value>,
    ) {
        let scoped = self.child(LogContext {
            action: Some(event.as_str().to_string()),
            ..Default::default()
        });
        scoped.log(event.level(), message, data);
    }

    pub fn log_security_event(&self, event: SecurityEvent, message: &str, data: Option<&Value>) {
        let scoped = self.child(LogContext {
            action: Some(event.as_str().to_string()),
            ..Default::default()
        });
        scoped.log(event.level(), message, data);
    }

    /// Marks the start of a tracked operation.
    pub fn start_performance_tracking(&self, id: &str) {
        perf_registry().insert(id.to_string(), Instant::now());
    }

    /// Finishes a tracked operation, returning its duration. An unknown id
    /// is logged as a warning and yields no metrics.
    pub fn end_performance_tracking(&self, id: &str) -> Option<Duration> {
        match perf_registry().remove(id) {
            Some((_, started)) => Some(started.elapsed()),
            None => {
                self.warn(
                    &format!("performance tracking id '{}' was never started", id),
                    None,
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_logger() -> StructuredLogger {
        StructuredLogger::with_context(LogContext {
            module: Some("serve".into()),
            protocol: Some("https".into()),
            server_id: Some("https_1_abc".into()),
            connection_id: Some("conn_9".into()),
            action: Some("admit".into()),
            trace_id: Some("t-42".into()),
            extra: BTreeMap::new(),
        })
    }

    #[test]
    fn test_format_full_context() {
        let logger = full_logger();
        let line = logger.format("admitted", Some(&json!({"n": 1})));
        assert_eq!(
            line,
            "[SERVE] [HTTPS] [Server:https_1_abc] [Conn:conn_9] [admit] admitted | Data: {\"n\":1} | TraceId: t-42"
        );
    }

    #[test]
    fn test_format_scalar_data() {
        let logger = StructuredLogger::new();
        let line = logger.format("msg", Some(&json!("plain")));
        assert_eq!(line, "msg | Data: plain");
    }

    #[test]
    fn test_format_no_context() {
        let logger = StructuredLogger::new();
        assert_eq!(logger.format("hello", None), "hello");
    }

    #[test]
    fn test_child_merging() {
        let root = StructuredLogger::with_context(LogContext {
            module: Some("serve".into()),
            ..Default::default()
        });
        let child = root.server("ws", "ws_7_xyz").connection("c1");
        let line = child.format("m", None);
        assert_eq!(line, "[SERVE] [WS] [Server:ws_7_xyz] [Conn:c1] m");
        // the root is untouched
        assert_eq!(root.format("m", None), "[SERVE] m");
    }

    #[test]
    fn test_event_levels() {
        assert_eq!(ServerEvent::Started.level(), Level::INFO);
        assert_eq!(ServerEvent::Error.level(), Level::ERROR);
        assert_eq!(ConnectionEvent::Connected.level(), Level::INFO);
        assert_eq!(ConnectionEvent::Timeout.level(), Level::WARN);
        assert_eq!(ConnectionEvent::Error.level(), Level::ERROR);
        assert_eq!(SecurityEvent::AuthSuccess.level(), Level::INFO);
        assert_eq!(SecurityEvent::AuthFailure.level(), Level::WARN);
        assert_eq!(SecurityEvent::RateLimit.level(), Level::WARN);
        assert_eq!(SecurityEvent::Blocked.level(), Level::WARN);
    }

    #[test]
    fn test_error_data_shape() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "inner");
        let data = error_data(&io);
        assert_eq!(data["name"], "Error");
        assert_eq!(data["message"], "inner");
    }

    #[test]
    fn test_performance_tracking() {
        let logger = StructuredLogger::new();
        logger.start_performance_tracking("op-1");
        assert!(logger.end_performance_tracking("op-1").is_some());
        // second end for the same id finds nothing
        assert!(logger.end_performance_tracking("op-1").is_none());
    }
}
