//! Sidecar admin HTTP endpoint: `/health`, `/metrics`, `/servers`.
//!
//! Serves JSON by default; `/metrics?format=prometheus` switches to the text
//! exposition format. Every response carries no-store cache headers.

use crate::metrics::PrometheusExporter;
use crate::pool::HealthStatus;
use crate::supervisor::MultiProtocolServer;
use crate::ServeError;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

/// One rendered admin response.
struct AdminResponse {
    status: StatusCode,
    content_type: &'static str,
    body: String,
}

impl AdminResponse {
    fn json(status: StatusCode, value: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    fn not_found(message: &str) -> Self {
        Self::json(StatusCode::NOT_FOUND, json!({ "error": message }))
    }
}

/// Admin surface over the supervisor's children.
pub struct AdminServer {
    supervisor: Arc<MultiProtocolServer>,
    exporter: PrometheusExporter,
}

impl AdminServer {
    pub fn new(supervisor: Arc<MultiProtocolServer>) -> Result<Self, ServeError> {
        let exporter = PrometheusExporter::new()
            .map_err(|e| ServeError::ConfigInvalid(format!("metrics registry: {}", e)))?;
        Ok(Self {
            supervisor,
            exporter,
        })
    }

    fn epoch_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    /// HTTP status for one server's health: degraded stays 200, overload and
    /// worse answer 503.
    fn server_status_code(status: HealthStatus) -> StatusCode {
        match status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Overloaded | HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn handle_health(&self, params: &HashMap<String, String>) -> AdminResponse {
        let detailed = params.get("detailed").map(String::as_str) == Some("true");

        if let Some(server_id) = params.get("server") {
            let Some(server) = self.supervisor.get_server_by_id(server_id) else {
                return AdminResponse::not_found("unknown server");
            };
            let health = server.get_health();
            let mut servers = serde_json::Map::new();
            servers.insert(
                server.id(),
                if detailed {
                    serde_json::to_value(&health).unwrap_or(Value::Null)
                } else {
                    Value::String(health.status.as_str().to_string())
                },
            );
            let body = json!({
                "status": health.status,
                "timestamp": Self::epoch_ms() as u64,
                "servers": servers,
            });
            return AdminResponse::json(Self::server_status_code(health.status), body);
        }

        let mut servers = serde_json::Map::new();
        let mut worst = HealthStatus::Healthy;
        for server in self.supervisor.servers() {
            let health = server.get_health();
            worst = worst.worst(health.status);
            servers.insert(
                server.id(),
                if detailed {
                    serde_json::to_value(&health).unwrap_or(Value::Null)
                } else {
                    Value::String(health.status.as_str().to_string())
                },
            );
        }
        // The aggregate view tolerates degraded and overloaded children.
        let code = if worst == HealthStatus::Unhealthy {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };
        AdminResponse::json(
            code,
            json!({
                "status": worst,
                "timestamp": Self::epoch_ms() as u64,
                "servers": servers,
            }),
        )
    }

    fn handle_metrics(&self, params: &HashMap<String, String>) -> AdminResponse {
        let wanted: Option<&str> = params.get("server").map(String::as_str);
        let with_history = params.get("history").map(String::as_str) == Some("true");

        let mut selected = Vec::new();
        for server in self.supervisor.servers() {
            if wanted.is_none_or(|id| server.id() == id) {
                selected.push(server);
            }
        }
        if wanted.is_some() && selected.is_empty() {
            return AdminResponse::not_found("unknown server");
        }

        if params.get("format").map(String::as_str) == Some("prometheus") {
            for server in &selected {
                self.exporter.record(&server.sample_metrics());
            }
            return match self.exporter.encode() {
                Ok(body) => AdminResponse {
                    status: StatusCode::OK,
                    content_type: "text/plain; version=0.0.4; charset=utf-8",
                    body,
                },
                Err(e) => AdminResponse::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": e.to_string() }),
                ),
            };
        }

        let mut servers = serde_json::Map::new();
        for server in &selected {
            let mut entry = serde_json::Map::new();
            entry.insert(
                "current".into(),
                serde_json::to_value(server.sample_metrics()).unwrap_or(Value::Null),
            );
            if with_history {
                entry.insert(
                    "history".into(),
                    serde_json::to_value(server.metrics_history()).unwrap_or(Value::Null),
                );
            }
            servers.insert(server.id(), Value::Object(entry));
        }
        AdminResponse::json(
            StatusCode::OK,
            json!({
                "timestamp": Self::epoch_ms() as u64,
                "servers": servers,
            }),
        )
    }

    fn handle_servers(&self) -> AdminResponse {
        let servers: Vec<Value> = self
            .supervisor
            .servers()
            .iter()
            .map(|server| {
                json!({
                    "id": server.id(),
                    "protocol": server.protocol().as_str(),
                    "status": server.status(),
                    "healthStatus": server.get_health().status,
                    "activeConnections": server.active_connections(),
                    "uptime": server.uptime_ms(),
                })
            })
            .collect();
        AdminResponse::json(
            StatusCode::OK,
            json!({
                "count": servers.len(),
                "servers": servers,
            }),
        )
    }

    /// Renders one admin request; exposed for request-level tests.
    pub fn render(&self, path: &str, query: Option<&str>) -> (u16, String) {
        let response = self.route(path, query);
        (response.status.as_u16(), response.body)
    }

    fn route(&self, path: &str, query: Option<&str>) -> AdminResponse {
        let params = parse_query(query);
        match path {
            "/health" => self.handle_health(&params),
            "/metrics" => self.handle_metrics(&params),
            "/servers" => self.handle_servers(),
            "/" => AdminResponse::json(
                StatusCode::OK,
                json!({ "endpoints": ["/health", "/metrics", "/servers"] }),
            ),
            _ => AdminResponse::not_found("not_found"),
        }
    }

    /// Serves admin requests until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Admin endpoint listening");
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Admin endpoint shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { continue };
                    let admin = Arc::clone(&self);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                            let admin = Arc::clone(&admin);
                            async move {
                                let rendered =
                                    admin.route(req.uri().path(), req.uri().query());
                                let response = Response::builder()
                                    .status(rendered.status)
                                    .header("content-type", rendered.content_type)
                                    .header("cache-control", CACHE_CONTROL)
                                    .body(Full::new(Bytes::from(rendered.body)))
                                    .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
                                Ok::<_, Infallible>(response)
                            }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            warn!(error = %e, "Admin connection error");
                        }
                    });
                }
            }
        }
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = query {
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            if let Some(key) = parts.next() {
                if !key.is_empty() {
                    params.insert(key.to_string(), parts.next().unwrap_or("").to_string());
                }
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HarnessConfig, Protocol};
    use crate::logging::StructuredLogger;
    use crate::scheduler::MonitoringScheduler;
    use crate::supervisor::Application;

    fn admin_with(protocols: &[Protocol]) -> (AdminServer, Vec<String>) {
        let config = HarnessConfig {
            protocols: protocols.to_vec(),
            hostname: "127.0.0.1".into(),
            port: 0,
            trace: false,
            ext: Default::default(),
            ssl: None,
            connection_pool: Default::default(),
            admin: Default::default(),
        };
        let supervisor = Arc::new(
            MultiProtocolServer::new(
                &config,
                Application::default(),
                Arc::new(MonitoringScheduler::with_default_tick()),
                &StructuredLogger::new(),
            )
            .unwrap(),
        );
        let ids = supervisor.servers().iter().map(|s| s.id()).collect();
        (AdminServer::new(supervisor).unwrap(), ids)
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query(Some("server=abc&detailed=true"));
        assert_eq!(params.get("server").map(String::as_str), Some("abc"));
        assert_eq!(params.get("detailed").map(String::as_str), Some("true"));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_unknown_server_is_404() {
        let (admin, _) = admin_with(&[Protocol::Http]);
        let response = admin.route("/health", Some("server=missing"));
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let response = admin.route("/metrics", Some("server=missing"));
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_health_unstarted_server_is_unavailable() {
        // A created-but-not-started server is not listening, hence unhealthy.
        let (admin, ids) = admin_with(&[Protocol::Http]);
        let response = admin.route("/health", Some(&format!("server={}", ids[0])));
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["servers"][&ids[0]], "unhealthy");
    }

    #[test]
    fn test_health_detailed_shape() {
        let (admin, ids) = admin_with(&[Protocol::Http]);
        let response = admin.route("/health", Some("detailed=true"));
        let body: Value = serde_json::from_str(&response.body).unwrap();
        let checks = &body["servers"][&ids[0]]["checks"];
        assert!(checks.is_array());
        assert!(body["timestamp"].as_u64().is_some());
    }

    #[test]
    fn test_servers_listing() {
        let (admin, _) = admin_with(&[Protocol::Http, Protocol::Ws]);
        let response = admin.route("/servers", None);
        assert_eq!(response.status, StatusCode::OK);
        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["count"], 2);
        assert_eq!(body["servers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_prometheus_format() {
        let (admin, ids) = admin_with(&[Protocol::Http]);
        let response = admin.route("/metrics", Some("format=prometheus"));
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.content_type.starts_with("text/plain"));
        assert!(response.body.contains("koatty_connections_active"));
        assert!(response.body.contains(&format!("server=\"{}\"", ids[0])));
    }

    #[test]
    fn test_metrics_json_with_history() {
        let (admin, ids) = admin_with(&[Protocol::Http]);
        let response = admin.route("/metrics", Some("history=true"));
        assert_eq!(response.status, StatusCode::OK);
        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert!(body["servers"][&ids[0]]["current"].is_object());
        assert!(body["servers"][&ids[0]]["history"].is_array());
    }

    #[test]
    fn test_unknown_route() {
        let (admin, _) = admin_with(&[Protocol::Http]);
        assert_eq!(
            admin.route("/nope", None).status,
            StatusCode::NOT_FOUND
        );
    }
}
