//! Admin endpoint scenarios over the supervisor.

use koatty_serve_core::admin::AdminServer;
use koatty_serve_core::config::{ConnectionPoolConfig, HarnessConfig, Protocol};
use koatty_serve_core::logging::StructuredLogger;
use koatty_serve_core::pool::socket::SocketHandle;
use koatty_serve_core::scheduler::MonitoringScheduler;
use koatty_serve_core::supervisor::{Application, MultiProtocolServer, ProtocolServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Finds a base port where both `base` and `base + 1` are currently free,
/// so the two fan-out servers can bind.
async fn free_port_pair() -> u16 {
    loop {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = probe.local_addr().unwrap().port();
        if base == u16::MAX {
            continue;
        }
        if let Ok(second) = TcpListener::bind(("127.0.0.1", base + 1)).await {
            drop(second);
            drop(probe);
            return base;
        }
    }
}

fn two_http_servers_at(base_port: u16) -> Arc<MultiProtocolServer> {
    let config = HarnessConfig {
        protocols: vec![Protocol::Http, Protocol::Ws],
        hostname: "127.0.0.1".into(),
        port: base_port,
        trace: false,
        ext: Default::default(),
        ssl: None,
        connection_pool: ConnectionPoolConfig {
            max_connections: 1,
            ..Default::default()
        },
        admin: Default::default(),
    };
    Arc::new(
        MultiProtocolServer::new(
            &config,
            Application::default(),
            Arc::new(MonitoringScheduler::with_default_tick()),
            &StructuredLogger::new(),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_health_tolerates_overloaded_sibling() {
    let supervisor = two_http_servers_at(free_port_pair().await);
    supervisor.start().await;

    // saturate the http pool so utilization reaches 1.0
    let ProtocolServer::Http(http) = &supervisor.servers()[0] else {
        panic!("expected http server first");
    };
    http.pool
        .register_connection(SocketHandle::plain(), None)
        .unwrap();

    let admin = AdminServer::new(Arc::clone(&supervisor)).unwrap();

    // aggregate view stays 200: degraded/overloaded children are tolerated
    let (status, body) = route_json(&admin, "/health", None);
    assert_eq!(status, 200);
    assert_eq!(body["servers"][&http.state.id], "overloaded");

    // the overloaded server queried directly answers 503
    let (status, _) = route_json(&admin, "/health", Some(&format!("server={}", http.state.id)));
    assert_eq!(status, 503);

    // prometheus exposition carries the labeled gauge line
    let (status, text) = route_text(&admin, "/metrics", Some("format=prometheus"));
    assert_eq!(status, 200);
    let expected = format!(
        "koatty_connections_active{{protocol=\"http\",server=\"{}\"}} 1",
        http.state.id
    );
    assert!(text.contains(&expected), "missing line in: {}", text);

    supervisor.stop(Duration::from_millis(300)).await;
}

fn route_json(
    admin: &AdminServer,
    path: &str,
    query: Option<&str>,
) -> (u16, serde_json::Value) {
    let (status, body) = route_text(admin, path, query);
    (status, serde_json::from_str(&body).unwrap())
}

fn route_text(admin: &AdminServer, path: &str, query: Option<&str>) -> (u16, String) {
    let rendered = admin.render(path, query);
    (rendered.0, rendered.1)
}

#[tokio::test]
async fn test_servers_route_over_socket() {
    let supervisor = two_http_servers_at(free_port_pair().await);
    supervisor.start().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let admin = Arc::new(AdminServer::new(Arc::clone(&supervisor)).unwrap());
    let shutdown = CancellationToken::new();
    let serve_token = shutdown.clone();
    tokio::spawn(async move {
        admin.serve(listener, serve_token).await;
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /servers HTTP/1.1\r\nhost: admin\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("cache-control: no-cache, no-store, must-revalidate"));
    assert!(response.contains("\"count\":2"));

    shutdown.cancel();
    supervisor.stop(Duration::from_millis(300)).await;
}
