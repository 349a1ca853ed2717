//! End-to-end lifecycle scenarios over real sockets.

use koatty_serve_core::config::{ConnectionPoolConfig, ListeningOptions, Protocol};
use koatty_serve_core::logging::StructuredLogger;
use koatty_serve_core::pool::grpc::GrpcCallHandle;
use koatty_serve_core::pool::socket::SocketStrategy;
use koatty_serve_core::scheduler::MonitoringScheduler;
use koatty_serve_core::server::grpc::GrpcServer;
use koatty_serve_core::server::http::HttpAdapter;
use koatty_serve_core::server::{
    default_http_handler, HarnessServer, ServerStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn http_options() -> ListeningOptions {
    ListeningOptions {
        hostname: "127.0.0.1".into(),
        port: 0,
        protocol: Protocol::Http,
        ..Default::default()
    }
}

fn http_server(options: ListeningOptions) -> Arc<HarnessServer<HttpAdapter>> {
    HarnessServer::new(
        HttpAdapter::new(default_http_handler()),
        SocketStrategy::http(),
        options,
        Arc::new(MonitoringScheduler::with_default_tick()),
        &StructuredLogger::new(),
    )
    .unwrap()
}

async fn raw_request(addr: std::net::SocketAddr, payload: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn test_http_lifecycle() {
    let server = http_server(http_options());
    server.start().await.unwrap();

    assert!(server.state.is_listening());
    assert_eq!(server.state.status(), ServerStatus::Running);
    let addr = server.state.bound_addr().unwrap();

    let response = raw_request(
        addr,
        b"GET / HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));

    server
        .stop_with_drain(Duration::from_secs(10), Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(server.pool.get_active_connection_count(), 0);
    assert_eq!(server.state.status(), ServerStatus::Stopped);

    // the listening socket is closed
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_malformed_request_gets_raw_400() {
    let server = http_server(http_options());
    server.start().await.unwrap();
    let addr = server.state.bound_addr().unwrap();

    let response = raw_request(addr, b"NONSENSE / HTTP/1.1\r\n\r\n").await;
    assert_eq!(response, "HTTP/1.1 400 Bad Request\r\n\r\n");

    server.stop_with_drain(Duration::from_secs(2), Duration::ZERO)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_overloaded_pool_answers_503() {
    let mut options = http_options();
    options.connection_pool = ConnectionPoolConfig {
        max_connections: 1,
        ..Default::default()
    };
    let server = http_server(options);
    server.start().await.unwrap();
    let addr = server.state.bound_addr().unwrap();

    // first connection occupies the only pool slot via keep-alive
    let mut first = TcpStream::connect(addr).await.unwrap();
    first
        .write_all(b"GET / HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut buffer = [0u8; 256];
    let n = first.read(&mut buffer).await.unwrap();
    assert!(String::from_utf8_lossy(&buffer[..n]).starts_with("HTTP/1.1 200"));

    // second connection passes the method sniff but is denied admission
    let response = raw_request(
        addr,
        b"GET / HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 503"));
    assert_eq!(server.pool.get_metrics().rejected_connections, 1);

    drop(first);
    server
        .stop_with_drain(Duration::from_secs(2), Duration::ZERO)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bind_failure_leaves_created_status() {
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_port = blocker.local_addr().unwrap().port();

    let mut options = http_options();
    options.port = taken_port;
    let server = http_server(options);
    // bind failure is logged, not raised
    server.start().await.unwrap();
    assert!(!server.state.is_listening());
    assert_eq!(server.state.status(), ServerStatus::Created);
}

#[tokio::test]
async fn test_config_hot_reload_classification() {
    let server = http_server(http_options());
    server.start().await.unwrap();
    let first_addr = server.state.bound_addr().unwrap();

    // runtime-apply: pool capacity grows without a restart
    let mut runtime_change = (*server.state.options()).clone();
    runtime_change.connection_pool.max_connections = 200;
    assert!(server.update_config(runtime_change).await.unwrap());
    assert_eq!(server.pool.config().max_connections, 200);
    assert_eq!(server.state.bound_addr().unwrap(), first_addr);
    assert_eq!(server.state.status(), ServerStatus::Running);

    // invalid update is refused and the old snapshot stays
    let mut invalid = (*server.state.options()).clone();
    invalid.connection_pool.max_connections = 0;
    assert!(!server.update_config(invalid).await.unwrap());
    assert_eq!(server.pool.config().max_connections, 200);

    // critical network change: restart and re-bind on the new port
    let free_port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };
    let mut network_change = (*server.state.options()).clone();
    network_change.port = free_port;
    assert!(server.update_config(network_change).await.unwrap());
    assert_eq!(server.state.status(), ServerStatus::Running);
    assert_eq!(server.state.bound_addr().unwrap().port(), free_port);

    server
        .stop_with_drain(Duration::from_secs(2), Duration::ZERO)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_shutdown_is_single_shot() {
    let server = http_server(http_options());
    server.start().await.unwrap();

    let first = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.stop_with_drain(Duration::from_secs(2), Duration::ZERO).await })
    };
    let second = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.stop_with_drain(Duration::from_secs(2), Duration::ZERO).await })
    };
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(server.state.status(), ServerStatus::Stopped);
}

#[tokio::test]
async fn test_grpc_graceful_drain() {
    let options = ListeningOptions {
        hostname: "127.0.0.1".into(),
        port: 0,
        protocol: Protocol::Grpc,
        ..Default::default()
    };
    let server = GrpcServer::new(
        tonic::service::Routes::default(),
        options,
        Arc::new(MonitoringScheduler::with_default_tick()),
        &StructuredLogger::new(),
    )
    .unwrap();
    server.start().await.unwrap();
    assert!(server.state.is_listening());

    // one long-running call occupies the pool
    let long_call = GrpcCallHandle::new("pkg.Slow", "Wait", "127.0.0.1:9");
    server
        .pool
        .register_connection(long_call, None)
        .unwrap();

    let pool = Arc::clone(&server.pool);
    let late_admission = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.register_connection(GrpcCallHandle::new("pkg.S", "M", "peer"), None)
    });

    let shutdown = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            server
                .stop_with_drain(Duration::from_millis(1000), Duration::from_millis(100))
                .await
        })
    };

    // step 1 flips the not-accepting flag before the late call arrives
    assert!(late_admission.await.unwrap().is_none());
    assert!(shutdown.await.unwrap().is_ok());
    assert_eq!(server.pool.get_active_connection_count(), 0);
    assert_eq!(server.state.status(), ServerStatus::Stopped);
}

#[tokio::test]
async fn test_shutdown_deregisters_monitoring_tasks() {
    let scheduler = Arc::new(MonitoringScheduler::with_default_tick());
    let server = HarnessServer::new(
        HttpAdapter::new(default_http_handler()),
        SocketStrategy::http(),
        http_options(),
        Arc::clone(&scheduler),
        &StructuredLogger::new(),
    )
    .unwrap();
    server.start().await.unwrap();
    assert!(scheduler.task_count() > 0);

    server
        .stop_with_drain(Duration::from_secs(2), Duration::ZERO)
        .await
        .unwrap();
    let prefix = server.state.task_prefix();
    assert!(scheduler
        .task_names()
        .iter()
        .all(|name| !name.starts_with(&prefix)));
}
