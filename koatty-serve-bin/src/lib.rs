use koatty_serve_config::{env_hostname, env_port, HarnessConfig};
use koatty_serve_core::admin::AdminServer;
use koatty_serve_core::logging::StructuredLogger;
use koatty_serve_core::scheduler::MonitoringScheduler;
use koatty_serve_core::supervisor::{Application, MultiProtocolServer};
use koatty_serve_core::terminus::{Terminus, TerminusOptions};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("koatty_serve=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    // Load configuration with environment overrides
    let mut config = HarnessConfig::from_file(config_path)?;
    if let Some(port) = env_port() {
        config.port = port;
    }
    if let Some(hostname) = env_hostname() {
        config.hostname = hostname;
    }

    let logger = StructuredLogger::with_context(koatty_serve_core::logging::LogContext {
        module: Some("serve".to_string()),
        ..Default::default()
    });
    let scheduler = Arc::new(MonitoringScheduler::with_default_tick());
    let supervisor = Arc::new(MultiProtocolServer::new(
        &config,
        Application::default(),
        Arc::clone(&scheduler),
        &logger,
    )?);

    for (id, result) in supervisor.start().await {
        if let Err(e) = result {
            error!(server = %id, error = %e, "Server failed to start");
        }
    }
    info!(
        protocols = ?config.protocols,
        base_port = config.port,
        "Harness started"
    );

    // Sidecar admin endpoint
    let admin_shutdown = CancellationToken::new();
    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.address).await?;
        let admin = Arc::new(AdminServer::new(Arc::clone(&supervisor))?);
        let token = admin_shutdown.clone();
        tokio::spawn(async move {
            admin.serve(listener, token).await;
        });
    }

    // Terminus owns the exit path from here on.
    let terminus = Terminus::new(Arc::clone(&supervisor), TerminusOptions::default());
    let admin_token = admin_shutdown.clone();
    terminus.register_before_exit(Arc::new(move || {
        let admin_token = admin_token.clone();
        Box::pin(async move {
            admin_token.cancel();
        })
    }));
    terminus.bind_signals();

    std::future::pending::<()>().await;
    Ok(())
}
