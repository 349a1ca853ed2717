//! Terminus: binds termination signals to coordinated shutdown.
//!
//! On signal: every server's status flips to kill-received, before-exit
//! hooks drain sequentially, and in production a forced-exit timer races the
//! supervisor's stop fan-out. Development mode exits immediately.

use crate::config::{env_mode, EnvMode};
use crate::server::BoxFuture;
use crate::supervisor::MultiProtocolServer;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_FORCED_EXIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Shutdown coordination knobs.
#[derive(Debug, Clone)]
pub struct TerminusOptions {
    /// Hard deadline after which the process exits 1.
    pub forced_exit_timeout: Duration,
    /// Budget handed to each server's graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for TerminusOptions {
    fn default() -> Self {
        Self {
            forced_exit_timeout: DEFAULT_FORCED_EXIT_TIMEOUT,
            shutdown_timeout: crate::server::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

pub type BeforeExitHook = Arc<dyn Fn() -> BoxFuture<()> + Send + Sync>;

/// Signal binder for one supervisor. Multiple instances may bind
/// simultaneously; each observes the signal independently.
pub struct Terminus {
    supervisor: Arc<MultiProtocolServer>,
    options: TerminusOptions,
    before_exit: StdMutex<Vec<BeforeExitHook>>,
    bound: AtomicBool,
}

impl Terminus {
    pub fn new(supervisor: Arc<MultiProtocolServer>, options: TerminusOptions) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            options,
            before_exit: StdMutex::new(Vec::new()),
            bound: AtomicBool::new(false),
        })
    }

    /// Registers a hook run before exit, in registration order.
    pub fn register_before_exit(&self, hook: BeforeExitHook) {
        self.before_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    /// Binds the termination signal set once; the spawned task exits the
    /// process with the code produced by [`Terminus::handle_signal`].
    pub fn bind_signals(self: &Arc<Self>) {
        if self.bound.swap(true, Ordering::SeqCst) {
            return;
        }
        let terminus = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            let code = terminus.handle_signal().await;
            std::process::exit(code);
        });
    }

    /// Shutdown sequence shared by every signal. Returns the process exit
    /// code: 0 for a graceful stop, 1 when the forced-exit timer fires.
    pub async fn handle_signal(&self) -> i32 {
        info!("Termination signal received");
        self.supervisor.mark_kill_received();

        let hooks: Vec<BeforeExitHook> = self
            .before_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            if AssertUnwindSafe(hook()).catch_unwind().await.is_err() {
                warn!("before-exit hook panicked");
            }
        }

        if env_mode() == EnvMode::Development {
            info!("Development environment: exiting immediately");
            return 0;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.options.forced_exit_timeout) => {
                error!(
                    timeout_secs = self.options.forced_exit_timeout.as_secs(),
                    "Forced exit: graceful shutdown did not finish in time"
                );
                1
            }
            results = self.supervisor.stop(self.options.shutdown_timeout) => {
                let failures = results.iter().filter(|(_, r)| r.is_err()).count();
                if failures > 0 {
                    warn!(failures, "Some servers reported errors while stopping");
                }
                0
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to bind SIGINT");
            return std::future::pending().await;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to bind SIGTERM");
            return std::future::pending().await;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to bind SIGQUIT");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HarnessConfig, Protocol};
    use crate::logging::StructuredLogger;
    use crate::scheduler::MonitoringScheduler;
    use crate::server::ServerStatus;
    use crate::supervisor::Application;
    use std::sync::Mutex;

    fn supervisor() -> Arc<MultiProtocolServer> {
        let config = HarnessConfig {
            protocols: vec![Protocol::Http],
            hostname: "127.0.0.1".into(),
            port: 0,
            trace: false,
            ext: Default::default(),
            ssl: None,
            connection_pool: Default::default(),
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
    async fn test_signal_flow() {
        // Covers hook ordering, 503 status flip, development fast-exit, and
        // panic isolation in one flow to keep env-var mutation serialized.
        unsafe {
            std::env::remove_var("APP_ENV");
            std::env::remove_var("NODE_ENV");
        }

        let supervisor = supervisor();
        let terminus = Terminus::new(
            Arc::clone(&supervisor),
            TerminusOptions {
                forced_exit_timeout: Duration::from_secs(10),
                shutdown_timeout: Duration::from_millis(200),
            },
        );

        let order = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        terminus.register_before_exit(Arc::new(move || {
            let first = Arc::clone(&first);
            Box::pin(async move {
                first.lock().unwrap().push(1);
            })
        }));
        terminus.register_before_exit(Arc::new(|| {
            Box::pin(async {
                panic!("hook failure");
            })
        }));
        let third = Arc::clone(&order);
        terminus.register_before_exit(Arc::new(move || {
            let third = Arc::clone(&third);
            Box::pin(async move {
                third.lock().unwrap().push(3);
            })
        }));

        let code = terminus.handle_signal().await;
        assert_eq!(code, 0);
        assert_eq!(order.lock().unwrap().clone(), vec![1, 3]);
        assert_eq!(
            supervisor.servers()[0].status(),
            ServerStatus::KillReceived
        );

        // Production path: the stop fan-out wins the race against the timer.
        unsafe {
            std::env::set_var("APP_ENV", "production");
        }
        let code = terminus.handle_signal().await;
        assert_eq!(code, 0);
        unsafe {
            std::env::remove_var("APP_ENV");
        }
    }
}
