//! Supervises daemon launch sequencing and runtime orchestration.

use std::sync::Arc;

use tracing::info;

use crate::bootstrap::{ConfigLoader, SystemConfigLoader, bootstrap_with};
use crate::comms;
use crate::dispatch::{Console, Server, ServerSettings};
use crate::executor::{BuiltinExecutor, CommandExecutor};
use crate::health::{HealthReporter, StructuredHealthReporter};

use super::errors::LaunchError;
use super::shutdown::SignalWatcher;
use super::PROCESS_TARGET;

/// Collaborators of a daemon run.
pub struct LaunchOptions {
    /// Source of the configuration.
    pub loader: Box<dyn ConfigLoader>,
    /// Sink for lifecycle events.
    pub reporter: Arc<dyn HealthReporter>,
    /// Command catalogue petitions run against.
    pub executor: Arc<dyn CommandExecutor>,
    /// Serve an interactive console when stdin is a terminal.
    pub console: bool,
    /// Stop on termination signals.
    pub signals: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            loader: Box::new(SystemConfigLoader),
            reporter: Arc::new(StructuredHealthReporter::new()),
            executor: Arc::new(BuiltinExecutor),
            console: true,
            signals: true,
        }
    }
}

/// Runs the daemon using the production collaborators.
pub fn run_daemon() -> Result<(), LaunchError> {
    run_daemon_with(LaunchOptions::default())
}

/// Runs the daemon with injected collaborators until it is stopped.
pub fn run_daemon_with(options: LaunchOptions) -> Result<(), LaunchError> {
    let LaunchOptions {
        loader,
        reporter,
        executor,
        console,
        signals,
    } = options;

    let daemon = bootstrap_with(loader.as_ref(), reporter)?;
    let config = daemon.config();
    info!(
        target: PROCESS_TARGET,
        endpoint = %config.daemon_socket(),
        "starting daemon runtime"
    );

    let comms = comms::for_endpoint(config.daemon_socket())?;
    comms.initialize()?;
    daemon.reporter().listening(config.daemon_socket());

    let mut server = Server::new(comms, executor, ServerSettings::from_config(config))
        .with_reporter(daemon.reporter());
    if console && let Some(terminal) = Console::stdin() {
        server = server.with_console(terminal);
    }

    let watcher = if signals {
        Some(SignalWatcher::install(server.stop_handle())?)
    } else {
        None
    };
    server.run();
    drop(watcher);
    drop(server);

    info!(target: PROCESS_TARGET, "shutdown sequence completed");
    Ok(())
}

impl std::fmt::Debug for LaunchOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LaunchOptions")
            .field("console", &self.console)
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}
