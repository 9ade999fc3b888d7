//! The `cmdhubd` daemon.
//!
//! The daemon serves commands to short-lived `cmdhub` clients over a local
//! transport: a Unix socket, a loopback TCP port or a pair of named pipes.
//! Each client petition is answered on its own response channel by a worker
//! thread, bounded by the admission controller, while the main thread keeps
//! waiting for further petitions and for interactive console input.
//!
//! Startup follows a fixed sequence: configuration is loaded through
//! `ortho_config`, structured telemetry is installed, the socket directory is
//! prepared, and the listening channel is created. Health reporting hooks
//! emit structured events at each stage.
//!
//! Commands run inside an [`ExecutionContext`] that isolates their output and
//! log-level override from concurrently running petitions. The executor that
//! interprets command lines sits behind the [`CommandExecutor`] trait.

pub mod admission;
mod bootstrap;
pub mod bridge;
pub mod comms;
pub mod context;
pub mod dispatch;
pub mod executor;
mod health;
mod process;
mod sync;
mod telemetry;

pub use bootstrap::{
    BootstrapError, ConfigLoader, Daemon, StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
pub use context::{ExecutionContext, OutputBuffer};
pub use dispatch::{Server, ServerSettings};
pub use executor::{BuiltinExecutor, CommandError, CommandExecutor};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use process::{
    LaunchError, LaunchOptions, ShutdownError, SignalWatcher, StopHandle, run_daemon,
    run_daemon_with,
};
pub use telemetry::{PetitionLogLayer, TelemetryError, TelemetryHandle, initialise};

#[cfg(test)]
mod tests;
