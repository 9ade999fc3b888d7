mod errors;
pub(crate) mod launch;
pub(crate) mod shutdown;

pub use errors::LaunchError;
pub use launch::{LaunchOptions, run_daemon, run_daemon_with};
pub use shutdown::{ShutdownError, SignalWatcher, StopHandle};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");
