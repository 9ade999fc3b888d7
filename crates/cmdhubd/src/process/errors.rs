//! Defines the unified error surface for daemon launch and supervision.

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::comms::ListenerError;

use super::shutdown::ShutdownError;

/// Errors surfaced while launching or supervising the daemon process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Bootstrap failed before the transport was created.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// The listening channel could not be created.
    #[error("failed to open the listening channel: {source}")]
    Listener {
        /// Underlying transport error.
        #[from]
        source: ListenerError,
    },
    /// Signal handling could not be wired.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}
