//! Shared configuration for the `cmdhubd` daemon and the `cmdhub` client.
//!
//! Values are layered by `ortho_config`: built-in defaults, then a
//! configuration file, then `CMDHUB_*` environment variables, then command
//! line flags.

mod defaults;
mod socket;

use std::ffi::OsString;
use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_MAX_PARALLEL_PETITIONS, DEFAULT_SECONDARY_HANDLES,
    DEFAULT_TCP_PORT, LISTENER_FILE_NAME, PIPE_FILE_NAME, default_log_filter, default_log_format,
    default_pipe_endpoint, default_socket_endpoint, runtime_directory,
};
pub use socket::{SocketEndpoint, SocketParseError, SocketPreparationError};

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable single line output.
    Compact,
}

/// Resolved configuration shared by the daemon and the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "CMDHUB")]
pub struct Config {
    /// Listening endpoint of the daemon.
    #[serde(default = "defaults::default_socket_endpoint")]
    pub daemon_socket: SocketEndpoint,
    /// `EnvFilter` directive applied to daemon logs.
    #[serde(default = "defaults::default_log_filter_string")]
    pub log_filter: String,
    /// Output format of daemon logs.
    #[serde(default = "defaults::default_log_format")]
    pub log_format: LogFormat,
    /// Number of petitions processed concurrently.
    #[serde(default = "defaults::default_max_parallel_petitions")]
    pub max_parallel_petitions: usize,
    /// Size of the secondary handle pool.
    #[serde(default = "defaults::default_secondary_handles")]
    pub secondary_handles: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_socket: default_socket_endpoint(),
            log_filter: defaults::default_log_filter_string(),
            log_format: default_log_format(),
            max_parallel_petitions: DEFAULT_MAX_PARALLEL_PETITIONS,
            secondary_handles: DEFAULT_SECONDARY_HANDLES,
        }
    }
}

impl Config {
    /// Loads configuration from the process arguments and environment.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        <Self as OrthoConfig>::load()
    }

    /// Loads configuration from an explicit argument list.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as OrthoConfig>::load_from_iter(args)
    }

    /// Listening endpoint of the daemon.
    #[must_use]
    pub const fn daemon_socket(&self) -> &SocketEndpoint {
        &self.daemon_socket
    }

    /// Log filter directive.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Admission slot capacity, never below one.
    #[must_use]
    pub fn max_parallel_petitions(&self) -> usize {
        self.max_parallel_petitions.max(1)
    }

    /// Secondary handle pool size, never below one.
    #[must_use]
    pub fn secondary_handles(&self) -> usize {
        self.secondary_handles.max(1)
    }
}
