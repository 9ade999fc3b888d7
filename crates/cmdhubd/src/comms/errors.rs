//! Error types for transport operations.

use std::io;
use std::net::SocketAddr;

use cmdhub_config::SocketPreparationError;
use cmdhub_protocol::FrameError;
use thiserror::Error;

/// Errors raised while (re)creating the listening channel.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to prepare listener directory: {0}")]
    Prepare(#[from] SocketPreparationError),
    #[error("failed to resolve TCP address {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("no TCP addresses resolved for {host}:{port}")]
    ResolveEmpty { host: String, port: u16 },
    #[error("failed to bind TCP listener at {addr}: {source}")]
    BindTcp {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind unix listener at {path}: {source}")]
    BindUnix {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to probe existing unix socket {path}: {source}")]
    Probe {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("existing unix socket {path} is already in use")]
    UnixInUse { path: String },
    #[error("path {path} exists and is not a {expected}")]
    WrongFileType { path: String, expected: &'static str },
    #[error("failed to inspect {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove stale {path}: {source}")]
    Cleanup {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to create named pipe {path}: {source}")]
    CreatePipe {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("failed to open named pipe {path}: {source}")]
    OpenPipe {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to create waker: {0}")]
    Waker(#[source] io::Error),
    #[error("transport does not serve endpoint {endpoint}")]
    WrongEndpoint { endpoint: String },
}

/// Errors raised while serving one petition's response channel.
#[derive(Debug, Error)]
pub(crate) enum ChannelError {
    #[error("no response channel could be created after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("id {id} has no valid response channel")]
    InvalidId { id: u32 },
    #[error("peer did not connect to the response channel in time")]
    Timeout,
    #[error("response channel is closed")]
    Closed,
    #[error("response channel I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed request from {origin}")]
    Malformed { origin: &'static str },
    #[error("the listening channel is not initialised")]
    NoListener,
}

impl ChannelError {
    pub(crate) fn exhausted_descriptors(error: &io::Error) -> bool {
        matches!(error.raw_os_error(), Some(libc::EMFILE | libc::ENFILE))
    }
}
