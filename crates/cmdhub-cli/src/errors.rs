//! Error types of the client runtime.

use std::io;
use std::sync::Arc;

use cmdhub_protocol::FrameError;
use thiserror::Error;

/// Failures that end a client invocation.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error("failed to resolve daemon address {endpoint}: {source}")]
    Resolve { endpoint: String, source: io::Error },
    #[error("failed to connect to daemon at {endpoint}: {source}")]
    Connect { endpoint: String, source: io::Error },
    #[error("failed to encode request: {0}")]
    EncodeRequest(#[source] FrameError),
    #[error("failed to send request to daemon: {0}")]
    SendRequest(io::Error),
    #[error("failed to read response from daemon: {0}")]
    ReadResponse(#[source] FrameError),
    #[error("failed to forward daemon output: {0}")]
    ForwardResponse(io::Error),
    #[error("daemon answered with invalid petition id {id}")]
    InvalidId { id: i32 },
    #[error("command is too long for a named pipe request ({size} of {limit} bytes)")]
    RequestTooLarge { size: usize, limit: usize },
    #[error("failed to create reply pipe '{path}': {source}")]
    ReplyPipe { path: String, source: io::Error },
    #[error("daemon did not answer within {seconds} s")]
    Timeout { seconds: u64 },
    #[error("state listeners need a socket endpoint, not {endpoint}")]
    ListenUnsupported { endpoint: String },
}
