//! Blocking wrappers around the callback-driven remote API.
//!
//! A command hands a [`Completion`] to the asynchronous request it submits
//! and parks on the [`SyncListener`] until the request calls back, or until
//! a timeout elapses. A timed-out listener is spent: the request keeps
//! running and its late result is discarded.

mod listener;


use std::sync::Arc;

use thiserror::Error;

pub use listener::{Completion, ListenerState, Outcome, SyncListener};

/// Error reported by the remote API, or by the adapter itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The remote API completed the request with an error.
    #[error("request failed with code {code}: {message}")]
    Remote {
        /// API error code.
        code: i32,
        /// Human readable reason.
        message: String,
    },
    /// Every completion handle was dropped before the request finished.
    #[error("request was abandoned without completing")]
    Abandoned,
    /// The listener already served a request.
    #[error("listener was already used for a request")]
    AlreadySubmitted,
}

impl ApiError {
    /// Builds a remote API error.
    #[must_use]
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }
}

/// Transfer progress reported while a request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Bytes moved so far.
    pub transferred: u64,
    /// Total bytes of the transfer.
    pub total: u64,
    /// Name shown to the user.
    pub title: String,
}

/// Receiver of progress updates.
pub type ProgressSink = Arc<dyn Fn(&Progress) + Send + Sync>;
