use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::{ApiError, Progress, ProgressSink};
use crate::sync::lock;

/// Lifecycle of a [`SyncListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Nothing submitted yet.
    Idle,
    /// A request is in flight.
    Submitted,
    /// The request called back; the result has been or will be returned.
    Completed,
    /// The wait gave up; the request may still be running.
    TimedOut,
}

/// Result of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The request finished within the timeout.
    Completed(Result<T, ApiError>),
    /// The timeout elapsed first. Nothing is known about the request.
    TimedOut,
}

impl<T> Outcome<T> {
    /// Returns `true` for [`Outcome::TimedOut`].
    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

struct Slot<T> {
    state: ListenerState,
    result: Option<Result<T, ApiError>>,
    outstanding: usize,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

impl<T> Shared<T> {
    fn finish(&self, result: Result<T, ApiError>) -> bool {
        let mut slot = lock(&self.slot);
        if slot.state != ListenerState::Submitted {
            return false;
        }
        slot.result = Some(result);
        slot.state = ListenerState::Completed;
        drop(slot);
        self.changed.notify_all();
        true
    }
}

/// Converts one asynchronous request into a blocking call.
pub struct SyncListener<T> {
    shared: Arc<Shared<T>>,
    progress: Option<ProgressSink>,
}

impl<T> Default for SyncListener<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncListener<T> {
    /// Builds an idle listener.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: ListenerState::Idle,
                    result: None,
                    outstanding: 0,
                }),
                changed: Condvar::new(),
            }),
            progress: None,
        }
    }

    /// Builds an idle listener that forwards progress updates to `sink`.
    #[must_use]
    pub fn with_progress(sink: ProgressSink) -> Self {
        Self {
            progress: Some(sink),
            ..Self::new()
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        lock(&self.shared.slot).state
    }

    /// Submits a request and blocks until it completes.
    ///
    /// `submit` starts the request and passes the [`Completion`] to whatever
    /// will call back; it may also complete synchronously. Dropping every
    /// completion handle without completing yields [`ApiError::Abandoned`].
    pub fn submit_and_wait<F>(&self, submit: F) -> Result<T, ApiError>
    where
        F: FnOnce(Completion<T>),
    {
        submit(self.begin()?);
        let mut slot = lock(&self.shared.slot);
        while slot.state == ListenerState::Submitted {
            slot = self
                .shared
                .changed
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        slot.result.take().unwrap_or(Err(ApiError::Abandoned))
    }

    /// Submits a request and waits at most `timeout` for it.
    ///
    /// On [`Outcome::TimedOut`] the request is left running and the listener
    /// is spent; use a fresh listener for any retry.
    pub fn submit_and_wait_with_timeout<F>(&self, submit: F, timeout: Duration) -> Outcome<T>
    where
        F: FnOnce(Completion<T>),
    {
        let completion = match self.begin() {
            Ok(completion) => completion,
            Err(error) => return Outcome::Completed(Err(error)),
        };
        submit(completion);

        let slot = lock(&self.shared.slot);
        let (mut slot, _) = self
            .shared
            .changed
            .wait_timeout_while(slot, timeout, |slot| {
                slot.state == ListenerState::Submitted
            })
            .unwrap_or_else(PoisonError::into_inner);
        if slot.state == ListenerState::Submitted {
            slot.state = ListenerState::TimedOut;
            return Outcome::TimedOut;
        }
        Outcome::Completed(slot.result.take().unwrap_or(Err(ApiError::Abandoned)))
    }

    fn begin(&self) -> Result<Completion<T>, ApiError> {
        let mut slot = lock(&self.shared.slot);
        if slot.state != ListenerState::Idle {
            return Err(ApiError::AlreadySubmitted);
        }
        slot.state = ListenerState::Submitted;
        slot.outstanding = 1;
        Ok(Completion {
            shared: Arc::clone(&self.shared),
            progress: self.progress.clone(),
        })
    }
}

/// Callback side of a submitted request.
///
/// Clones share the same request; the first call to [`Completion::complete`]
/// wins.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
    progress: Option<ProgressSink>,
}

impl<T> Completion<T> {
    /// Delivers the final result. Returns `false` when the result was
    /// discarded because the request already finished or timed out.
    pub fn complete(&self, result: Result<T, ApiError>) -> bool {
        self.shared.finish(result)
    }

    /// Reports transfer progress.
    pub fn progress(&self, progress: &Progress) {
        if let Some(sink) = &self.progress {
            sink(progress);
        }
    }

    /// Returns `true` while the waiting side still expects a result.
    pub fn is_pending(&self) -> bool {
        lock(&self.shared.slot).state == ListenerState::Submitted
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        lock(&self.shared.slot).outstanding += 1;
        Self {
            shared: Arc::clone(&self.shared),
            progress: self.progress.clone(),
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        let mut slot = lock(&self.shared.slot);
        slot.outstanding = slot.outstanding.saturating_sub(1);
        let abandoned = slot.outstanding == 0 && slot.state == ListenerState::Submitted;
        drop(slot);
        if abandoned {
            self.shared.finish(Err(ApiError::Abandoned));
        }
    }
}
