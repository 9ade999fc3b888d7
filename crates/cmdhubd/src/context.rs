//! Per-thread execution context of a running command.
//!
//! A petition worker enters a [`ContextScope`] before running its command.
//! While the scope is active, the telemetry layer copies log events at or
//! above the thread's log-level override into the petition's
//! [`OutputBuffer`]. Threads without a scope, the interactive thread
//! included, keep the global logging behaviour.

use std::cell::RefCell;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use cmdhub_protocol::{StatusCode, progress_message};
use tracing::Level;

use crate::admission::{HandlePool, SecondaryHandle};
use crate::bridge::{Progress, ProgressSink};
use crate::comms::{CommunicationsManager, Delivery};
use crate::sync::lock;

/// Shared, append-only byte buffer collecting one command's output.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    /// Builds an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes.
    pub fn append(&self, bytes: &[u8]) {
        lock(&self.bytes).extend_from_slice(bytes);
    }

    /// Copies the current contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.bytes).clone()
    }

    /// Moves the contents out, leaving the buffer empty.
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.bytes))
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct ThreadOutput {
    buffer: OutputBuffer,
    log_level: Option<Level>,
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadOutput>> = const { RefCell::new(None) };
}

/// Installs a thread's output redirection until dropped.
#[derive(Debug)]
#[must_use = "the redirection ends when the scope is dropped"]
pub struct ContextScope {
    previous: Option<ThreadOutput>,
    _thread_bound: PhantomData<*const ()>,
}

impl ContextScope {
    /// Redirects this thread's log output into `buffer`.
    pub fn enter(buffer: OutputBuffer, log_level: Option<Level>) -> Self {
        let previous = CURRENT.with(|current| {
            current.replace(Some(ThreadOutput { buffer, log_level }))
        });
        Self {
            previous,
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| {
            current.replace(previous);
        });
    }
}

/// Log-level override of the calling thread, if a scope is active.
#[must_use]
pub fn current_log_level() -> Option<Level> {
    CURRENT.with(|current| {
        current
            .try_borrow()
            .ok()
            .and_then(|state| state.as_ref().and_then(|output| output.log_level))
    })
}

fn set_current_log_level(level: Option<Level>) {
    CURRENT.with(|current| {
        if let Ok(mut state) = current.try_borrow_mut()
            && let Some(output) = state.as_mut()
        {
            output.log_level = level;
        }
    });
}

/// Returns `true` when an event at `level` should be copied into the
/// calling thread's output buffer.
pub(crate) fn redirects(level: &Level) -> bool {
    current_log_level().is_some_and(|max| *level <= max)
}

/// Appends a rendered log line to the calling thread's output buffer.
pub(crate) fn append_log_line(line: &[u8]) {
    CURRENT.with(|current| {
        if let Ok(state) = current.try_borrow()
            && let Some(output) = state.as_ref()
        {
            output.buffer.append(line);
        }
    });
}

/// Daemon services reachable from a running command.
#[derive(Clone)]
pub struct Services {
    handles: Arc<HandlePool<SecondaryHandle>>,
    comms: Option<Arc<dyn CommunicationsManager>>,
}

impl Services {
    /// Bundles the secondary handle pool and the transport used for pushes.
    #[must_use]
    pub fn new(
        handles: Arc<HandlePool<SecondaryHandle>>,
        comms: Option<Arc<dyn CommunicationsManager>>,
    ) -> Self {
        Self { handles, comms }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Services")
            .field("handles", &self.handles.stats())
            .field("push_enabled", &self.comms.is_some())
            .finish()
    }
}

enum Output {
    Buffer(OutputBuffer),
    Stdout(io::Stdout),
}

/// Everything a command sees while it runs.
pub struct ExecutionContext<'a> {
    output: Output,
    status: StatusCode,
    log_level: Option<Level>,
    confirm: &'a mut dyn FnMut(&str) -> bool,
    services: &'a Services,
}

impl<'a> ExecutionContext<'a> {
    /// Context for a petition: output lands in `buffer`.
    pub fn for_petition(
        buffer: OutputBuffer,
        confirm: &'a mut dyn FnMut(&str) -> bool,
        services: &'a Services,
    ) -> Self {
        Self::with_output(Output::Buffer(buffer), confirm, services)
    }

    /// Context for the interactive console: output goes to stdout.
    pub fn interactive(confirm: &'a mut dyn FnMut(&str) -> bool, services: &'a Services) -> Self {
        Self::with_output(Output::Stdout(io::stdout()), confirm, services)
    }

    fn with_output(
        output: Output,
        confirm: &'a mut dyn FnMut(&str) -> bool,
        services: &'a Services,
    ) -> Self {
        Self {
            output,
            status: StatusCode::OK,
            log_level: current_log_level(),
            confirm,
            services,
        }
    }

    /// Status that will be sent with the response.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the status sent with the response.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Log-level override of this command.
    #[must_use]
    pub const fn log_level(&self) -> Option<Level> {
        self.log_level
    }

    /// Changes which log events are copied into the command's output.
    pub fn set_log_level(&mut self, level: Option<Level>) {
        self.log_level = level;
        set_current_log_level(level);
    }

    /// Asks whoever issued the command to confirm `question`.
    pub fn confirm(&mut self, question: &str) -> bool {
        (self.confirm)(question)
    }

    /// Pool of secondary handles.
    #[must_use]
    pub fn handles(&self) -> &HandlePool<SecondaryHandle> {
        &self.services.handles
    }

    /// Pushes `message` to the state listener registered as `client_id`.
    pub fn notify_client(&self, client_id: u64, message: &str) -> Delivery {
        match &self.services.comms {
            Some(comms) => comms.inform_client(client_id, message),
            None => Delivery::Unsupported,
        }
    }

    /// Progress sink forwarding updates to the listener `client_id`.
    #[must_use]
    pub fn progress_sink(&self, client_id: u64) -> Option<ProgressSink> {
        let comms = self.services.comms.clone()?;
        Some(Arc::new(move |progress: &Progress| {
            let message = progress_message(progress.transferred, progress.total, &progress.title);
            comms.inform_client(client_id, &message);
        }))
    }
}

impl Write for ExecutionContext<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.output {
            Output::Buffer(buffer) => buffer.write(buf),
            Output::Stdout(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.output {
            Output::Buffer(_) => Ok(()),
            Output::Stdout(stdout) => stdout.flush(),
        }
    }
}
