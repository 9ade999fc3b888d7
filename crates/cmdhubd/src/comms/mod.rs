//! Transport abstraction between the daemon and its clients.
//!
//! Every backend follows the same exchange: the client submits a command on
//! the listening channel, the backend opens a response channel and tells the
//! client its id, and the worker running the command later writes the status
//! and output there. Response channels double as confirmation prompts and,
//! for registered state listeners, as push channels.
//!
//! [`for_endpoint`] picks the backend for a configured endpoint.

mod errors;
mod petition;
mod pipe;
mod readiness;
mod registry;
mod socket;
mod tcp;
mod unix;

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cmdhub_config::SocketEndpoint;
use cmdhub_protocol::StatusCode;
use tracing::{debug, error, warn};

pub use errors::ListenerError;
pub(crate) use errors::ChannelError;
pub use petition::{FAILED_PETITION, Petition};
pub use pipe::PipeCommunications;
pub use registry::{MAX_MISSED_PUSHES, StateListeners};
pub use tcp::TcpCommunications;
pub use unix::UnixCommunications;

use petition::ResponseChannel;
use readiness::{Readiness, WaitError};

use crate::sync::lock;

/// Tracing target for transport events.
pub(crate) const COMMS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::comms");

/// How long a worker waits for the client to open its response channel.
pub const RESPONSE_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a push waits for a state listener to connect.
pub const STATE_LISTENER_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a client has to answer a confirmation before it counts as no.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound for reading a request from an accepted connection.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const RESPONSE_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const PUSH_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

const OPEN_ATTEMPTS: u32 = 10;
/// Only the last attempts log failures.
const LOGGED_ATTEMPTS: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(1);
const REINIT_BACKOFF: Duration = Duration::from_millis(150);

/// Result of waiting for activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A petition, console input, or both are ready.
    Ready,
    /// The listening channel failed and was reinitialised; wait again.
    Recovered,
    /// [`CommunicationsManager::stop_waiting`] was called.
    Stopped,
}

/// Result of pushing a message to a state listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The listener did not accept the push in time; it is dropped after
    /// [`MAX_MISSED_PUSHES`] consecutive misses.
    Pending,
    /// The listener disconnected and has been dropped.
    Gone,
    /// The transport cannot push messages.
    Unsupported,
    /// No listener is registered under the requested client id.
    UnknownClient,
}

/// Capability set every transport backend provides.
///
/// Methods take `&self`: the main loop waits and accepts while workers
/// answer petitions concurrently.
pub trait CommunicationsManager: Send + Sync {
    /// Creates, or recreates, the listening channel.
    fn initialize(&self) -> Result<(), ListenerError>;

    /// Blocks until a petition arrives, `input` becomes readable, or
    /// [`Self::stop_waiting`] is called.
    fn wait_for_petition_or_input(&self, input: Option<BorrowedFd<'_>>) -> WaitStatus;

    fn wait_for_petition(&self) -> WaitStatus {
        self.wait_for_petition_or_input(None)
    }

    /// Whether the last wait saw console input.
    fn received_input(&self) -> bool;

    /// Whether the last wait saw a pending petition.
    fn received_petition(&self) -> bool;

    /// Reads the pending request and opens its response channel. Returns
    /// [`Petition::failed`] when that is not possible.
    fn get_petition(&self) -> Petition;

    /// Sends the final status and output, then releases the petition.
    fn return_and_close_petition(&self, petition: Petition, output: &[u8], status: StatusCode);

    /// Asks the petition's client a yes/no question. Unsupported transports
    /// and failures answer `false`.
    fn get_confirmation(&self, petition: &mut Petition, question: &str) -> bool;

    /// Pushes `message` to one registered listener.
    fn inform_state_listener(&self, petition: &mut Petition, message: &str) -> Delivery;

    fn supports_state_listeners(&self) -> bool {
        true
    }

    fn state_listeners(&self) -> &StateListeners;

    /// Keeps `petition` open as a state listener and returns its client id.
    fn register_state_listener(&self, petition: Petition) -> u64 {
        self.state_listeners().register(petition)
    }

    /// Pushes `message` to every listener, dropping the dead ones. Returns
    /// how many pushes were delivered.
    fn inform_state_listeners(&self, message: &str) -> usize {
        self.state_listeners()
            .inform_all(|petition| self.inform_state_listener(petition, message))
    }

    fn inform_client(&self, client_id: u64, message: &str) -> Delivery {
        self.state_listeners()
            .inform_one(client_id, |petition| self.inform_state_listener(petition, message))
    }

    /// Wakes a blocked wait; later waits return [`WaitStatus::Stopped`].
    fn stop_waiting(&self);

    /// Short description of a petition for logs.
    fn petition_details(&self, petition: &Petition) -> String;
}

/// Builds the backend serving `endpoint`. The listening channel is created
/// by [`CommunicationsManager::initialize`].
pub fn for_endpoint(
    endpoint: &SocketEndpoint,
) -> Result<Arc<dyn CommunicationsManager>, ListenerError> {
    let comms: Arc<dyn CommunicationsManager> = match endpoint {
        SocketEndpoint::Unix { .. } => Arc::new(UnixCommunications::new(endpoint.clone())?),
        SocketEndpoint::Tcp { .. } => Arc::new(TcpCommunications::new(endpoint.clone())?),
        SocketEndpoint::Pipe { .. } => Arc::new(PipeCommunications::new(endpoint.clone())?),
    };
    Ok(comms)
}

/// State shared by every backend: readiness, id allocation and listeners.
#[derive(Debug)]
pub(crate) struct ChannelCore {
    readiness: Readiness,
    listeners: StateListeners,
    ids: Mutex<IdRange>,
}

/// Last id handed out and the id it wraps after.
#[derive(Debug)]
struct IdRange {
    last: u32,
    max: u32,
}

impl ChannelCore {
    pub(crate) fn new(max_id: u32) -> Result<Self, ListenerError> {
        Ok(Self {
            readiness: Readiness::new().map_err(ListenerError::Waker)?,
            listeners: StateListeners::new(),
            ids: Mutex::new(IdRange {
                last: 0,
                max: max_id.max(1),
            }),
        })
    }

    /// Next response channel id, wrapping back to 1 after the limit.
    pub(crate) fn next_id(&self) -> u32 {
        let mut ids = lock(&self.ids);
        ids.last = if ids.last >= ids.max { 1 } else { ids.last + 1 };
        ids.last
    }

    /// Replaces the wrap limit, restarting at 1 when the last id is beyond it.
    pub(crate) fn set_max_id(&self, max_id: u32) {
        let mut ids = lock(&self.ids);
        ids.max = max_id.max(1);
        if ids.last > ids.max {
            ids.last = 0;
        }
    }

    pub(crate) fn max_id(&self) -> u32 {
        lock(&self.ids).max
    }

    pub(crate) const fn listeners(&self) -> &StateListeners {
        &self.listeners
    }

    pub(crate) fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Waits on `listener`, reinitialising through `reinit` when it breaks.
    pub(crate) fn wait_on<L: AsFd>(
        &self,
        listener: &Mutex<Option<L>>,
        input: Option<BorrowedFd<'_>>,
        reinit: impl FnOnce() -> Result<(), ListenerError>,
    ) -> WaitStatus {
        let outcome = {
            let guard = lock(listener);
            match guard.as_ref() {
                Some(listener) => self.readiness.wait(listener.as_fd(), input),
                None => Err(WaitError::Broken(String::from(
                    "the listening channel is not initialised",
                ))),
            }
        };

        match outcome {
            Ok(()) => WaitStatus::Ready,
            Err(WaitError::Stopped) => WaitStatus::Stopped,
            Err(WaitError::Broken(reason)) => {
                warn!(target: COMMS_TARGET, %reason, "readiness wait failed; reinitialising");
                if let Err(error) = reinit() {
                    error!(target: COMMS_TARGET, %error, "failed to reinitialise the listening channel");
                    thread::sleep(REINIT_BACKOFF);
                }
                WaitStatus::Recovered
            }
        }
    }
}

/// Opens a response channel under successive ids.
///
/// `sweep` runs when descriptors are exhausted so dead state listeners can
/// release theirs before the next attempt.
pub(crate) fn open_with_retry<T>(
    core: &ChannelCore,
    mut open: impl FnMut(u32) -> io::Result<T>,
    sweep: impl Fn(),
) -> Result<T, ChannelError> {
    for attempt in 1..=OPEN_ATTEMPTS {
        let id = core.next_id();
        match open(id) {
            Ok(channel) => return Ok(channel),
            Err(error) if ChannelError::exhausted_descriptors(&error) => {
                warn!(target: COMMS_TARGET, attempt, %error, "descriptors exhausted; probing state listeners");
                sweep();
            }
            Err(error) if attempt + LOGGED_ATTEMPTS > OPEN_ATTEMPTS => {
                warn!(target: COMMS_TARGET, id, attempt, %error, "failed to open response channel");
            }
            Err(_) => {}
        }
        thread::sleep(OPEN_RETRY_DELAY);
    }
    Err(ChannelError::Exhausted {
        attempts: OPEN_ATTEMPTS,
    })
}

/// Converts a channel id to its wire form.
pub(crate) fn wire_id(id: u32) -> Result<i32, ChannelError> {
    i32::try_from(id).map_err(|_| ChannelError::InvalidId { id })
}

/// Answers a petition on a socket response channel.
pub(crate) fn respond_on_socket(
    details: &str,
    channel: ResponseChannel,
    output: &[u8],
    status: StatusCode,
) {
    let outcome = match channel {
        ResponseChannel::Unix(mut channel) => channel.send_response(output, status),
        ResponseChannel::Tcp(mut channel) => channel.send_response(output, status),
        ResponseChannel::Closed => {
            debug!(target: COMMS_TARGET, petition = details, "petition has no response channel");
            return;
        }
        ResponseChannel::Pipe(_) => Err(ChannelError::Closed),
    };
    match outcome {
        Ok(()) => debug!(
            target: COMMS_TARGET,
            petition = details,
            %status,
            bytes = output.len(),
            "response delivered"
        ),
        Err(error) => warn!(
            target: COMMS_TARGET,
            petition = details,
            %status,
            %error,
            "failed to deliver response"
        ),
    }
}

/// Asks a confirmation on a socket response channel.
pub(crate) fn confirm_on_socket(details: &str, channel: &mut ResponseChannel, question: &str) -> bool {
    let outcome = match channel {
        ResponseChannel::Unix(channel) => channel.confirm(question, CONFIRM_TIMEOUT),
        ResponseChannel::Tcp(channel) => channel.confirm(question, CONFIRM_TIMEOUT),
        ResponseChannel::Closed | ResponseChannel::Pipe(_) => Err(ChannelError::Closed),
    };
    outcome.unwrap_or_else(|error| {
        warn!(target: COMMS_TARGET, petition = details, %error, "confirmation failed; assuming no");
        false
    })
}

/// Pushes to a state listener held on a socket response channel.
pub(crate) fn push_on_socket(channel: &mut ResponseChannel, message: &str) -> Delivery {
    match channel {
        ResponseChannel::Unix(channel) => channel.push(message),
        ResponseChannel::Tcp(channel) => channel.push(message),
        ResponseChannel::Closed => Delivery::Gone,
        ResponseChannel::Pipe(_) => Delivery::Unsupported,
    }
}

/// Describes a socket petition for logs.
pub(crate) fn describe(transport: &str, petition: &Petition) -> String {
    let worker = petition.worker_name().unwrap_or("main");
    match (petition.response_id(), petition.client_id()) {
        (Some(id), Some(client)) => {
            format!("{transport} channel {id} (client {client}, {worker}): {}", petition.line())
        }
        (Some(id), None) => format!("{transport} channel {id} ({worker}): {}", petition.line()),
        (None, _) => format!("{transport} without response channel: {}", petition.line()),
    }
}
