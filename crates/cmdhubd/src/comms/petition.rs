//! A received request together with the channel its response goes back on.

use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::thread::Thread;

use super::pipe::PipeChannel;
use super::socket::SocketChannel;

/// Command line carried by [`Petition::failed`].
pub const FAILED_PETITION: &str = "ERROR";

/// Response side of a petition, one variant per transport.
#[derive(Debug)]
pub(crate) enum ResponseChannel {
    Closed,
    Unix(SocketChannel<UnixListener>),
    Tcp(SocketChannel<TcpListener>),
    Pipe(PipeChannel),
}

impl ResponseChannel {
    fn id(&self) -> Option<u32> {
        match self {
            Self::Closed => None,
            Self::Unix(channel) => Some(channel.id()),
            Self::Tcp(channel) => Some(channel.id()),
            Self::Pipe(channel) => Some(channel.id()),
        }
    }
}

/// One client request.
///
/// A petition is answered at most once: answering consumes it, and dropping
/// it releases its response channel.
#[derive(Debug)]
pub struct Petition {
    line: String,
    channel: ResponseChannel,
    worker: Option<Thread>,
    client_id: Option<u64>,
    missed_pushes: u8,
}

impl Petition {
    pub(crate) fn new(line: String, channel: ResponseChannel) -> Self {
        Self {
            line,
            channel,
            worker: None,
            client_id: None,
            missed_pushes: 0,
        }
    }

    /// Petition without a response channel.
    #[cfg(test)]
    pub(crate) fn detached(line: impl Into<String>) -> Self {
        Self::new(line.into(), ResponseChannel::Closed)
    }

    /// Sentinel returned when a request could not be read.
    #[must_use]
    pub fn failed() -> Self {
        Self::new(String::from(FAILED_PETITION), ResponseChannel::Closed)
    }

    /// The command text.
    #[must_use]
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Returns `true` for the [`Petition::failed`] sentinel.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.channel, ResponseChannel::Closed) && self.line == FAILED_PETITION
    }

    /// Id the client was told, if a response channel exists.
    #[must_use]
    pub fn response_id(&self) -> Option<u32> {
        self.channel.id()
    }

    /// Records the thread serving this petition.
    pub fn attach_worker(&mut self, worker: Thread) {
        self.worker = Some(worker);
    }

    /// Name of the thread serving this petition.
    #[must_use]
    pub fn worker_name(&self) -> Option<&str> {
        self.worker.as_ref().and_then(Thread::name)
    }

    /// Client id assigned when registered as a state listener.
    #[must_use]
    pub const fn client_id(&self) -> Option<u64> {
        self.client_id
    }

    pub(crate) fn set_client_id(&mut self, client_id: u64) {
        self.client_id = Some(client_id);
    }

    pub(crate) const fn missed_pushes(&self) -> u8 {
        self.missed_pushes
    }

    pub(crate) fn record_push(&mut self, delivered: bool) {
        self.missed_pushes = if delivered {
            0
        } else {
            self.missed_pushes.saturating_add(1)
        };
    }

    pub(crate) fn channel_mut(&mut self) -> &mut ResponseChannel {
        &mut self.channel
    }

    pub(crate) fn into_channel(self) -> ResponseChannel {
        self.channel
    }
}
