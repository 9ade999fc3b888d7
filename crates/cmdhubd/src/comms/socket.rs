//! Response channels shared by the socket transports.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

use cmdhub_protocol::{CONFIRM_YES, FrameError, StatusCode, write_frame, write_status};
use tracing::warn;

use super::errors::ChannelError;
use super::readiness::wait_readable;
use super::{
    COMMS_TARGET, Delivery, PUSH_WRITE_TIMEOUT, RESPONSE_ACCEPT_TIMEOUT, RESPONSE_WRITE_TIMEOUT,
    STATE_LISTENER_ACCEPT_TIMEOUT,
};

/// Stream accepted on a response channel.
pub(crate) trait ChannelStream: Read + Write + AsFd + Send {
    fn set_blocking(&self, blocking: bool) -> io::Result<()>;
    fn set_read_deadline(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_deadline(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn shutdown_write(&self) -> io::Result<()>;
}

/// Listener a response channel accepts its single peer on.
pub(crate) trait ChannelListener: AsFd + Send + fmt::Debug {
    type Stream: ChannelStream + fmt::Debug;

    fn accept_stream(&self) -> io::Result<Self::Stream>;
}

macro_rules! socket_channel_impls {
    ($listener:ty, $stream:ty) => {
        impl ChannelStream for $stream {
            fn set_blocking(&self, blocking: bool) -> io::Result<()> {
                <$stream>::set_nonblocking(self, !blocking)
            }

            fn set_read_deadline(&self, timeout: Option<Duration>) -> io::Result<()> {
                <$stream>::set_read_timeout(self, timeout)
            }

            fn set_write_deadline(&self, timeout: Option<Duration>) -> io::Result<()> {
                <$stream>::set_write_timeout(self, timeout)
            }

            fn shutdown_write(&self) -> io::Result<()> {
                match <$stream>::shutdown(self, Shutdown::Write) {
                    Err(error) if error.kind() == ErrorKind::NotConnected => Ok(()),
                    other => other,
                }
            }
        }

        impl ChannelListener for $listener {
            type Stream = $stream;

            fn accept_stream(&self) -> io::Result<Self::Stream> {
                loop {
                    match self.accept() {
                        Ok((stream, _)) => return Ok(stream),
                        Err(error) if error.kind() == ErrorKind::Interrupted => {}
                        Err(error) => return Err(error),
                    }
                }
            }
        }
    };
}

socket_channel_impls!(UnixListener, UnixStream);
socket_channel_impls!(TcpListener, TcpStream);

/// Per-petition listener plus the peer that connected to it.
#[derive(Debug)]
pub(crate) struct SocketChannel<L: ChannelListener> {
    id: u32,
    listener: L,
    stream: Option<L::Stream>,
    path: Option<PathBuf>,
}

impl<L: ChannelListener> SocketChannel<L> {
    /// `path` names a socket file removed when the channel drops.
    pub(crate) fn new(id: u32, listener: L, path: Option<PathBuf>) -> Self {
        Self {
            id,
            listener,
            stream: None,
            path,
        }
    }

    pub(crate) const fn id(&self) -> u32 {
        self.id
    }

    fn connected(&mut self, timeout: Duration) -> Result<&mut L::Stream, ChannelError> {
        if self.stream.is_none() {
            if !wait_readable(self.listener.as_fd(), timeout)? {
                return Err(ChannelError::Timeout);
            }
            let stream = self.listener.accept_stream()?;
            stream.set_blocking(true)?;
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or(ChannelError::Closed)
    }

    /// Writes the final status and output, then closes the write side.
    pub(crate) fn send_response(
        &mut self,
        output: &[u8],
        status: StatusCode,
    ) -> Result<(), ChannelError> {
        let stream = self.connected(RESPONSE_ACCEPT_TIMEOUT)?;
        stream.set_write_deadline(Some(RESPONSE_WRITE_TIMEOUT))?;
        write_status(stream, status)?;
        stream.write_all(output)?;
        stream.flush()?;
        stream.shutdown_write()?;
        Ok(())
    }

    /// Asks the peer `question` and waits up to `timeout` for its one-byte
    /// answer.
    pub(crate) fn confirm(
        &mut self,
        question: &str,
        timeout: Duration,
    ) -> Result<bool, ChannelError> {
        let stream = self.connected(RESPONSE_ACCEPT_TIMEOUT)?;
        stream.set_write_deadline(Some(RESPONSE_WRITE_TIMEOUT))?;
        write_status(stream, StatusCode::REQUEST_CONFIRMATION)?;
        write_frame(stream, question.as_bytes())?;
        stream.set_read_deadline(Some(timeout))?;
        let mut answer = [0_u8; 1];
        loop {
            match stream.read(&mut answer) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(_) => return Ok(answer == [CONFIRM_YES]),
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(ChannelError::Timeout);
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Pushes one message frame to a state listener.
    pub(crate) fn push(&mut self, message: &str) -> Delivery {
        let stream = match self.connected(STATE_LISTENER_ACCEPT_TIMEOUT) {
            Ok(stream) => stream,
            Err(ChannelError::Timeout) => return Delivery::Pending,
            Err(error) => {
                warn!(target: COMMS_TARGET, %error, "state listener channel failed");
                return Delivery::Gone;
            }
        };
        if peer_gone(stream) {
            return Delivery::Gone;
        }
        if stream.set_write_deadline(Some(PUSH_WRITE_TIMEOUT)).is_err() {
            return Delivery::Gone;
        }
        match write_frame(stream, message.as_bytes()) {
            Ok(()) => Delivery::Delivered,
            Err(FrameError::Io(error))
                if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Delivery::Pending
            }
            Err(_) => Delivery::Gone,
        }
    }
}

impl<L: ChannelListener> Drop for SocketChannel<L> {
    fn drop(&mut self) {
        if let Some(path) = self.path.take()
            && let Err(error) = std::fs::remove_file(&path)
            && error.kind() != ErrorKind::NotFound
        {
            warn!(
                target: COMMS_TARGET,
                path = %path.display(),
                %error,
                "failed to remove response socket"
            );
        }
    }
}

/// Probes a listener connection without blocking; end of stream means the
/// peer has gone.
fn peer_gone<S: ChannelStream>(stream: &mut S) -> bool {
    if stream.set_blocking(false).is_err() {
        return true;
    }
    let mut probe = [0_u8; 64];
    let gone = match stream.read(&mut probe) {
        Ok(0) => true,
        Ok(_) => false,
        Err(error) => !matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
    };
    stream.set_blocking(true).is_err() || gone
}
