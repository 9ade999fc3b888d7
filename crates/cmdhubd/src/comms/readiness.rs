//! Readiness multiplexing over the listening channel, the interactive input
//! and an internal waker.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::warn;

use super::COMMS_TARGET;

/// Why a readiness wait ended without activity.
#[derive(Debug)]
pub(crate) enum WaitError {
    /// [`Readiness::stop`] was called.
    Stopped,
    /// The listening descriptor is unusable.
    Broken(String),
}

/// Tracks which descriptor fired and owns the waker pair.
#[derive(Debug)]
pub(crate) struct Readiness {
    wake_rx: UnixStream,
    wake_tx: UnixStream,
    stopped: AtomicBool,
    petition: AtomicBool,
    input: AtomicBool,
}

impl Readiness {
    pub(crate) fn new() -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            wake_rx,
            wake_tx,
            stopped: AtomicBool::new(false),
            petition: AtomicBool::new(false),
            input: AtomicBool::new(false),
        })
    }

    /// Blocks until `listener` or `input` is readable.
    ///
    /// Interrupted polls are retried. Errors on `input` count as readiness
    /// so the reader observes them; errors on `listener` end the wait.
    pub(crate) fn wait(
        &self,
        listener: BorrowedFd<'_>,
        input: Option<BorrowedFd<'_>>,
    ) -> Result<(), WaitError> {
        self.petition.store(false, Ordering::SeqCst);
        self.input.store(false, Ordering::SeqCst);
        let readable = PollFlags::POLLIN;
        let failed = PollFlags::POLLERR | PollFlags::POLLNVAL;

        loop {
            if self.is_stopped() {
                return Err(WaitError::Stopped);
            }

            let mut fds = vec![
                PollFd::new(self.wake_rx.as_fd(), readable),
                PollFd::new(listener, readable),
            ];
            if let Some(input) = input {
                fds.push(PollFd::new(input, readable));
            }

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(WaitError::Broken(errno.to_string())),
            }

            let events = |index: usize| {
                fds.get(index)
                    .and_then(|fd| fd.revents())
                    .unwrap_or_else(PollFlags::empty)
            };
            if events(0).intersects(readable) {
                self.drain_waker();
            }
            if self.is_stopped() {
                return Err(WaitError::Stopped);
            }

            let listener_events = events(1);
            if listener_events.intersects(failed) {
                return Err(WaitError::Broken(format!(
                    "listening channel reported {listener_events:?}"
                )));
            }
            let petition = listener_events.intersects(readable);
            let input_ready = input.is_some()
                && events(2).intersects(readable | PollFlags::POLLHUP | failed);

            if petition || input_ready {
                self.petition.store(petition, Ordering::SeqCst);
                self.input.store(input_ready, Ordering::SeqCst);
                return Ok(());
            }
        }
    }

    /// Wakes any thread parked in [`Self::wait`] and keeps later waits from
    /// blocking.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(error) = (&self.wake_tx).write(&[1])
            && error.kind() != ErrorKind::WouldBlock
        {
            warn!(target: COMMS_TARGET, %error, "failed to signal the readiness waker");
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn received_petition(&self) -> bool {
        self.petition.load(Ordering::SeqCst)
    }

    pub(crate) fn received_input(&self) -> bool {
        self.input.load(Ordering::SeqCst)
    }

    fn drain_waker(&self) {
        let mut scratch = [0_u8; 64];
        while matches!((&self.wake_rx).read(&mut scratch), Ok(read) if read > 0) {}
    }
}

/// Waits up to `timeout` for `fd` to become readable.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) if remaining.is_zero() || Instant::now() >= deadline => return Ok(false),
            Ok(0) => {}
            Ok(_) => {
                let events = fds
                    .first()
                    .and_then(|fd| fd.revents())
                    .unwrap_or_else(PollFlags::empty);
                return Ok(events.intersects(
                    PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                ));
            }
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn stop_unblocks_a_parked_wait() {
        let dir = tempfile::tempdir().expect("temp dir");
        let listener = UnixListener::bind(dir.path().join("srv")).expect("bind");
        let readiness = Arc::new(Readiness::new().expect("readiness"));

        let stopper = {
            let readiness = Arc::clone(&readiness);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                readiness.stop();
            })
        };

        let outcome = readiness.wait(listener.as_fd(), None);
        assert!(matches!(outcome, Err(WaitError::Stopped)));
        stopper.join().expect("stopper joins");
        assert!(matches!(
            readiness.wait(listener.as_fd(), None),
            Err(WaitError::Stopped)
        ));
    }

    #[test]
    fn pending_connections_mark_a_petition() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("srv");
        let listener = UnixListener::bind(&path).expect("bind");
        let _client = UnixStream::connect(&path).expect("connect");
        let readiness = Readiness::new().expect("readiness");

        readiness.wait(listener.as_fd(), None).expect("wait");
        assert!(readiness.received_petition());
        assert!(!readiness.received_input());
    }

    #[test]
    fn input_readiness_is_reported_separately() {
        let dir = tempfile::tempdir().expect("temp dir");
        let listener = UnixListener::bind(dir.path().join("srv")).expect("bind");
        let (input, mut feeder) = UnixStream::pair().expect("input pair");
        feeder.write_all(b"help\n").expect("feed input");
        let readiness = Readiness::new().expect("readiness");

        readiness
            .wait(listener.as_fd(), Some(input.as_fd()))
            .expect("wait");
        assert!(readiness.received_input());
        assert!(!readiness.received_petition());
    }

    #[test]
    fn wait_readable_times_out() {
        let (quiet, _peer) = UnixStream::pair().expect("pair");
        let started = Instant::now();
        let ready = wait_readable(quiet.as_fd(), Duration::from_millis(40)).expect("poll");
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
