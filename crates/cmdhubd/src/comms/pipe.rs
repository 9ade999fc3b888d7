//! Named pipe backend.
//!
//! Requests arrive on a FIFO as single atomic writes of
//! `reply_path \0 command`. The daemon answers the petition id on the
//! client's reply FIFO and creates response FIFO `<path><id>`, which the
//! worker writes the status and output to. Pipes are one-way: confirmation
//! prompts answer "no" and state listeners are refused.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use cmdhub_config::SocketEndpoint;
use cmdhub_protocol::{
    MAX_PIPE_REQUEST_BYTES, StatusCode, decode_pipe_request, read_frame, write_i32, write_status,
};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::{debug, error, info, warn};

use super::petition::ResponseChannel;
use super::readiness::wait_readable;
use super::{
    COMMS_TARGET, ChannelCore, ChannelError, CommunicationsManager, Delivery, ListenerError,
    Petition, REQUEST_READ_TIMEOUT, RESPONSE_ACCEPT_TIMEOUT, StateListeners, WaitStatus, describe,
    open_with_retry, wire_id,
};
use crate::sync::lock;

const REPLY_OPEN_TIMEOUT: Duration = Duration::from_secs(1);
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Response FIFO of one petition; removed when dropped.
#[derive(Debug)]
pub(crate) struct PipeChannel {
    id: u32,
    path: PathBuf,
}

impl PipeChannel {
    pub(crate) const fn id(&self) -> u32 {
        self.id
    }

    fn send_response(&self, output: &[u8], status: StatusCode) -> Result<(), ChannelError> {
        let mut writer = open_writer(&self.path, RESPONSE_ACCEPT_TIMEOUT)?;
        write_status(&mut writer, status)?;
        writer.write_all(output)?;
        writer.flush()?;
        Ok(())
    }
}

impl Drop for PipeChannel {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path)
            && error.kind() != ErrorKind::NotFound
        {
            warn!(
                target: COMMS_TARGET,
                path = %self.path.display(),
                %error,
                "failed to remove response pipe"
            );
        }
    }
}

/// Serves petitions on a FIFO.
#[derive(Debug)]
pub struct PipeCommunications {
    endpoint: SocketEndpoint,
    path: PathBuf,
    listener: Mutex<Option<File>>,
    core: ChannelCore,
}

impl PipeCommunications {
    /// Builds the backend for a `pipe://` endpoint without creating it.
    pub fn new(endpoint: SocketEndpoint) -> Result<Self, ListenerError> {
        let SocketEndpoint::Pipe { path } = &endpoint else {
            return Err(ListenerError::WrongEndpoint {
                endpoint: endpoint.to_string(),
            });
        };
        let path = path.as_std_path().to_path_buf();
        Ok(Self {
            endpoint,
            path,
            listener: Mutex::new(None),
            core: ChannelCore::new(i32::MAX.unsigned_abs())?,
        })
    }

    fn accept_petition(&self) -> Result<Petition, ChannelError> {
        let payload = {
            let guard = lock(&self.listener);
            let listener = guard.as_ref().ok_or(ChannelError::NoListener)?;
            let mut reader = DeadlineReader::new(listener, REQUEST_READ_TIMEOUT);
            let payload = read_frame(&mut reader, MAX_PIPE_REQUEST_BYTES - 4);
            if payload.is_err() {
                drain(listener);
            }
            payload?
        };
        let (reply_path, line) = decode_pipe_request(&payload).ok_or(ChannelError::Malformed {
            origin: "named pipe",
        })?;
        let reply_path = PathBuf::from(reply_path);
        if !is_fifo(&reply_path) {
            return Err(ChannelError::Malformed {
                origin: "named pipe reply path",
            });
        }

        let channel = self.open_response_channel()?;
        let mut reply = open_writer(&reply_path, REPLY_OPEN_TIMEOUT)?;
        write_i32(&mut reply, wire_id(channel.id)?)?;
        Ok(Petition::new(line, ResponseChannel::Pipe(channel)))
    }

    fn open_response_channel(&self) -> Result<PipeChannel, ChannelError> {
        open_with_retry(
            &self.core,
            |id| {
                let path = self.response_path(id)?;
                if is_fifo(&path) {
                    fs::remove_file(&path)?;
                }
                mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)?;
                Ok(PipeChannel { id, path })
            },
            || {},
        )
    }

    fn response_path(&self, id: u32) -> io::Result<PathBuf> {
        self.endpoint
            .response_endpoint(id)
            .as_ref()
            .and_then(SocketEndpoint::filesystem_path)
            .map(|path| path.as_std_path().to_path_buf())
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no response path for id"))
    }

    fn remove_listening_pipe(&self) {
        if is_fifo(&self.path)
            && let Err(error) = fs::remove_file(&self.path)
        {
            warn!(
                target: COMMS_TARGET,
                path = %self.path.display(),
                %error,
                "failed to remove listening pipe"
            );
        }
    }
}

impl CommunicationsManager for PipeCommunications {
    fn initialize(&self) -> Result<(), ListenerError> {
        let mut guard = lock(&self.listener);
        guard.take();
        self.endpoint.prepare_filesystem()?;
        let display = self.path.display().to_string();

        match fs::symlink_metadata(&self.path) {
            Ok(metadata) if metadata.file_type().is_fifo() => {
                fs::remove_file(&self.path).map_err(|source| ListenerError::Cleanup {
                    path: display.clone(),
                    source,
                })?;
            }
            Ok(_) => {
                return Err(ListenerError::WrongFileType {
                    path: display,
                    expected: "named pipe",
                });
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ListenerError::Metadata {
                    path: display,
                    source,
                });
            }
        }

        mkfifo(&self.path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|source| {
            ListenerError::CreatePipe {
                path: display.clone(),
                source,
            }
        })?;
        // Opening read-write keeps a writer alive, so the FIFO never reports
        // end of stream between clients.
        let listener = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|source| ListenerError::OpenPipe {
                path: display,
                source,
            })?;
        info!(target: COMMS_TARGET, endpoint = %self.endpoint, "listening for petitions");
        *guard = Some(listener);
        Ok(())
    }

    fn wait_for_petition_or_input(&self, input: Option<BorrowedFd<'_>>) -> WaitStatus {
        self.core
            .wait_on(&self.listener, input, || self.initialize())
    }

    fn received_input(&self) -> bool {
        self.core.readiness().received_input()
    }

    fn received_petition(&self) -> bool {
        self.core.readiness().received_petition()
    }

    fn get_petition(&self) -> Petition {
        self.accept_petition().unwrap_or_else(|error| {
            error!(target: COMMS_TARGET, %error, "failed to accept petition");
            Petition::failed()
        })
    }

    fn return_and_close_petition(&self, petition: Petition, output: &[u8], status: StatusCode) {
        let details = self.petition_details(&petition);
        let ResponseChannel::Pipe(channel) = petition.into_channel() else {
            debug!(target: COMMS_TARGET, petition = %details, "petition has no response pipe");
            return;
        };
        match channel.send_response(output, status) {
            Ok(()) => debug!(
                target: COMMS_TARGET,
                petition = %details,
                %status,
                bytes = output.len(),
                "response delivered"
            ),
            Err(error) => warn!(
                target: COMMS_TARGET,
                petition = %details,
                %status,
                %error,
                "failed to deliver response"
            ),
        }
    }

    fn get_confirmation(&self, petition: &mut Petition, question: &str) -> bool {
        debug!(
            target: COMMS_TARGET,
            petition = %self.petition_details(petition),
            question,
            "named pipes cannot carry confirmations; assuming no"
        );
        false
    }

    fn inform_state_listener(&self, _petition: &mut Petition, _message: &str) -> Delivery {
        Delivery::Unsupported
    }

    fn supports_state_listeners(&self) -> bool {
        false
    }

    fn state_listeners(&self) -> &StateListeners {
        self.core.listeners()
    }

    fn stop_waiting(&self) {
        debug!(target: COMMS_TARGET, "stopping the petition wait");
        self.core.readiness().stop();
    }

    fn petition_details(&self, petition: &Petition) -> String {
        describe("pipe", petition)
    }
}

impl Drop for PipeCommunications {
    fn drop(&mut self) {
        if lock(&self.listener).take().is_some() {
            self.remove_listening_pipe();
        }
    }
}

/// Reads a non-blocking descriptor, polling until a deadline.
struct DeadlineReader<'a> {
    file: &'a File,
    deadline: Instant,
}

impl<'a> DeadlineReader<'a> {
    fn new(file: &'a File, timeout: Duration) -> Self {
        Self {
            file,
            deadline: Instant::now() + timeout,
        }
    }
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(buf) {
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    let remaining = self.deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || !wait_readable(self.file.as_fd(), remaining)? {
                        return Err(io::Error::from(ErrorKind::TimedOut));
                    }
                }
                other => return other,
            }
        }
    }
}

/// Discards whatever is queued in the listening FIFO after a bad request.
fn drain(mut listener: &File) {
    let mut scratch = [0_u8; MAX_PIPE_REQUEST_BYTES];
    while matches!(listener.read(&mut scratch), Ok(read) if read > 0) {}
}

fn is_fifo(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|metadata| metadata.file_type().is_fifo())
}

/// Opens `path` for writing once a reader has it open, then switches the
/// descriptor to blocking writes.
fn open_writer(path: &Path, timeout: Duration) -> Result<File, ChannelError> {
    let deadline = Instant::now() + timeout;
    let file = loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => break file,
            Err(error) if error.raw_os_error() == Some(libc::ENXIO) => {
                if Instant::now() >= deadline {
                    return Err(ChannelError::Timeout);
                }
                thread::sleep(OPEN_POLL_INTERVAL);
            }
            Err(error) => return Err(error.into()),
        }
    };
    let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let blocking = OFlag::from_bits_truncate(flags) - OFlag::O_NONBLOCK;
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(blocking)).map_err(io::Error::from)?;
    Ok(file)
}
