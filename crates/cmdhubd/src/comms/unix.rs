//! Unix domain socket backend.

use std::fs;
use std::io::{self, ErrorKind};
use std::os::fd::BorrowedFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cmdhub_config::SocketEndpoint;
use cmdhub_protocol::{ACK, StatusCode, read_text_frame, write_i32};
use tracing::{debug, error, info, warn};

use super::petition::ResponseChannel;
use super::socket::{ChannelListener, ChannelStream, SocketChannel};
use super::{
    COMMS_TARGET, ChannelCore, ChannelError, CommunicationsManager, Delivery, ListenerError,
    Petition, REQUEST_READ_TIMEOUT, StateListeners, WaitStatus, confirm_on_socket, describe,
    open_with_retry, push_on_socket, respond_on_socket, wire_id,
};
use crate::sync::lock;

/// Serves petitions on a Unix socket; response channel `n` listens on
/// `<path>_<n>`.
#[derive(Debug)]
pub struct UnixCommunications {
    endpoint: SocketEndpoint,
    path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    core: ChannelCore,
}

impl UnixCommunications {
    /// Builds the backend for a `unix://` endpoint without binding it.
    pub fn new(endpoint: SocketEndpoint) -> Result<Self, ListenerError> {
        let SocketEndpoint::Unix { path } = &endpoint else {
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
        let accepted = {
            let guard = lock(&self.listener);
            let listener = guard.as_ref().ok_or(ChannelError::NoListener)?;
            listener.accept_stream()
        };
        let mut stream = match accepted {
            Ok(stream) => stream,
            Err(error) => {
                if ChannelError::exhausted_descriptors(&error) {
                    self.inform_state_listeners(ACK);
                }
                return Err(error.into());
            }
        };
        stream.set_blocking(true)?;
        stream.set_read_deadline(Some(REQUEST_READ_TIMEOUT))?;
        let line = read_text_frame(&mut stream)?;

        let channel = self.open_response_channel()?;
        write_i32(&mut stream, wire_id(channel.id())?)?;
        Ok(Petition::new(line, ResponseChannel::Unix(channel)))
    }

    fn open_response_channel(&self) -> Result<SocketChannel<UnixListener>, ChannelError> {
        open_with_retry(
            &self.core,
            |id| {
                let path = self.response_path(id)?;
                remove_stale_socket(&path)?;
                let listener = UnixListener::bind(&path)?;
                Ok(SocketChannel::new(id, listener, Some(path)))
            },
            || {
                self.inform_state_listeners(ACK);
            },
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
}

impl CommunicationsManager for UnixCommunications {
    fn initialize(&self) -> Result<(), ListenerError> {
        let mut guard = lock(&self.listener);
        if guard.take().is_some() {
            remove_socket_file(&self.path);
        }
        self.endpoint.prepare_filesystem()?;
        let listener = bind_unix(&self.path)?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ListenerError::BindUnix {
                path: self.path.display().to_string(),
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
        respond_on_socket(&details, petition.into_channel(), output, status);
    }

    fn get_confirmation(&self, petition: &mut Petition, question: &str) -> bool {
        let details = self.petition_details(petition);
        confirm_on_socket(&details, petition.channel_mut(), question)
    }

    fn inform_state_listener(&self, petition: &mut Petition, message: &str) -> Delivery {
        push_on_socket(petition.channel_mut(), message)
    }

    fn state_listeners(&self) -> &StateListeners {
        self.core.listeners()
    }

    fn stop_waiting(&self) {
        debug!(target: COMMS_TARGET, "stopping the petition wait");
        self.core.readiness().stop();
    }

    fn petition_details(&self, petition: &Petition) -> String {
        describe("unix", petition)
    }
}

impl Drop for UnixCommunications {
    fn drop(&mut self) {
        if lock(&self.listener).take().is_some() {
            remove_socket_file(&self.path);
        }
    }
}

/// Binds `path`, replacing a stale socket left by a dead daemon.
fn bind_unix(path: &Path) -> Result<UnixListener, ListenerError> {
    if path.exists() {
        let metadata = fs::symlink_metadata(path).map_err(|source| ListenerError::Metadata {
            path: path.display().to_string(),
            source,
        })?;
        if !metadata.file_type().is_socket() {
            return Err(ListenerError::WrongFileType {
                path: path.display().to_string(),
                expected: "socket",
            });
        }
        match UnixStream::connect(path) {
            Ok(_stream) => {
                return Err(ListenerError::UnixInUse {
                    path: path.display().to_string(),
                });
            }
            Err(error)
                if matches!(
                    error.kind(),
                    ErrorKind::ConnectionRefused | ErrorKind::NotFound
                ) =>
            {
                fs::remove_file(path).map_err(|source| ListenerError::Cleanup {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            Err(source) => {
                return Err(ListenerError::Probe {
                    path: path.display().to_string(),
                    source,
                });
            }
        }
    }

    UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
        path: path.display().to_string(),
        source,
    })
}

/// Removes a leftover response socket; other file types are left alone.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => fs::remove_file(path),
        Ok(_) => Err(io::Error::from(ErrorKind::AlreadyExists)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

fn remove_socket_file(path: &Path) {
    if let Err(error) = fs::remove_file(path)
        && error.kind() != ErrorKind::NotFound
    {
        warn!(
            target: COMMS_TARGET,
            path = %path.display(),
            %error,
            "failed to remove unix socket file"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use camino::Utf8PathBuf;
    use cmdhub_protocol::{read_i32, read_status, write_frame};

    use super::*;

    fn backend(dir: &tempfile::TempDir) -> UnixCommunications {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("srv")).expect("utf-8 path");
        UnixCommunications::new(SocketEndpoint::unix(path)).expect("backend")
    }

    #[test]
    fn rejects_foreign_endpoints() {
        let outcome = UnixCommunications::new(SocketEndpoint::tcp("127.0.0.1", 1));
        assert!(matches!(outcome, Err(ListenerError::WrongEndpoint { .. })));
    }

    #[test]
    fn refuses_to_replace_a_regular_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(dir.path().join("srv"), b"not a socket").expect("write file");
        let outcome = backend(&dir).initialize();
        assert!(matches!(outcome, Err(ListenerError::WrongFileType { .. })));
    }

    #[test]
    fn replaces_a_stale_socket() {
        let dir = tempfile::tempdir().expect("temp dir");
        drop(UnixListener::bind(dir.path().join("srv")).expect("stale bind"));
        backend(&dir).initialize().expect("initialise over stale socket");
    }

    #[test]
    fn serves_one_petition_end_to_end() {
        let dir = tempfile::tempdir().expect("temp dir");
        let comms = backend(&dir);
        comms.initialize().expect("initialise");
        let srv = dir.path().join("srv");

        let client = thread::spawn(move || {
            let mut stream = UnixStream::connect(&srv).expect("connect");
            write_frame(&mut stream, b"echo hi").expect("request");
            let id = read_i32(&mut stream).expect("id");
            let mut response =
                UnixStream::connect(format!("{}_{id}", srv.display())).expect("response");
            let status = read_status(&mut response).expect("status");
            let mut body = Vec::new();
            response.read_to_end(&mut body).expect("body");
            (id, status, body)
        });

        assert_eq!(comms.wait_for_petition(), WaitStatus::Ready);
        assert!(comms.received_petition());
        let petition = comms.get_petition();
        assert_eq!(petition.line(), "echo hi");
        comms.return_and_close_petition(petition, b"hi\n", StatusCode::OK);

        let (id, status, body) = client.join().expect("client joins");
        assert_eq!(id, 1);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"hi\n");
        assert!(!dir.path().join("srv_1").exists());
    }

    #[test]
    fn truncated_requests_yield_a_failed_petition() {
        let dir = tempfile::tempdir().expect("temp dir");
        let comms = backend(&dir);
        comms.initialize().expect("initialise");

        let mut stream = UnixStream::connect(dir.path().join("srv")).expect("connect");
        stream.write_all(&[9, 0]).expect("partial prefix");
        drop(stream);

        assert_eq!(comms.wait_for_petition(), WaitStatus::Ready);
        assert!(comms.get_petition().is_failed());
    }

    #[test]
    fn dropping_the_backend_removes_its_socket() {
        let dir = tempfile::tempdir().expect("temp dir");
        let comms = backend(&dir);
        comms.initialize().expect("initialise");
        assert!(dir.path().join("srv").exists());
        drop(comms);
        assert!(!dir.path().join("srv").exists());
    }
}
