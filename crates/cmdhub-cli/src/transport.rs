//! Client side of the daemon transports.
//!
//! Socket endpoints take the request on one connection and answer on a
//! second one named after the petition id. Pipe endpoints hand the daemon a
//! private reply FIFO for the id, then read the response FIFO the daemon
//! creates for it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use cmdhub_config::SocketEndpoint;
use cmdhub_protocol::{
    ACK, CONFIRM_NO, CONFIRM_YES, FrameError, MAX_PIPE_REQUEST_BYTES, REGISTER_STATE_LISTENER,
    StatusCode, encode_frame, encode_pipe_request, read_i32, read_status, read_text_frame,
    write_frame,
};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use socket2::{Domain, SockAddr, Socket, Type};

use crate::AppError;

/// Timeout for connecting to the daemon and for its petition id.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

static REPLY_COUNTER: AtomicU32 = AtomicU32::new(0);

pub(crate) enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Unix(stream) => stream.flush(),
        }
    }
}

impl Connection {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
            Self::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }
}

/// Runs `command` on the daemon behind `endpoint`.
///
/// Output is copied into `output`; confirmation prompts are answered by
/// `confirm`. Returns the command's status.
pub fn execute(
    endpoint: &SocketEndpoint,
    command: &str,
    confirm: &mut dyn FnMut(&str) -> bool,
    output: &mut dyn Write,
) -> Result<StatusCode, AppError> {
    if let SocketEndpoint::Pipe { path } = endpoint {
        return execute_over_pipe(endpoint, path.as_std_path(), command, output);
    }
    let id = submit(endpoint, command)?;
    let mut response = open_response(endpoint, id)?;
    read_response(&mut response, confirm, output)
}

/// Registers a state listener and hands every push to `on_push` until the
/// daemon closes the channel or `on_push` returns `false`.
///
/// Liveness probes are not forwarded.
pub fn listen(
    endpoint: &SocketEndpoint,
    on_push: &mut dyn FnMut(&str) -> bool,
) -> Result<(), AppError> {
    if matches!(endpoint, SocketEndpoint::Pipe { .. }) {
        return Err(AppError::ListenUnsupported {
            endpoint: endpoint.to_string(),
        });
    }
    let id = submit(endpoint, REGISTER_STATE_LISTENER)?;
    let mut channel = open_response(endpoint, id)?;
    loop {
        match read_text_frame(&mut channel) {
            Ok(message) if message == ACK => {}
            Ok(message) => {
                if !on_push(&message) {
                    return Ok(());
                }
            }
            Err(error) if error.is_end_of_stream() => return Ok(()),
            Err(error) => return Err(AppError::ReadResponse(error)),
        }
    }
}

/// Sends a request frame and returns the petition id.
fn submit(endpoint: &SocketEndpoint, command: &str) -> Result<i32, AppError> {
    let mut connection = connect(endpoint)?;
    write_frame(&mut connection, command.as_bytes()).map_err(|error| match error {
        FrameError::Io(source) => AppError::SendRequest(source),
        other => AppError::EncodeRequest(other),
    })?;
    connection
        .set_read_timeout(Some(CONNECTION_TIMEOUT))
        .map_err(AppError::SendRequest)?;
    read_i32(&mut connection).map_err(AppError::ReadResponse)
}

fn open_response(endpoint: &SocketEndpoint, id: i32) -> Result<Connection, AppError> {
    let response = u32::try_from(id)
        .ok()
        .and_then(|id| endpoint.response_endpoint(id))
        .ok_or(AppError::InvalidId { id })?;
    connect(&response)
}

/// Reads status and output, answering confirmation prompts on the way.
fn read_response<S: Read + Write>(
    stream: &mut S,
    confirm: &mut dyn FnMut(&str) -> bool,
    output: &mut dyn Write,
) -> Result<StatusCode, AppError> {
    loop {
        let status = read_status(stream).map_err(AppError::ReadResponse)?;
        if status != StatusCode::REQUEST_CONFIRMATION {
            io::copy(stream, output).map_err(AppError::ForwardResponse)?;
            output.flush().map_err(AppError::ForwardResponse)?;
            return Ok(status);
        }
        let question = read_text_frame(stream).map_err(AppError::ReadResponse)?;
        let answer = if confirm(&question) {
            CONFIRM_YES
        } else {
            CONFIRM_NO
        };
        stream.write_all(&[answer]).map_err(AppError::SendRequest)?;
    }
}

pub(crate) fn connect(endpoint: &SocketEndpoint) -> Result<Connection, AppError> {
    let endpoint_display = endpoint.to_string();
    match endpoint {
        SocketEndpoint::Tcp { host, port } => {
            let address = resolve_tcp_address(host, *port).map_err(|source| AppError::Resolve {
                endpoint: endpoint_display.clone(),
                source,
            })?;
            TcpStream::connect_timeout(&address, CONNECTION_TIMEOUT)
                .map(Connection::Tcp)
                .map_err(|source| AppError::Connect {
                    endpoint: endpoint_display,
                    source,
                })
        }
        SocketEndpoint::Unix { path } => {
            connect_unix(path.as_str()).map_err(|source| AppError::Connect {
                endpoint: endpoint_display,
                source,
            })
        }
        SocketEndpoint::Pipe { .. } => Err(AppError::Connect {
            endpoint: endpoint_display,
            source: io::Error::new(ErrorKind::Unsupported, "named pipes are not sockets"),
        }),
    }
}

fn resolve_tcp_address(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .find(|addr| matches!(addr, SocketAddr::V4(_) | SocketAddr::V6(_)))
        .ok_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "no resolved addresses"))
}

fn connect_unix(path: &str) -> io::Result<Connection> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let address = SockAddr::unix(path)?;
    socket.connect_timeout(&address, CONNECTION_TIMEOUT)?;
    let stream = UnixStream::from(std::os::fd::OwnedFd::from(socket));
    Ok(Connection::Unix(stream))
}

fn execute_over_pipe(
    endpoint: &SocketEndpoint,
    path: &Path,
    command: &str,
    output: &mut dyn Write,
) -> Result<StatusCode, AppError> {
    let reply = ReplyPipe::create(path)?;
    let payload = encode_frame(&encode_pipe_request(&reply.display(), command));
    if payload.len() > MAX_PIPE_REQUEST_BYTES {
        return Err(AppError::RequestTooLarge {
            size: payload.len(),
            limit: MAX_PIPE_REQUEST_BYTES,
        });
    }

    let mut request = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| AppError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;
    // One write keeps the request atomic against concurrent clients.
    request.write_all(&payload).map_err(AppError::SendRequest)?;
    drop(request);

    let id = reply.read_id()?;
    let response_path = u32::try_from(id)
        .ok()
        .and_then(|id| endpoint.response_endpoint(id))
        .and_then(|response| response.filesystem_path().map(|path| path.as_std_path().to_path_buf()))
        .ok_or(AppError::InvalidId { id })?;

    let mut response = File::open(&response_path).map_err(|source| AppError::Connect {
        endpoint: response_path.display().to_string(),
        source,
    })?;
    let status = read_status(&mut response).map_err(AppError::ReadResponse)?;
    io::copy(&mut response, output).map_err(AppError::ForwardResponse)?;
    output.flush().map_err(AppError::ForwardResponse)?;
    Ok(status)
}

/// Private FIFO the daemon writes the petition id to; removed when dropped.
struct ReplyPipe {
    path: PathBuf,
    reader: File,
}

impl ReplyPipe {
    fn create(listening: &Path) -> Result<Self, AppError> {
        let serial = REPLY_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = PathBuf::from(format!(
            "{}.reply.{}.{serial}",
            listening.display(),
            std::process::id()
        ));
        let failed = |source: io::Error| AppError::ReplyPipe {
            path: path.display().to_string(),
            source,
        };
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| failed(errno.into()))?;
        // Non-blocking, so the open succeeds before the daemon connects.
        let reader = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
        {
            Ok(reader) => reader,
            Err(source) => {
                let _ = fs::remove_file(&path);
                return Err(failed(source));
            }
        };
        Ok(Self { path, reader })
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }

    fn read_id(&self) -> Result<i32, AppError> {
        let millis = u16::try_from(CONNECTION_TIMEOUT.as_millis()).unwrap_or(u16::MAX);
        let timeout = PollTimeout::from(millis);
        let mut fds = [PollFd::new(self.reader.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, timeout).map_err(|errno| AppError::SendRequest(errno.into()))?;
        if ready == 0 {
            return Err(AppError::Timeout {
                seconds: CONNECTION_TIMEOUT.as_secs(),
            });
        }

        let raw = self.reader.as_raw_fd();
        let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(|errno| AppError::SendRequest(errno.into()))?;
        let blocking = OFlag::from_bits_truncate(flags) - OFlag::O_NONBLOCK;
        fcntl(raw, FcntlArg::F_SETFL(blocking)).map_err(|errno| AppError::SendRequest(errno.into()))?;
        read_i32(&mut &self.reader).map_err(AppError::ReadResponse)
    }
}

impl Drop for ReplyPipe {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use cmdhub_protocol::{encode_frame, write_status};
    use rstest::rstest;

    use super::*;

    /// Scripted daemon side of a response channel.
    struct Scripted {
        incoming: Cursor<Vec<u8>>,
        answers: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.answers.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[rstest]
    #[case(true, CONFIRM_YES)]
    #[case(false, CONFIRM_NO)]
    fn confirmations_are_answered_before_the_output(#[case] accept: bool, #[case] byte: u8) {
        let mut wire = Vec::new();
        write_status(&mut wire, StatusCode::REQUEST_CONFIRMATION).expect("status");
        wire.extend_from_slice(&encode_frame(b"Really?"));
        write_status(&mut wire, StatusCode::OK).expect("status");
        wire.extend_from_slice(b"done\n");
        let mut stream = Scripted {
            incoming: Cursor::new(wire),
            answers: Vec::new(),
        };

        let mut asked = Vec::new();
        let mut output = Vec::new();
        let status = read_response(
            &mut stream,
            &mut |question: &str| {
                asked.push(question.to_owned());
                accept
            },
            &mut output,
        )
        .expect("response");

        assert_eq!(status, StatusCode::OK);
        assert_eq!(asked, ["Really?"]);
        assert_eq!(stream.answers, [byte]);
        assert_eq!(output, b"done\n");
    }

    #[rstest]
    fn a_missing_status_is_an_error() {
        let mut stream = Scripted {
            incoming: Cursor::new(vec![1, 2]),
            answers: Vec::new(),
        };
        let outcome = read_response(&mut stream, &mut |_: &str| false, &mut Vec::new());
        assert!(matches!(outcome, Err(AppError::ReadResponse(_))));
    }

    #[rstest]
    fn pipes_cannot_listen() {
        let endpoint = SocketEndpoint::pipe("/tmp/cmdhub-test/pipe");
        let outcome = listen(&endpoint, &mut |_: &str| true);
        assert!(matches!(outcome, Err(AppError::ListenUnsupported { .. })));
    }

    #[rstest]
    fn oversized_pipe_requests_are_refused_locally() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("pipe");
        let endpoint = SocketEndpoint::pipe(path.to_str().expect("utf-8 path"));
        let command = "x".repeat(MAX_PIPE_REQUEST_BYTES);

        let outcome = execute(&endpoint, &command, &mut |_: &str| false, &mut Vec::new());
        assert!(matches!(outcome, Err(AppError::RequestTooLarge { .. })));
        let leftovers: Vec<_> = fs::read_dir(dir.path()).expect("read dir").collect();
        assert!(leftovers.is_empty(), "reply pipe removed");
    }
}
