//! Loopback TCP backend.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::BorrowedFd;
use std::sync::Mutex;

use cmdhub_config::SocketEndpoint;
use cmdhub_protocol::{ACK, StatusCode, read_text_frame, write_i32};
use tracing::{debug, error, info};

use super::petition::ResponseChannel;
use super::socket::{ChannelListener, ChannelStream, SocketChannel};
use super::{
    COMMS_TARGET, ChannelCore, ChannelError, CommunicationsManager, Delivery, ListenerError,
    Petition, REQUEST_READ_TIMEOUT, StateListeners, WaitStatus, confirm_on_socket, describe,
    open_with_retry, push_on_socket, respond_on_socket, wire_id,
};
use crate::sync::lock;

/// Serves petitions on `host:port`; response channel `n` listens on port
/// `port + n` of the same address.
#[derive(Debug)]
pub struct TcpCommunications {
    endpoint: SocketEndpoint,
    host: String,
    port: u16,
    listener: Mutex<Option<TcpListener>>,
    /// Bound address, kept apart from `listener`, which waits hold.
    bound: Mutex<Option<SocketAddr>>,
    core: ChannelCore,
}

impl TcpCommunications {
    /// Builds the backend for a `tcp://` endpoint without binding it.
    pub fn new(endpoint: SocketEndpoint) -> Result<Self, ListenerError> {
        let SocketEndpoint::Tcp { host, port } = &endpoint else {
            return Err(ListenerError::WrongEndpoint {
                endpoint: endpoint.to_string(),
            });
        };
        let (host, port) = (host.clone(), *port);
        Ok(Self {
            core: ChannelCore::new(u32::from(u16::MAX - port))?,
            endpoint,
            host,
            port,
            listener: Mutex::new(None),
            bound: Mutex::new(None),
        })
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.bound)
    }

    fn accept_petition(&self) -> Result<Petition, ChannelError> {
        let (accepted, base) = {
            let guard = lock(&self.listener);
            let listener = guard.as_ref().ok_or(ChannelError::NoListener)?;
            (listener.accept_stream(), listener.local_addr()?)
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

        let channel = self.open_response_channel(base)?;
        write_i32(&mut stream, wire_id(channel.id())?)?;
        Ok(Petition::new(line, ResponseChannel::Tcp(channel)))
    }

    fn open_response_channel(
        &self,
        base: SocketAddr,
    ) -> Result<SocketChannel<TcpListener>, ChannelError> {
        let bound = SocketEndpoint::tcp(base.ip().to_string(), base.port());
        open_with_retry(
            &self.core,
            |id| {
                let Some(SocketEndpoint::Tcp { port, .. }) = bound.response_endpoint(id) else {
                    return Err(io::Error::new(
                        ErrorKind::InvalidInput,
                        "response port out of range",
                    ));
                };
                let listener = TcpListener::bind(SocketAddr::new(base.ip(), port))?;
                Ok(SocketChannel::new(id, listener, None))
            },
            || {
                self.inform_state_listeners(ACK);
            },
        )
    }
}

impl CommunicationsManager for TcpCommunications {
    fn initialize(&self) -> Result<(), ListenerError> {
        let mut guard = lock(&self.listener);
        guard.take();
        let listener = bind_tcp(&self.host, self.port)?;
        let addr = listener.local_addr().ok();
        let base = addr.map_or(self.port, |addr| addr.port());
        self.core.set_max_id(u32::from(u16::MAX - base));
        info!(
            target: COMMS_TARGET,
            endpoint = %self.endpoint,
            addr = ?addr,
            "listening for petitions"
        );
        *lock(&self.bound) = addr;
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
        describe("tcp", petition)
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<TcpListener, ListenerError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?;
    let addr = addrs.next().ok_or_else(|| ListenerError::ResolveEmpty {
        host: host.to_string(),
        port,
    })?;
    let listener =
        TcpListener::bind(addr).map_err(|source| ListenerError::BindTcp { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| ListenerError::BindTcp { addr, source })?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::{Arc, mpsc};
    use std::thread;
    use std::time::Duration;

    use cmdhub_protocol::{read_i32, read_status, write_frame};

    use super::*;

    #[test]
    fn rejects_foreign_endpoints() {
        let outcome = TcpCommunications::new(SocketEndpoint::pipe("/tmp/cmdhub/pipe"));
        assert!(matches!(outcome, Err(ListenerError::WrongEndpoint { .. })));
    }

    #[test]
    fn responses_use_the_offset_port() {
        let comms = TcpCommunications::new(SocketEndpoint::tcp("127.0.0.1", 0)).expect("backend");
        comms.initialize().expect("initialise");
        let addr = comms.local_addr().expect("bound address");

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            write_frame(&mut stream, b"version").expect("request");
            let id = read_i32(&mut stream).expect("id");
            let port = addr.port() + u16::try_from(id).expect("small id");
            let mut response = TcpStream::connect((addr.ip(), port)).expect("response");
            let status = read_status(&mut response).expect("status");
            let mut body = Vec::new();
            response.read_to_end(&mut body).expect("body");
            (status, body)
        });

        assert_eq!(comms.wait_for_petition(), WaitStatus::Ready);
        let petition = comms.get_petition();
        assert_eq!(petition.line(), "version");
        comms.return_and_close_petition(petition, b"1.0\n", StatusCode::OK);

        let (status, body) = client.join().expect("client joins");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"1.0\n");
    }

    #[test]
    fn ids_wrap_inside_the_range_of_the_bound_port() {
        let comms = TcpCommunications::new(SocketEndpoint::tcp("127.0.0.1", 0)).expect("backend");
        comms.initialize().expect("initialise");
        let base = comms.local_addr().expect("bound address").port();
        let limit = u32::from(u16::MAX - base);
        assert_eq!(comms.core.max_id(), limit);

        let bound = SocketEndpoint::tcp("127.0.0.1", base);
        for _ in 0..limit {
            let id = comms.core.next_id();
            assert!(bound.response_endpoint(id).is_some(), "id {id} leaves the port range");
        }
        assert_eq!(comms.core.next_id(), 1);
    }

    #[test]
    fn the_bound_address_is_readable_during_a_wait() {
        let comms = Arc::new(
            TcpCommunications::new(SocketEndpoint::tcp("127.0.0.1", 0)).expect("backend"),
        );
        comms.initialize().expect("initialise");
        let waiter = {
            let comms = Arc::clone(&comms);
            thread::spawn(move || comms.wait_for_petition())
        };
        thread::sleep(Duration::from_millis(50));

        let (sender, receiver) = mpsc::channel();
        let reader = {
            let comms = Arc::clone(&comms);
            thread::spawn(move || {
                let _ = sender.send(comms.local_addr());
            })
        };
        let addr = receiver.recv_timeout(Duration::from_secs(2));

        comms.stop_waiting();
        assert_eq!(waiter.join().expect("waiter joins"), WaitStatus::Stopped);
        reader.join().expect("reader joins");
        assert!(matches!(addr, Ok(Some(_))), "local_addr blocked behind the wait");
    }
}
