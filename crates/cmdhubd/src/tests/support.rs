//! Shared fixtures: a scripted transport, a test command set and a server
//! running on a background thread.

use std::collections::VecDeque;
use std::io::Write;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cmdhub_config::SocketEndpoint;
use cmdhub_protocol::StatusCode;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tempfile::TempDir;

use crate::comms::{
    self, CommunicationsManager, Delivery, ListenerError, Petition, StateListeners, WaitStatus,
};
use crate::context::ExecutionContext;
use crate::dispatch::{Server, ServerSettings};
use crate::executor::{BuiltinExecutor, CommandError, CommandExecutor};
use crate::process::StopHandle;
use crate::sync::lock;

pub(crate) const PATIENCE: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn is_readable(fd: BorrowedFd<'_>) -> bool {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    matches!(poll(&mut fds, PollTimeout::ZERO), Ok(ready) if ready > 0)
}

/// One answered petition as seen by [`ScriptedComms`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Answer {
    pub(crate) line: String,
    pub(crate) output: String,
    pub(crate) status: StatusCode,
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<String>,
    answers: Vec<Answer>,
    input_ready: bool,
    stopped: bool,
}

/// Transport whose petitions come from a queue and whose answers are
/// recorded, so dispatch can be observed without sockets.
#[derive(Debug)]
pub(crate) struct ScriptedComms {
    script: Mutex<Script>,
    changed: Condvar,
    listeners: StateListeners,
}

impl ScriptedComms {
    pub(crate) fn with_petitions<I, S>(lines: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = Script {
            queue: lines.into_iter().map(Into::into).collect(),
            ..Script::default()
        };
        Arc::new(Self {
            script: Mutex::new(script),
            changed: Condvar::new(),
            listeners: StateListeners::new(),
        })
    }

    /// Waits until `count` petitions have been answered.
    pub(crate) fn wait_for_answers(&self, count: usize) -> Vec<Answer> {
        let deadline = Instant::now() + PATIENCE;
        let mut script = lock(&self.script);
        while script.answers.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(!remaining.is_zero(), "only {} answers arrived", script.answers.len());
            script = self
                .changed
                .wait_timeout(script, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        script.answers.clone()
    }

    pub(crate) fn answers(&self) -> Vec<Answer> {
        lock(&self.script).answers.clone()
    }
}

impl CommunicationsManager for ScriptedComms {
    fn initialize(&self) -> Result<(), ListenerError> {
        Ok(())
    }

    fn wait_for_petition_or_input(&self, input: Option<BorrowedFd<'_>>) -> WaitStatus {
        let mut script = lock(&self.script);
        loop {
            if script.stopped {
                return WaitStatus::Stopped;
            }
            script.input_ready = input.is_some_and(is_readable);
            if script.input_ready || !script.queue.is_empty() {
                return WaitStatus::Ready;
            }
            script = self
                .changed
                .wait_timeout(script, POLL_INTERVAL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn received_input(&self) -> bool {
        lock(&self.script).input_ready
    }

    fn received_petition(&self) -> bool {
        !lock(&self.script).queue.is_empty()
    }

    fn get_petition(&self) -> Petition {
        lock(&self.script)
            .queue
            .pop_front()
            .map_or_else(Petition::failed, Petition::detached)
    }

    fn return_and_close_petition(&self, petition: Petition, output: &[u8], status: StatusCode) {
        lock(&self.script).answers.push(Answer {
            line: petition.line().to_owned(),
            output: String::from_utf8_lossy(output).into_owned(),
            status,
        });
        self.changed.notify_all();
    }

    fn get_confirmation(&self, _petition: &mut Petition, _question: &str) -> bool {
        false
    }

    fn inform_state_listener(&self, _petition: &mut Petition, _message: &str) -> Delivery {
        Delivery::Delivered
    }

    fn state_listeners(&self) -> &StateListeners {
        &self.listeners
    }

    fn stop_waiting(&self) {
        lock(&self.script).stopped = true;
        self.changed.notify_all();
    }

    fn petition_details(&self, petition: &Petition) -> String {
        format!("scripted: {}", petition.line())
    }
}

/// Built-in commands plus a few that exercise the dispatcher.
///
/// * `silent` writes nothing.
/// * `bytes <n>` writes `n` bytes.
/// * `slow <label>` writes its label line by line while sleeping.
/// * `boom` panics.
/// * `hold <label>` blocks until [`TestExecutor::release_held`], then
///   writes its label.
/// * `complain <text>` logs `text` at warn and error level.
#[derive(Debug, Default)]
pub(crate) struct TestExecutor {
    running: AtomicUsize,
    peak: AtomicUsize,
    holding: AtomicUsize,
    released: Mutex<bool>,
    release: Condvar,
}

impl TestExecutor {
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Commands currently blocked in `hold`.
    pub(crate) fn holding(&self) -> usize {
        self.holding.load(Ordering::SeqCst)
    }

    pub(crate) fn release_held(&self) {
        *lock(&self.released) = true;
        self.release.notify_all();
    }

    fn hold(&self, label: &str, context: &mut ExecutionContext<'_>) -> Result<(), CommandError> {
        self.holding.fetch_add(1, Ordering::SeqCst);
        let mut released = lock(&self.released);
        while !*released {
            released = self
                .release
                .wait(released)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        drop(released);
        self.holding.fetch_sub(1, Ordering::SeqCst);
        writeln!(context, "{label}")?;
        Ok(())
    }

    fn slow(&self, label: &str, context: &mut ExecutionContext<'_>) -> Result<(), CommandError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        for _ in 0..5 {
            writeln!(context, "{label}")?;
            thread::sleep(Duration::from_millis(10));
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

impl CommandExecutor for TestExecutor {
    fn execute(
        &self,
        command: &str,
        context: &mut ExecutionContext<'_>,
    ) -> Result<(), CommandError> {
        let (word, rest) = command.split_once(' ').unwrap_or((command, ""));
        match word {
            "silent" => Ok(()),
            "bytes" => {
                let count: usize = rest.parse().map_err(|_| CommandError::Usage("bytes <n>"))?;
                let body: Vec<u8> = (0..count).map(|index| b'a' + (index % 26) as u8).collect();
                context.write_all(&body)?;
                Ok(())
            }
            "slow" => self.slow(rest, context),
            "boom" => panic!("boom requested"),
            "hold" => self.hold(rest, context),
            "complain" => {
                tracing::warn!("{rest}");
                tracing::error!("{rest}");
                Ok(())
            }
            _ => BuiltinExecutor.execute(command, context),
        }
    }
}

/// A [`Server`] running on its own thread.
pub(crate) struct RunningServer {
    stop: StopHandle,
    thread: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub(crate) fn start(
        comms: Arc<dyn CommunicationsManager>,
        executor: Arc<dyn CommandExecutor>,
        max_parallel_petitions: usize,
    ) -> Self {
        let settings = ServerSettings {
            max_parallel_petitions,
            secondary_handles: 2,
        };
        let mut server = Server::new(comms, executor, settings);
        let stop = server.stop_handle();
        let thread = thread::Builder::new()
            .name(String::from("test-server"))
            .spawn(move || server.run())
            .expect("spawn server thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Requests a stop without waiting for the loop to end.
    pub(crate) fn request_stop(&self) {
        self.stop.stop();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the loop to end on its own.
    pub(crate) fn wait_until_finished(&self) -> bool {
        let deadline = Instant::now() + PATIENCE;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    pub(crate) fn stop(mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("server thread");
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Which transport a test runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Unix,
    Tcp,
    Pipe,
}

/// A real backend serving from a temporary directory.
pub(crate) struct LiveDaemon {
    pub(crate) server: RunningServer,
    pub(crate) comms: Arc<dyn CommunicationsManager>,
    pub(crate) endpoint: SocketEndpoint,
    _dir: TempDir,
}

impl LiveDaemon {
    pub(crate) fn start(transport: Transport, executor: Arc<dyn CommandExecutor>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let root = dir.path().to_str().expect("utf-8 temp dir").to_owned();
        let (endpoint, comms): (SocketEndpoint, Arc<dyn CommunicationsManager>) = match transport
        {
            Transport::Unix => {
                let endpoint = SocketEndpoint::unix(format!("{root}/srv"));
                let comms = comms::for_endpoint(&endpoint).expect("unix backend");
                comms.initialize().expect("bind unix socket");
                (endpoint, comms)
            }
            Transport::Pipe => {
                let endpoint = SocketEndpoint::pipe(format!("{root}/pipe"));
                let comms = comms::for_endpoint(&endpoint).expect("pipe backend");
                comms.initialize().expect("create pipe");
                (endpoint, comms)
            }
            Transport::Tcp => {
                let tcp = comms::TcpCommunications::new(SocketEndpoint::tcp("127.0.0.1", 0))
                    .expect("tcp backend");
                tcp.initialize().expect("bind tcp socket");
                let port = tcp.local_addr().expect("bound address").port();
                (SocketEndpoint::tcp("127.0.0.1", port), Arc::new(tcp))
            }
        };
        let server = RunningServer::start(Arc::clone(&comms), executor, 8);
        Self {
            server,
            comms,
            endpoint,
            _dir: dir,
        }
    }

    /// Runs `command` through the client library.
    pub(crate) fn run(&self, command: &str, answer: bool) -> (StatusCode, String) {
        let mut output = Vec::new();
        let status = cmdhub_cli::execute(&self.endpoint, command, &mut |_: &str| answer, &mut output)
            .expect("client exchange");
        (status, String::from_utf8(output).expect("utf-8 output"))
    }
}
