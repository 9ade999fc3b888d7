//! The daemon's control loop.
//!
//! [`Server::run`] waits for petitions and console input on the main thread.
//! Console lines run inline; each petition takes an admission slot and runs
//! on its own worker thread, which answers it exactly once.

mod console;
pub(crate) mod worker;

use std::io::Write;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cmdhub_config::Config;
use cmdhub_protocol::StatusCode;
use tracing::{debug, error, info, warn};

pub use console::{Console, ConsoleEvent, ConsoleSource, PROMPT};

use crate::admission::{AdmissionController, HandlePool, SlotPermit};
use crate::comms::{CommunicationsManager, Petition, WaitStatus};
use crate::context::{ExecutionContext, Services};
use crate::executor::CommandExecutor;
use crate::health::HealthReporter;
use crate::process::StopHandle;

pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// Total time shutdown waits for running workers.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How often a wait for an admission slot checks for a stop request.
const ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sizing of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Petitions processed at the same time.
    pub max_parallel_petitions: usize,
    /// Size of the secondary handle pool.
    pub secondary_handles: usize,
}

impl ServerSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_parallel_petitions: config.max_parallel_petitions(),
            secondary_handles: config.secondary_handles(),
        }
    }
}

/// State shared between the control loop and its workers.
pub(crate) struct ServerShared {
    pub(crate) comms: Arc<dyn CommunicationsManager>,
    pub(crate) executor: Arc<dyn CommandExecutor>,
    pub(crate) services: Services,
    pub(crate) stop: StopHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Owns everything the control loop touches.
pub struct Server {
    shared: Arc<ServerShared>,
    admission: Arc<AdmissionController>,
    workers: Vec<JoinHandle<()>>,
    console: Option<Console>,
    reporter: Option<Arc<dyn HealthReporter>>,
    spawned: u64,
}

impl Server {
    /// Builds a server over an initialised transport.
    #[must_use]
    pub fn new(
        comms: Arc<dyn CommunicationsManager>,
        executor: Arc<dyn CommandExecutor>,
        settings: ServerSettings,
    ) -> Self {
        let handles = Arc::new(HandlePool::secondary(settings.secondary_handles));
        let services = Services::new(handles, Some(Arc::clone(&comms)));
        let stop = StopHandle::new(Arc::clone(&comms));
        Self {
            shared: Arc::new(ServerShared {
                comms,
                executor,
                services,
                stop,
            }),
            admission: Arc::new(AdmissionController::new(settings.max_parallel_petitions)),
            workers: Vec::new(),
            console: None,
            reporter: None,
            spawned: 0,
        }
    }

    /// Enables the interactive console.
    #[must_use]
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    /// Reports shutdown progress to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Handle that stops [`Self::run`] from any thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.shared.stop.clone()
    }

    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Runs until stopped, then shuts down.
    pub fn run(&mut self) {
        info!(
            target: DISPATCH_TARGET,
            capacity = self.admission.capacity(),
            console = self.console.is_some(),
            "dispatch loop started"
        );
        if self.console.is_some() {
            Console::prompt();
        }

        while !self.shared.stop.is_stopped() {
            let comms = Arc::clone(&self.shared.comms);
            let status = match self.console.as_ref() {
                Some(console) => comms.wait_for_petition_or_input(Some(console.as_fd())),
                None => comms.wait_for_petition(),
            };
            match status {
                WaitStatus::Stopped => break,
                WaitStatus::Recovered => continue,
                WaitStatus::Ready => {}
            }

            if comms.received_input() && self.handle_console() == Flow::Stop {
                break;
            }
            if comms.received_petition() {
                self.dispatch_petition();
            }
        }

        self.shutdown();
    }

    fn handle_console(&mut self) -> Flow {
        let Some(console) = self.console.as_mut() else {
            return Flow::Continue;
        };
        let (lines, closed) = match console.read_available() {
            Ok(ConsoleEvent::Lines(lines)) => (lines, false),
            Ok(ConsoleEvent::Closed(last)) => (last.into_iter().collect(), true),
            Err(error) => {
                warn!(target: DISPATCH_TARGET, %error, "console input failed; serving petitions only");
                self.console = None;
                return Flow::Continue;
            }
        };

        for line in lines {
            if self.run_interactive(&line) == Flow::Stop {
                return Flow::Stop;
            }
        }
        if closed {
            info!(target: DISPATCH_TARGET, "console closed");
            return Flow::Stop;
        }
        Console::prompt();
        Flow::Continue
    }

    fn run_interactive(&self, line: &str) -> Flow {
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }
        if is_exit_command(line) {
            return Flow::Stop;
        }

        let mut confirm = console::ask_on_terminal;
        let mut context = ExecutionContext::interactive(&mut confirm, &self.shared.services);
        if let Err(error) = self.shared.executor.execute(line, &mut context) {
            let _ = writeln!(context, "error: {error}");
            context.set_status(error.status());
        }
        let _ = context.flush();
        debug!(target: DISPATCH_TARGET, status = %context.status(), "console command finished");
        Flow::Continue
    }

    fn dispatch_petition(&mut self) {
        let Some(permit) = self.wait_for_slot() else {
            let petition = self.shared.comms.get_petition();
            info!(target: DISPATCH_TARGET, "refusing petition during shutdown");
            self.answer_unserved(petition, "daemon is shutting down");
            return;
        };
        let petition = self.shared.comms.get_petition();
        if petition.is_failed() {
            self.shared
                .comms
                .return_and_close_petition(petition, &[], StatusCode::UNEXPECTED);
            return;
        }
        self.reap_workers();
        self.spawn_worker(petition, permit);
    }

    /// Waits for a free slot. Returns `None` once a stop is requested.
    fn wait_for_slot(&self) -> Option<SlotPermit> {
        loop {
            if let Some(permit) = self.admission.permit_timeout(ADMISSION_POLL_INTERVAL) {
                return Some(permit);
            }
            if self.shared.stop.is_stopped() {
                return None;
            }
        }
    }

    fn spawn_worker(&mut self, petition: Petition, permit: SlotPermit) {
        self.spawned += 1;
        let (sender, receiver) = mpsc::channel::<(Petition, SlotPermit)>();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("petition-{}", self.spawned))
            .spawn(move || {
                if let Ok((petition, permit)) = receiver.recv() {
                    worker::process_petition(&shared, petition, permit);
                }
            });

        match spawned {
            Ok(handle) => {
                if let Err(mpsc::SendError((petition, _permit))) = sender.send((petition, permit)) {
                    self.answer_unserved(petition, "worker thread exited before starting");
                }
                self.workers.push(handle);
            }
            Err(error) => {
                error!(target: DISPATCH_TARGET, %error, "failed to spawn petition worker");
                self.answer_unserved(petition, &format!("failed to start worker: {error}"));
            }
        }
    }

    fn answer_unserved(&self, petition: Petition, reason: &str) {
        let output = format!("error: {reason}\n");
        self.shared
            .comms
            .return_and_close_petition(petition, output.as_bytes(), StatusCode::UNEXPECTED);
    }

    fn reap_workers(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.workers.drain(..).partition(JoinHandle::is_finished);
        self.workers = running;
        for handle in finished {
            if handle.join().is_err() {
                warn!(target: DISPATCH_TARGET, "petition worker panicked");
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(reporter) = &self.reporter {
            reporter.stopping();
        }
        info!(
            target: DISPATCH_TARGET,
            workers = self.workers.len(),
            "stopping dispatch loop"
        );
        self.shared.stop.stop();

        let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
        let mut abandoned = 0_usize;
        for handle in self.workers.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL_INTERVAL);
            }
            if !handle.is_finished() {
                abandoned += 1;
                continue;
            }
            if handle.join().is_err() {
                warn!(target: DISPATCH_TARGET, "petition worker panicked");
            }
        }
        if abandoned > 0 {
            warn!(target: DISPATCH_TARGET, abandoned, "abandoning petition workers still running");
        }

        let listeners = self.shared.comms.state_listeners().drain();
        debug!(target: DISPATCH_TARGET, listeners = listeners.len(), "closing state listeners");
        drop(listeners);
        if let Some(reporter) = &self.reporter {
            reporter.stopped();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Server")
            .field("capacity", &self.admission.capacity())
            .field("workers", &self.workers.len())
            .field("console", &self.console)
            .finish_non_exhaustive()
    }
}

/// Commands that end the dispatch loop.
pub(crate) fn is_exit_command(line: &str) -> bool {
    matches!(line.trim(), "quit" | "exit")
}
