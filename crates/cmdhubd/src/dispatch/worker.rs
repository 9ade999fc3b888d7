//! Body of a petition worker thread.

use std::any::Any;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use cmdhub_protocol::{REGISTER_STATE_LISTENER, StatusCode, client_id_message};
use tracing::{Level, debug, info, warn};

use super::{DISPATCH_TARGET, ServerShared, is_exit_command};
use crate::admission::SlotPermit;
use crate::comms::Petition;
use crate::context::{ContextScope, ExecutionContext, OutputBuffer};

/// Log level copied into a petition's output unless the command changes it.
pub(crate) const PETITION_LOG_LEVEL: Level = Level::ERROR;

/// Runs one petition to its single response, then frees its slot.
pub(crate) fn process_petition(shared: &ServerShared, mut petition: Petition, permit: SlotPermit) {
    petition.attach_worker(thread::current());
    let comms = shared.comms.as_ref();
    let line = petition.line().trim().to_owned();

    if line == REGISTER_STATE_LISTENER {
        register_listener(shared, petition);
        drop(permit);
        return;
    }

    let details = comms.petition_details(&petition);
    info!(target: DISPATCH_TARGET, petition = %details, "processing petition");

    let buffer = OutputBuffer::new();
    let status = {
        let _scope = ContextScope::enter(buffer.clone(), Some(PETITION_LOG_LEVEL));
        run_command(shared, &mut petition, &line, &buffer)
    };

    let output = buffer.take();
    debug!(
        target: DISPATCH_TARGET,
        petition = %details,
        %status,
        bytes = output.len(),
        "petition finished"
    );
    comms.return_and_close_petition(petition, &output, status);
    drop(permit);

    if is_exit_command(&line) {
        shared.stop.stop();
    }
}

fn run_command(
    shared: &ServerShared,
    petition: &mut Petition,
    line: &str,
    buffer: &OutputBuffer,
) -> StatusCode {
    if is_exit_command(line) {
        return StatusCode::OK;
    }

    let comms = shared.comms.as_ref();
    let mut confirm = |question: &str| comms.get_confirmation(petition, question);
    let mut context = ExecutionContext::for_petition(buffer.clone(), &mut confirm, &shared.services);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        shared.executor.execute(line, &mut context)
    }));
    match outcome {
        Ok(Ok(())) => context.status(),
        Ok(Err(error)) => {
            let _ = writeln!(context, "error: {error}");
            error.status()
        }
        Err(payload) => {
            let reason = panic_reason(payload.as_ref());
            warn!(target: DISPATCH_TARGET, %reason, "command panicked");
            let _ = writeln!(context, "error: command failed unexpectedly: {reason}");
            StatusCode::UNEXPECTED
        }
    }
}

fn register_listener(shared: &ServerShared, petition: Petition) {
    let comms = shared.comms.as_ref();
    if !comms.supports_state_listeners() {
        debug!(target: DISPATCH_TARGET, "transport cannot hold state listeners");
        comms.return_and_close_petition(
            petition,
            b"error: this transport does not support state listeners\n",
            StatusCode::INVALID_STATE,
        );
        return;
    }

    let client_id = comms.register_state_listener(petition);
    let delivery = comms.inform_client(client_id, &client_id_message(client_id));
    info!(
        target: DISPATCH_TARGET,
        client_id,
        ?delivery,
        listeners = comms.state_listeners().len(),
        "registered state listener"
    );
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|reason| (*reason).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("unknown panic"))
}
