//! Command execution seam and the bundled built-in commands.

use std::io::{self, Write};

use cmdhub_protocol::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::comms::Delivery;
use crate::context::ExecutionContext;

const EXECUTOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::executor");

/// Runs one command line against an execution context.
///
/// Output written to the context becomes the response body, and the status
/// left on the context becomes the response status.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command: &str, context: &mut ExecutionContext<'_>)
    -> Result<(), CommandError>;
}

/// Failure of a command. The worker reports it as the response status plus
/// an `error:` line.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("failed to write command output: {0}")]
    Output(#[from] io::Error),
    #[error("{message}")]
    Failed { status: StatusCode, message: String },
}

impl CommandError {
    /// Builds a failure reported with `status`.
    pub fn failed(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Failed {
            status,
            message: message.into(),
        }
    }

    /// Status code the response carries for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Usage(_) | Self::Unknown(_) => StatusCode::EARGS,
            Self::Output(_) => StatusCode::UNEXPECTED,
            Self::Failed { status, .. } => *status,
        }
    }
}

const HELP: &str = "\
commands:
  echo <text>               print <text>
  version                   print the daemon version
  handles                   borrow a secondary handle and report pool usage
  confirm <question>        ask the client to confirm <question>
  notify <client> <message> push <message> to state listener <client>
  help                      print this list
  quit | exit               stop the daemon
";

/// Small command set shipped with the daemon.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinExecutor;

impl CommandExecutor for BuiltinExecutor {
    fn execute(
        &self,
        command: &str,
        context: &mut ExecutionContext<'_>,
    ) -> Result<(), CommandError> {
        let command = command.trim();
        let (word, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(word, rest)| (word, rest.trim()));
        debug!(target: EXECUTOR_TARGET, command = word, "running built-in command");

        match word {
            "echo" => writeln!(context, "{rest}")?,
            "version" => writeln!(context, "{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?,
            "help" | "" => context.write_all(HELP.as_bytes())?,
            "handles" => handles(context)?,
            "confirm" => confirm(rest, context)?,
            "notify" => notify(rest, context)?,
            other => return Err(CommandError::Unknown(other.to_owned())),
        }
        Ok(())
    }
}

fn handles(context: &mut ExecutionContext<'_>) -> Result<(), CommandError> {
    let (slot, stats) = {
        let lease = context.handles().lease();
        (lease.slot(), context.handles().stats())
    };
    writeln!(
        context,
        "secondary handle {slot}: {}/{} in use",
        stats.checked_out, stats.capacity
    )?;
    Ok(())
}

fn confirm(question: &str, context: &mut ExecutionContext<'_>) -> Result<(), CommandError> {
    if question.is_empty() {
        return Err(CommandError::Usage("confirm <question>"));
    }
    if context.confirm(question) {
        writeln!(context, "confirmed")?;
    } else {
        writeln!(context, "declined")?;
        context.set_status(StatusCode::NOT_PERMITTED);
    }
    Ok(())
}

fn notify(arguments: &str, context: &mut ExecutionContext<'_>) -> Result<(), CommandError> {
    let usage = CommandError::Usage("notify <client> <message>");
    let Some((client, message)) = arguments.split_once(char::is_whitespace) else {
        return Err(usage);
    };
    let Ok(client_id) = client.parse::<u64>() else {
        return Err(usage);
    };

    match context.notify_client(client_id, message.trim()) {
        Delivery::Delivered => writeln!(context, "delivered to client {client_id}")?,
        Delivery::Pending => writeln!(context, "client {client_id} has not connected yet")?,
        Delivery::Gone => {
            return Err(CommandError::failed(
                StatusCode::NOT_FOUND,
                format!("client {client_id} has disconnected"),
            ));
        }
        Delivery::UnknownClient => {
            return Err(CommandError::failed(
                StatusCode::NOT_FOUND,
                format!("no state listener with client id {client_id}"),
            ));
        }
        Delivery::Unsupported => {
            return Err(CommandError::failed(
                StatusCode::INVALID_STATE,
                "this transport cannot push messages",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::admission::HandlePool;
    use crate::context::{OutputBuffer, Services};

    fn run(command: &str, answer: bool) -> (Result<(), CommandError>, StatusCode, String) {
        let services = Services::new(Arc::new(HandlePool::secondary(2)), None);
        let buffer = OutputBuffer::new();
        let mut confirm = |_: &str| answer;
        let mut context = ExecutionContext::for_petition(buffer.clone(), &mut confirm, &services);
        let result = BuiltinExecutor.execute(command, &mut context);
        let status = context.status();
        let text = String::from_utf8(buffer.take()).expect("utf-8 output");
        (result, status, text)
    }

    #[test]
    fn echo_repeats_its_arguments() {
        let (result, status, text) = run("echo  hello there ", false);
        assert!(result.is_ok());
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "hello there\n");
    }

    #[rstest]
    #[case(true, "confirmed\n", StatusCode::OK)]
    #[case(false, "declined\n", StatusCode::NOT_PERMITTED)]
    fn confirm_reports_the_answer(
        #[case] answer: bool,
        #[case] expected: &str,
        #[case] expected_status: StatusCode,
    ) {
        let (result, status, text) = run("confirm Remove the share?", answer);
        assert!(result.is_ok());
        assert_eq!(text, expected);
        assert_eq!(status, expected_status);
    }

    #[test]
    fn handles_reports_pool_usage() {
        let (result, _, text) = run("handles", false);
        assert!(result.is_ok());
        assert!(text.ends_with("1/2 in use\n"), "unexpected output: {text}");
    }

    #[rstest]
    #[case("notify", StatusCode::EARGS)]
    #[case("notify one ack", StatusCode::EARGS)]
    #[case("notify 1 ack", StatusCode::INVALID_STATE)]
    #[case("frobnicate", StatusCode::EARGS)]
    fn failures_carry_a_status(#[case] command: &str, #[case] expected: StatusCode) {
        let (result, _, _) = run(command, false);
        let error = result.expect_err("command fails");
        assert_eq!(error.status(), expected);
    }
}
