//! Client runtime of the `cmdhub` command.
//!
//! The client resolves the daemon endpoint (the `--daemon-socket` flag, then
//! the shared `ortho_config` layers), sends its command words as one
//! petition and prints what the daemon answers. The process exit code is the
//! command's status mapped into `0..=255`. With `--listen` the client instead
//! registers as a state listener and prints every push.

mod cli;
mod errors;
mod transport;

use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use cmdhub_config::{Config, SocketEndpoint};

use cli::Cli;
pub use errors::AppError;
pub use transport::{CONNECTION_TIMEOUT, execute, listen};

/// Parses `args`, runs the invocation and maps the outcome to an exit code.
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => {
            let _ = write!(stderr, "{error}");
            return match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(2),
            };
        }
    };

    match run_cli(&cli, stdout, stderr) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            let _ = writeln!(stderr, "cmdhub: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run_cli<W: Write, E: Write>(cli: &Cli, stdout: &mut W, stderr: &mut E) -> Result<u8, AppError> {
    let endpoint = resolve_endpoint(cli)?;
    if cli.listen {
        listen(&endpoint, &mut |message: &str| {
            writeln!(stdout, "{message}")
                .and_then(|()| stdout.flush())
                .is_ok()
        })?;
        return Ok(0);
    }

    let mut confirm = |question: &str| ask(question, stderr);
    let status = execute(&endpoint, &cli.command_line(), &mut confirm, stdout)?;
    Ok(status.exit_code())
}

fn resolve_endpoint(cli: &Cli) -> Result<SocketEndpoint, AppError> {
    if let Some(endpoint) = &cli.daemon_socket {
        return Ok(endpoint.clone());
    }
    Config::load_from_iter(["cmdhub"])
        .map(|config| config.daemon_socket().clone())
        .map_err(AppError::LoadConfiguration)
}

/// Prompts on `prompt` and reads a yes/no answer from stdin. A closed stdin
/// declines.
fn ask<E: Write>(question: &str, prompt: &mut E) -> bool {
    if write!(prompt, "{question} [y/N] ")
        .and_then(|()| prompt.flush())
        .is_err()
    {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
