use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    match cmdhubd::run_daemon() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let _ = writeln!(io::stderr(), "cmdhubd: {error}");
            ExitCode::FAILURE
        }
    }
}
