//! Command-line surface of the client.

use clap::Parser;
use cmdhub_config::SocketEndpoint;

/// Sends one command to the `cmdhubd` daemon and prints its output.
#[derive(Debug, Parser)]
#[command(name = "cmdhub", version, about)]
pub(crate) struct Cli {
    /// Daemon endpoint, e.g. `unix:///run/user/1000/cmdhub/srv`.
    #[arg(long, value_name = "ENDPOINT")]
    pub(crate) daemon_socket: Option<SocketEndpoint>,
    /// Register as a state listener and print every push.
    #[arg(long, conflicts_with = "command")]
    pub(crate) listen: bool,
    /// Command words, joined by spaces.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}

impl Cli {
    pub(crate) fn command_line(&self) -> String {
        self.command.join(" ")
    }
}
