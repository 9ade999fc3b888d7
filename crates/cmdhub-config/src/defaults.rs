use camino::Utf8PathBuf;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use libc::geteuid;

use crate::socket::SocketEndpoint;
use crate::LogFormat;

/// Base port of the loopback TCP transport; response ports follow it.
pub const DEFAULT_TCP_PORT: u16 = 12300;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default number of petitions processed in parallel.
pub const DEFAULT_MAX_PARALLEL_PETITIONS: usize = 100;

/// Default size of the secondary handle pool.
pub const DEFAULT_SECONDARY_HANDLES: usize = 5;

/// File name of the listening socket inside the runtime directory.
pub const LISTENER_FILE_NAME: &str = "srv";

/// File name prefix of the named pipe transport.
pub const PIPE_FILE_NAME: &str = "pipe";

const NAMESPACE: &str = "cmdhub";

/// Default log filter expression used by the binaries.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

pub(crate) fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

pub(crate) const fn default_max_parallel_petitions() -> usize {
    DEFAULT_MAX_PARALLEL_PETITIONS
}

pub(crate) const fn default_secondary_handles() -> usize {
    DEFAULT_SECONDARY_HANDLES
}

/// Computes the default listening endpoint for the daemon.
#[must_use]
pub fn default_socket_endpoint() -> SocketEndpoint {
    SocketEndpoint::unix(runtime_directory().join(LISTENER_FILE_NAME))
}

/// Computes the default named pipe endpoint for the daemon.
#[must_use]
pub fn default_pipe_endpoint() -> SocketEndpoint {
    SocketEndpoint::pipe(runtime_directory().join(PIPE_FILE_NAME))
}

/// Per-user directory holding socket files and pipes.
///
/// The XDG runtime directory is already private to the user. Without one,
/// the temporary directory is namespaced by effective user id so users on
/// one host never collide.
#[must_use]
pub fn runtime_directory() -> Utf8PathBuf {
    match runtime_base_directory() {
        Some(mut base) => {
            base.push(NAMESPACE);
            base
        }
        None => {
            let mut base = fallback_base_directory();
            base.push(NAMESPACE);
            base.push(user_namespace());
            base
        }
    }
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

#[cfg(not(unix))]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    None
}

fn fallback_base_directory() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    // SAFETY: `geteuid` has no preconditions and cannot fail.
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn user_namespace() -> String {
    String::from("uid-unknown")
}
