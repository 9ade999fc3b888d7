//! Wire protocol spoken between `cmdhubd` and its clients.
//!
//! A client writes one length-prefixed command frame to the listening
//! channel and reads back a 4-byte petition id. It then connects to the
//! response channel named after that id and reads a 4-byte status followed
//! by the command output up to end of stream. A status of
//! [`StatusCode::REQUEST_CONFIRMATION`] instead carries a question frame and
//! expects a one-byte answer before the exchange continues.

mod frame;
mod status;

pub use frame::{
    FrameError, MAX_FRAME_BYTES, MAX_PIPE_REQUEST_BYTES, decode_pipe_request, encode_frame, encode_pipe_request,
    read_frame, read_i32, read_status, read_text_frame, write_frame, write_i32, write_status,
};
pub use status::StatusCode;

/// Command that turns a petition into a long-lived state listener.
pub const REGISTER_STATE_LISTENER: &str = "registerstatelistener";

/// Liveness probe pushed to state listeners.
pub const ACK: &str = "ack";

/// Prefix of the push announcing a listener's client id.
pub const CLIENT_ID_PREFIX: &str = "clientID:";

/// Prefix of transfer progress pushes: `progress:<done>:<total>:<title>`.
pub const PROGRESS_PREFIX: &str = "progress:";

/// Answer byte for an accepted confirmation prompt.
pub const CONFIRM_YES: u8 = 1;

/// Answer byte for a declined confirmation prompt.
pub const CONFIRM_NO: u8 = 0;

/// Formats a progress push message.
#[must_use]
pub fn progress_message(transferred: u64, total: u64, title: &str) -> String {
    format!("{PROGRESS_PREFIX}{transferred}:{total}:{title}")
}

/// Formats the push that tells a listener its client id.
#[must_use]
pub fn client_id_message(client_id: u64) -> String {
    format!("{CLIENT_ID_PREFIX}{client_id}")
}
