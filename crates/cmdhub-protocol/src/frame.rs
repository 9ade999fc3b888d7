//! Length-prefixed frames and fixed-width integers.
//!
//! Integers use the host byte order: daemon and client always share a host.

use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;

use crate::StatusCode;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying stream failed.
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The peer announced a frame larger than the accepted limit.
    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Announced length.
        length: usize,
        /// Accepted limit.
        limit: usize,
    },
    /// The stream ended before the first byte of a frame.
    #[error("stream closed")]
    Closed,
    /// The stream ended part way through a frame.
    #[error("stream closed mid-frame")]
    Truncated,
    /// Frame payload was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl FrameError {
    /// Returns `true` when the stream ended cleanly before any byte of a frame.
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Writes a native-endian `i32`.
pub fn write_i32<W: Write + ?Sized>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_ne_bytes())
}

/// Reads a native-endian `i32`.
pub fn read_i32<R: Read + ?Sized>(reader: &mut R) -> Result<i32, FrameError> {
    let mut bytes = [0_u8; 4];
    read_exact(reader, &mut bytes, Boundary::Start)?;
    Ok(i32::from_ne_bytes(bytes))
}

/// Writes a status code field.
pub fn write_status<W: Write + ?Sized>(writer: &mut W, status: StatusCode) -> io::Result<()> {
    write_i32(writer, status.code())
}

/// Reads a status code field.
pub fn read_status<R: Read + ?Sized>(reader: &mut R) -> Result<StatusCode, FrameError> {
    read_i32(reader).map(StatusCode::new)
}

/// Encodes `payload` as a single frame buffer.
///
/// Writing the frame with one call keeps it atomic on pipes.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let length = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut buffer = Vec::with_capacity(payload.len() + 4);
    buffer.extend_from_slice(&length.to_ne_bytes());
    buffer.extend_from_slice(payload);
    buffer
}

/// Writes one length-prefixed frame.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            length: payload.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&encode_frame(payload))?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame of at most `limit` bytes.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, limit: usize) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0_u8; 4];
    read_exact(reader, &mut prefix, Boundary::Start)?;
    let length = usize::try_from(u32::from_ne_bytes(prefix)).unwrap_or(usize::MAX);
    if length > limit {
        return Err(FrameError::TooLarge { length, limit });
    }
    let mut payload = vec![0_u8; length];
    read_exact(reader, &mut payload, Boundary::Inside)?;
    Ok(payload)
}

/// Reads one frame and decodes it as UTF-8 text.
pub fn read_text_frame<R: Read + ?Sized>(reader: &mut R) -> Result<String, FrameError> {
    let payload = read_frame(reader, MAX_FRAME_BYTES)?;
    Ok(String::from_utf8(payload)?)
}

/// Where a read starts relative to frame boundaries.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Start,
    Inside,
}

fn read_exact<R: Read + ?Sized>(
    reader: &mut R,
    buffer: &mut [u8],
    boundary: Boundary,
) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buffer.len() {
        let Some(rest) = buffer.get_mut(filled..) else {
            break;
        };
        match reader.read(rest) {
            Ok(0) if filled == 0 && boundary == Boundary::Start => {
                return Err(FrameError::Closed);
            }
            Ok(0) => return Err(FrameError::Truncated),
            Ok(read) => filled += read,
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => return Err(FrameError::Io(error)),
        }
    }
    Ok(())
}

/// Separator between the reply path and the command of a pipe request.
const PIPE_FIELD_SEPARATOR: u8 = 0;

/// Largest framed pipe request, prefix included. Writes up to this size are
/// atomic, so requests from concurrent clients never interleave.
pub const MAX_PIPE_REQUEST_BYTES: usize = 4096;

/// Encodes the payload a client writes into the listening named pipe.
///
/// Pipes are one-way, so the request names the pipe the client reads its
/// petition id from.
#[must_use]
pub fn encode_pipe_request(reply_path: &str, command: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(reply_path.len() + command.len() + 1);
    payload.extend_from_slice(reply_path.as_bytes());
    payload.push(PIPE_FIELD_SEPARATOR);
    payload.extend_from_slice(command.as_bytes());
    payload
}

/// Splits a pipe request payload into its reply path and command.
#[must_use]
pub fn decode_pipe_request(payload: &[u8]) -> Option<(String, String)> {
    let separator = payload.iter().position(|byte| *byte == PIPE_FIELD_SEPARATOR)?;
    let (reply, command) = payload.split_at(separator);
    let command = command.get(1..)?;
    Some((
        String::from_utf8(reply.to_vec()).ok()?,
        String::from_utf8(command.to_vec()).ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(5000)]
    fn frames_survive_a_stream(#[case] size: usize) {
        let payload: Vec<u8> = (0..size).map(|index| (index % 251) as u8).collect();
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload).expect("write frame");
        assert_eq!(wire.len(), size + 4);

        let decoded = read_frame(&mut Cursor::new(wire), MAX_FRAME_BYTES).expect("read frame");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn oversized_frames_are_rejected_before_allocation() {
        let wire = encode_frame(&[7_u8; 32]);
        let error = read_frame(&mut Cursor::new(wire), 16).expect_err("frame too large");
        assert!(matches!(error, FrameError::TooLarge { length: 32, limit: 16 }));
    }

    #[test]
    fn an_empty_stream_is_a_clean_end() {
        let error = read_frame(&mut Cursor::new(Vec::new()), MAX_FRAME_BYTES).expect_err("closed");
        assert!(matches!(error, FrameError::Closed));
        assert!(error.is_end_of_stream());
    }

    #[rstest]
    #[case(2)]
    #[case(4)]
    #[case(6)]
    fn frames_cut_short_are_not_a_clean_end(#[case] kept: usize) {
        let mut wire = encode_frame(b"ls /");
        wire.truncate(kept);
        let error = read_frame(&mut Cursor::new(wire), MAX_FRAME_BYTES).expect_err("truncated");
        assert!(matches!(error, FrameError::Truncated));
        assert!(!error.is_end_of_stream());
    }

    #[test]
    fn status_fields_are_four_bytes() {
        let mut wire = Vec::new();
        write_status(&mut wire, StatusCode::NOT_FOUND).expect("write status");
        assert_eq!(wire.len(), 4);
        let status = read_status(&mut Cursor::new(wire)).expect("read status");
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn pipe_requests_split_on_the_separator() {
        let payload = encode_pipe_request("/run/cmdhub/reply.12", "find / --pattern=a b");
        let (reply, command) = decode_pipe_request(&payload).expect("decodes");
        assert_eq!(reply, "/run/cmdhub/reply.12");
        assert_eq!(command, "find / --pattern=a b");
        assert!(decode_pipe_request(b"no separator").is_none());
    }
}
