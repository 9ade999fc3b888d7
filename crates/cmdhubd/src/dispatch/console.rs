use std::io::{self, ErrorKind, IsTerminal, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

const READ_CHUNK: usize = 16 * 1024;

/// Prompt printed before each interactive line.
pub const PROMPT: &str = "cmdhub> ";

/// Readable descriptor the console takes lines from.
pub trait ConsoleSource: Read + AsFd + Send {}

impl<T: Read + AsFd + Send> ConsoleSource for T {}

/// What one read of the console produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// Complete lines, possibly none when only part of a line arrived.
    Lines(Vec<String>),
    /// End of input. Carries any unterminated final line.
    Closed(Option<String>),
}

/// Line-buffered interactive input.
pub struct Console {
    source: Box<dyn ConsoleSource>,
    pending: Vec<u8>,
}

impl Console {
    /// Console on the daemon's stdin, when stdin is a terminal.
    #[must_use]
    pub fn stdin() -> Option<Self> {
        let stdin = io::stdin();
        stdin.is_terminal().then(|| Self::new(stdin))
    }

    pub fn new(source: impl ConsoleSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            pending: Vec::new(),
        }
    }

    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        self.source.as_fd()
    }

    /// Reads what is available after the descriptor reported readiness.
    pub(crate) fn read_available(&mut self) -> io::Result<ConsoleEvent> {
        let mut chunk = vec![0_u8; READ_CHUNK];
        let read = loop {
            match self.source.read(&mut chunk) {
                Ok(read) => break read,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    return Ok(ConsoleEvent::Lines(Vec::new()));
                }
                Err(error) => return Err(error),
            }
        };

        if read == 0 {
            let rest = std::mem::take(&mut self.pending);
            let rest = String::from_utf8_lossy(&rest).trim().to_owned();
            return Ok(ConsoleEvent::Closed((!rest.is_empty()).then_some(rest)));
        }

        self.pending.extend_from_slice(chunk.get(..read).unwrap_or_default());
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_owned());
        }
        Ok(ConsoleEvent::Lines(lines))
    }

    pub(crate) fn prompt() {
        let mut stdout = io::stdout();
        // The prompt is cosmetic; a closed stdout must not stop the loop.
        let _ = stdout.write_all(PROMPT.as_bytes());
        let _ = stdout.flush();
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Console")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Asks a yes/no question on the terminal.
pub(crate) fn ask_on_terminal(question: &str) -> bool {
    let mut stdout = io::stdout();
    if write!(stdout, "{question} [y/N] ").and_then(|()| stdout.flush()).is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
