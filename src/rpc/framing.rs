//! Line-delimited message framing
//!
//! Splits the child's stdout text stream into newline-terminated protocol
//! lines. Chunk boundaries are arbitrary: a message may span many reads and
//! one read may carry many messages, so the unterminated tail is held back
//! until its newline arrives.
//!
//! Framing format:
//! <json>\n<json>\n...

use tracing::{trace, warn};

/// Maximum size of a single unterminated line to prevent memory exhaustion
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Incremental newline framer holding the unterminated remainder of the stream
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Unterminated remainder since the last complete-line split
    buffer: String,

    /// Number of oversized fragments discarded
    overflows: u64,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes
    ///
    /// Returned lines have their terminator (and a trailing `\r`) removed.
    /// Blank lines are skipped.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            self.enforce_limit();
            return Vec::new();
        };

        let remainder = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, remainder);

        let lines: Vec<String> = complete
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();

        trace!(
            "LineFramer: {} complete line(s), {} byte(s) held back",
            lines.len(),
            self.buffer.len()
        );

        self.enforce_limit();
        lines
    }

    /// Bytes held back waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of oversized fragments discarded so far
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    fn enforce_limit(&mut self) {
        if self.buffer.len() > MAX_LINE_SIZE {
            warn!(
                "LineFramer: discarding unterminated fragment of {} bytes (max: {})",
                self.buffer.len(),
                MAX_LINE_SIZE
            );
            self.buffer.clear();
            self.overflows += 1;
        }
    }
}
