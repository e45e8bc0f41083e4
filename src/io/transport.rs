//! Transport layer - Pure I/O abstraction for the child's stdio streams
//!
//! Moves raw text between the supervisor and the child process without any
//! knowledge of message format. Stdout is surfaced as UTF-8-safe chunks in
//! arrival order; stdin writes are serialized through a single writer task so
//! concurrent callers never interleave partial messages.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for stdout reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity for UTF-8 accumulation buffer
const UTF8_ACCUMULATION_BUFFER_CAPACITY: usize = 8192;

/// Queued-but-unwritten bytes above which a write reports backpressure
pub const DEFAULT_BACKLOG_HIGH_WATER: usize = 64 * 1024;

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,
}

/// Result of queueing a message on the stdin writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Message queued, backlog below the high-water mark
    Queued,
    /// Message queued, but the writer is lagging behind
    Backpressure { backlog_bytes: usize },
}

/// Transport implementation using stdin/stdout streams
#[derive(Debug)]
pub struct StdioTransport {
    writer: StdinWriter,
    reader: StdoutReader,
    write_failure: oneshot::Receiver<io::Error>,
}

/// Cloneable handle that queues messages for the stdin writer task
#[derive(Debug, Clone)]
pub struct StdinWriter {
    sender: mpsc::UnboundedSender<String>,
    backlog: Arc<AtomicUsize>,
    high_water: usize,
}

/// Receiving half yielding stdout text chunks
#[derive(Debug)]
pub struct StdoutReader {
    receiver: mpsc::UnboundedReceiver<String>,
}

/// Internal state for the stdout reader task that handles byte accumulation
struct StdoutReaderState {
    /// Buffer for accumulating raw bytes before UTF-8 conversion
    byte_buffer: Vec<u8>,

    /// Buffer capacity to avoid frequent reallocations
    buffer_capacity: usize,
}

impl StdoutReaderState {
    fn new() -> Self {
        Self {
            byte_buffer: Vec::with_capacity(UTF8_ACCUMULATION_BUFFER_CAPACITY),
            buffer_capacity: UTF8_ACCUMULATION_BUFFER_CAPACITY,
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.byte_buffer.extend_from_slice(bytes);
    }

    /// Extract the longest valid UTF-8 prefix, keeping a split code point for later
    fn extract_valid_utf8(&mut self) -> Option<String> {
        if self.byte_buffer.is_empty() {
            return None;
        }

        let valid_end = match std::str::from_utf8(&self.byte_buffer) {
            Ok(_) => self.byte_buffer.len(),
            Err(e) if e.error_len().is_some() => {
                // Genuinely invalid bytes; replace rather than stall forever
                let text = String::from_utf8_lossy(&self.byte_buffer).into_owned();
                warn!("StdioTransport: replaced invalid UTF-8 in stdout chunk");
                self.byte_buffer.clear();
                return Some(text);
            }
            Err(e) => e.valid_up_to(),
        };

        if valid_end == 0 {
            return None;
        }

        let bytes: Vec<u8> = self.byte_buffer.drain(..valid_end).collect();
        String::from_utf8(bytes).ok()
    }

    fn compact(&mut self) {
        if self.byte_buffer.capacity() > self.buffer_capacity * 2 {
            self.byte_buffer.shrink_to(self.buffer_capacity);
        }
    }
}

impl StdioTransport {
    /// Create a new StdioTransport from child process streams
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();
        let (failure_sender, failure_receiver) = oneshot::channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        tokio::spawn(Self::stdin_writer_task(
            stdin,
            stdin_receiver,
            Arc::clone(&backlog),
            failure_sender,
        ));
        tokio::spawn(Self::stdout_reader_task(stdout, stdout_sender));

        Self {
            writer: StdinWriter {
                sender: stdin_sender,
                backlog,
                high_water: DEFAULT_BACKLOG_HIGH_WATER,
            },
            reader: StdoutReader {
                receiver: stdout_receiver,
            },
            write_failure: failure_receiver,
        }
    }

    /// Split into the writer handle, the stdout reader and a one-shot that
    /// fires if the stdin writer hits an I/O error
    pub fn into_split(self) -> (StdinWriter, StdoutReader, oneshot::Receiver<io::Error>) {
        (self.writer, self.reader, self.write_failure)
    }

    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<String>,
        backlog: Arc<AtomicUsize>,
        failure: oneshot::Sender<io::Error>,
    ) {
        while let Some(message) = receiver.recv().await {
            trace!(
                "StdioTransport: Writing message (length: {})",
                message.len()
            );

            let result = match stdin.write_all(message.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            backlog.fetch_sub(message.len(), Ordering::SeqCst);

            if let Err(e) = result {
                error!("Failed to write to stdin: {}", e);
                let _ = failure.send(e);
                return;
            }
        }

        trace!("StdioTransport: stdin writer task finished");
    }

    async fn stdout_reader_task(stdout: ChildStdout, sender: mpsc::UnboundedSender<String>) {
        let mut reader = BufReader::new(stdout);
        let mut state = StdoutReaderState::new();
        let mut read_buffer = Box::new([0u8; READ_BUFFER_SIZE]);

        loop {
            match reader.read(read_buffer.as_mut()).await {
                Ok(0) => {
                    Self::handle_eof(&mut state, &sender);
                    break;
                }
                Ok(n) => {
                    state.add_bytes(&read_buffer[..n]);

                    while let Some(data) = state.extract_valid_utf8() {
                        if sender.send(data).is_err() {
                            trace!("StdioTransport: stdout receiver dropped, stopping reader");
                            return;
                        }
                    }

                    state.compact();
                }
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: stdout reader task finished");
    }

    fn handle_eof(state: &mut StdoutReaderState, sender: &mpsc::UnboundedSender<String>) {
        trace!("StdioTransport: stdout reader reached EOF");

        if let Some(final_string) = state.extract_valid_utf8() {
            if !final_string.is_empty() && sender.send(final_string).is_err() {
                trace!("StdioTransport: stdout receiver dropped during EOF processing");
            }
        }

        if !state.byte_buffer.is_empty() {
            error!(
                "StdioTransport: {} incomplete bytes remaining at EOF: {:?}",
                state.byte_buffer.len(),
                state.byte_buffer
            );
        }
    }
}

impl StdinWriter {
    /// Queue a message for the child's stdin
    ///
    /// Never blocks. Fails only if the writer task has gone away.
    pub fn write(&self, message: String) -> Result<WriteOutcome, StdioTransportError> {
        let len = message.len();
        let backlog = self.backlog.fetch_add(len, Ordering::SeqCst) + len;

        if self.sender.send(message).is_err() {
            self.backlog.fetch_sub(len, Ordering::SeqCst);
            return Err(StdioTransportError::Disconnected);
        }

        if backlog > self.high_water {
            Ok(WriteOutcome::Backpressure {
                backlog_bytes: backlog,
            })
        } else {
            Ok(WriteOutcome::Queued)
        }
    }

    /// Bytes queued but not yet flushed to the child
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Whether the writer task has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl StdoutReader {
    /// Next chunk of stdout text, `None` at EOF
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

// ============================================================================
// Tests
// ============================================================================
