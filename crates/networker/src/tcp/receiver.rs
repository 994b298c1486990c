//! Background receive loop that drains a socket into a message queue.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::connection::ConnectionId;
use super::queue::MessageQueue;
use crate::Result;
use crate::error::NetworkError;

/// Read side of a connection.
///
/// Kept across receive loop restarts so bytes already buffered, including an
/// unterminated text line, survive a switch of receive mode.
pub(crate) struct StreamReader {
    reader: BufReader<OwnedReadHalf>,
    partial_line: Vec<u8>,
}

impl StreamReader {
    pub(crate) fn new(read_half: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(read_half),
            partial_line: Vec::new(),
        }
    }
}

/// Where a receive loop delivers what it reads.
pub(crate) enum Sink {
    /// Newline-delimited lines, terminator stripped.
    Text(MessageQueue<String>),
    /// Raw chunks of at most `chunk_size` bytes.
    Binary {
        queue: MessageQueue<Bytes>,
        chunk_size: usize,
    },
}

/// Why a receive loop ended without an I/O error.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Stopped,
    EndOfStream,
}

/// Handle to a running receive loop.
///
/// Dropping the handle stops the loop at its next poll.
pub(crate) struct ReceiveLoop {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<StreamReader>,
}

impl ReceiveLoop {
    /// Spawn a receive loop on the current tokio runtime.
    pub(crate) fn spawn(
        reader: StreamReader,
        sink: Sink,
        conn_id: ConnectionId,
        receiving: Arc<AtomicBool>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        receiving.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut reader = reader;
            let result = run(&mut reader, &sink, stop_rx).await;

            match result {
                Ok(Exit::Stopped) => {
                    tracing::debug!(target: "networker::connection", "{conn_id}: receive loop stopped");
                }
                Ok(Exit::EndOfStream) => {
                    tracing::debug!(target: "networker::connection", "{conn_id}: peer closed the stream");
                }
                Err(e) => {
                    tracing::warn!(target: "networker::connection", "{conn_id}: receive loop failed: {e}");
                }
            }

            receiving.store(false, Ordering::SeqCst);
            reader
        });

        Self { stop_tx, handle }
    }

    /// Stop the loop and take back the reader.
    ///
    /// Interrupts a pending read; no bytes are lost, since both the buffered
    /// reader and the partial line buffer are cancel-safe.
    pub(crate) async fn stop(self) -> Result<StreamReader> {
        // The loop may already have ended on its own.
        let _ = self.stop_tx.send(());
        self.handle
            .await
            .map_err(|e| NetworkError::ReceiveLoop(e.to_string()))
    }
}

async fn run(
    reader: &mut StreamReader,
    sink: &Sink,
    mut stop_rx: oneshot::Receiver<()>,
) -> io::Result<Exit> {
    match sink {
        Sink::Text(queue) => loop {
            tokio::select! {
                biased;

                _ = &mut stop_rx => return Ok(Exit::Stopped),

                result = reader.reader.read_until(b'\n', &mut reader.partial_line) => {
                    if result? == 0 {
                        // EOF; keep an unterminated last line.
                        if !reader.partial_line.is_empty() {
                            queue.push(take_line(&mut reader.partial_line));
                        }
                        return Ok(Exit::EndOfStream);
                    }
                    if reader.partial_line.last() == Some(&b'\n') {
                        queue.push(take_line(&mut reader.partial_line));
                    }
                }
            }
        },
        Sink::Binary { queue, chunk_size } => {
            // Bytes a text loop left behind come first.
            if !reader.partial_line.is_empty() {
                for chunk in reader.partial_line.chunks(*chunk_size) {
                    queue.push(Bytes::copy_from_slice(chunk));
                }
                reader.partial_line.clear();
            }

            let mut buffer = vec![0u8; *chunk_size];
            loop {
                tokio::select! {
                    biased;

                    _ = &mut stop_rx => return Ok(Exit::Stopped),

                    result = reader.reader.read(&mut buffer) => {
                        match result? {
                            0 => return Ok(Exit::EndOfStream),
                            n => queue.push(Bytes::copy_from_slice(&buffer[..n])),
                        }
                    }
                }
            }
        }
    }
}

/// Take a complete line out of `buf`, stripping `\n` and a preceding `\r`.
fn take_line(buf: &mut Vec<u8>) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && buf[end - 1] == b'\r' {
            end -= 1;
        }
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    line
}
