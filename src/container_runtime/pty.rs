//! PTY handle returned by [`exec_pty`](super::ContainerRuntime::exec_pty).
//!
//! The handle splits into an output half (chunked reads, no line
//! buffering) and an input half (ordered writes plus resize). The bridge
//! takes exclusive ownership of both halves for the duration of an
//! attachment; dropping them releases the exec stream.

use std::collections::VecDeque;
use std::pin::Pin;

use bollard::exec::ResizeExecOptions;
use bollard::Docker;
use futures::{Stream, StreamExt};
use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error_handling::types::ContainerError;

/// Upper bound on a single chunk handed to the bridge.
pub const READ_CHUNK_BYTES: usize = 8 * 1024;

type ByteStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;
type ByteSink = Pin<Box<dyn AsyncWrite + Send>>;

/// A pseudo-terminal attached to a container shell.
pub struct PtyHandle {
    output: PtyOutput,
    input: PtyInput,
}

impl PtyHandle {
    pub(crate) fn new(stream: ByteStream, writer: ByteSink, resize: Option<(Docker, String)>) -> Self {
        Self {
            output: PtyOutput {
                stream,
                pending: VecDeque::new(),
            },
            input: PtyInput { writer, resize },
        }
    }

    /// Splits the handle into its two independently-pumped halves.
    pub fn split(self) -> (PtyOutput, PtyInput) {
        (self.output, self.input)
    }
}

/// Read half: yields byte chunks as soon as the shell produces them.
pub struct PtyOutput {
    stream: ByteStream,
    // Remainder of oversized chunks, re-served before the next read.
    pending: VecDeque<Vec<u8>>,
}

impl PtyOutput {
    /// Returns the next chunk (at most [`READ_CHUNK_BYTES`]), or `None`
    /// once the PTY reached end of stream.
    pub async fn read_chunk(&mut self) -> Option<Vec<u8>> {
        if let Some(chunk) = self.pending.pop_front() {
            return Some(chunk);
        }

        let raw = self.stream.next().await?;
        if raw.len() <= READ_CHUNK_BYTES {
            return Some(raw);
        }

        let mut rest = raw;
        let first = rest.drain(..READ_CHUNK_BYTES).collect::<Vec<u8>>();
        while !rest.is_empty() {
            let take = rest.len().min(READ_CHUNK_BYTES);
            self.pending.push_back(rest.drain(..take).collect());
        }
        Some(first)
    }
}

/// Write half: ordered byte writes plus the resize control channel.
pub struct PtyInput {
    writer: ByteSink,
    /// `None` when the backing transport has no resize control.
    resize: Option<(Docker, String)>,
}

impl PtyInput {
    /// Writes `bytes` to the shell's stdin and flushes immediately.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ContainerError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Resizes the terminal. Ordered with respect to prior writes on this
    /// half because callers sequence both through the same queue.
    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ContainerError> {
        match &self.resize {
            Some((docker, exec_id)) => {
                docker
                    .resize_exec(
                        exec_id,
                        ResizeExecOptions {
                            height: rows,
                            width: cols,
                        },
                    )
                    .await?;
                debug!("Resized PTY {} to {}x{}", exec_id, cols, rows);
                Ok(())
            }
            None => {
                debug!("Resize to {}x{} ignored: no resize control", cols, rows);
                Ok(())
            }
        }
    }

    /// Closes the write half; the shell observes EOF on stdin.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn handle_from_chunks(chunks: Vec<Vec<u8>>) -> PtyHandle {
        let (_client, server) = tokio::io::duplex(1024);
        PtyHandle::new(Box::pin(stream::iter(chunks)), Box::pin(server), None)
    }

    #[tokio::test]
    async fn read_chunk_passes_small_chunks_through() {
        let (mut output, _input) = handle_from_chunks(vec![b"hello".to_vec()]).split();
        assert_eq!(output.read_chunk().await, Some(b"hello".to_vec()));
        assert_eq!(output.read_chunk().await, None);
    }

    #[tokio::test]
    async fn read_chunk_splits_oversized_chunks() {
        let big = vec![7u8; READ_CHUNK_BYTES * 2 + 100];
        let (mut output, _input) = handle_from_chunks(vec![big]).split();

        assert_eq!(output.read_chunk().await.unwrap().len(), READ_CHUNK_BYTES);
        assert_eq!(output.read_chunk().await.unwrap().len(), READ_CHUNK_BYTES);
        assert_eq!(output.read_chunk().await.unwrap().len(), 100);
        assert_eq!(output.read_chunk().await, None);
    }

    #[tokio::test]
    async fn resize_without_control_is_a_noop() {
        let (_output, mut input) = handle_from_chunks(vec![]).split();
        assert!(input.resize(132, 40).await.is_ok());
    }
}
