//! Delimiter-based frame reassembly over a byte stream.
//!
//! [`LineFramingPipe`] runs two loops concurrently: a producer copying bytes
//! from the transport into a bounded channel of chunks, and a consumer that
//! splits the accumulated bytes on [`FRAME_DELIMITER`] and hands each frame
//! to a [`FrameHandler`]. The channel bound is the backpressure: when the
//! consumer falls behind, the producer stops reading from the transport.
//! Frames longer than the configured maximum fail the run, so a peer that
//! never sends a delimiter cannot grow the reassembly buffer without bound.

use crate::error::StressError;
use crate::serializer::max_frame_length;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Byte terminating every frame on the wire
pub const FRAME_DELIMITER: u8 = b'\n';

/// What the pipe should do after a frame has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// Stop immediately; frames already buffered are not delivered
    Stop,
}

/// Per-frame callback driven by [`LineFramingPipe::run`]
#[async_trait]
pub trait FrameHandler: Send {
    /// Handle one frame, delimiter excluded.
    async fn on_frame(&mut self, frame: Bytes) -> Result<FrameAction, StressError>;
}

/// Splits an incoming byte stream into delimiter-terminated frames
#[derive(Debug, Clone)]
pub struct LineFramingPipe {
    read_chunk_size: usize,
    max_buffered_chunks: usize,
    max_frame_length: usize,
}

impl Default for LineFramingPipe {
    fn default() -> Self {
        Self {
            read_chunk_size: 4096,
            max_buffered_chunks: 16,
            max_frame_length: max_frame_length(crate::defaults::MAX_BUFFER_LENGTH),
        }
    }
}

impl LineFramingPipe {
    pub fn new(read_chunk_size: usize, max_buffered_chunks: usize) -> Self {
        Self {
            read_chunk_size: read_chunk_size.max(1),
            max_buffered_chunks: max_buffered_chunks.max(1),
            ..Self::default()
        }
    }

    /// Pipe sized for segments of at most `max_buffer_length` payload bytes
    pub fn for_payloads(max_buffer_length: usize) -> Self {
        Self::default().with_max_frame_length(max_frame_length(max_buffer_length))
    }

    /// Fail the run on any frame longer than `max_frame_length` bytes,
    /// delimiter excluded
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Feed frames from `reader` to `handler` until end of stream, a
    /// [`FrameAction::Stop`], or cancellation of `token`.
    ///
    /// Cancellation returns `Ok(())`. A trailing partial frame at end of
    /// stream is discarded. The first error from either loop is returned and
    /// the other loop is dropped with it, so no task outlives the call.
    pub async fn run<R, H>(
        &self,
        reader: R,
        handler: &mut H,
        token: &CancellationToken,
    ) -> Result<(), StressError>
    where
        R: AsyncRead + Unpin + Send,
        H: FrameHandler + ?Sized,
    {
        let (chunks_tx, chunks_rx) = mpsc::channel(self.max_buffered_chunks);

        let fill = fill_channel(reader, chunks_tx, self.read_chunk_size);
        let drain = drain_frames(chunks_rx, handler, self.max_frame_length);
        tokio::pin!(fill);
        tokio::pin!(drain);

        let pump = async {
            tokio::select! {
                res = &mut drain => res,
                res = &mut fill => {
                    // Producer is done and its sender dropped; the consumer
                    // finishes once the buffered chunks are scanned.
                    res?;
                    (&mut drain).await
                }
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(()),
            res = pump => res,
        }
    }
}

async fn fill_channel<R>(
    mut reader: R,
    chunks: mpsc::Sender<Bytes>,
    read_chunk_size: usize,
) -> Result<(), StressError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(read_chunk_size);
    loop {
        buffer.reserve(read_chunk_size);
        let read = reader.read_buf(&mut buffer).await?;
        if read == 0 {
            debug!("transport reached end of stream");
            return Ok(());
        }
        if chunks.send(buffer.split().freeze()).await.is_err() {
            // Consumer stopped.
            return Ok(());
        }
    }
}

async fn drain_frames<H>(
    mut chunks: mpsc::Receiver<Bytes>,
    handler: &mut H,
    max_frame_length: usize,
) -> Result<(), StressError>
where
    H: FrameHandler + ?Sized,
{
    let mut pending = BytesMut::new();
    // Bytes of `pending` already known to contain no delimiter.
    let mut scanned = 0;

    while let Some(chunk) = chunks.recv().await {
        pending.extend_from_slice(&chunk);

        while let Some(offset) = pending[scanned..].iter().position(|&b| b == FRAME_DELIMITER) {
            let end = scanned + offset;
            if end > max_frame_length {
                return Err(frame_too_long(end, max_frame_length));
            }
            let mut frame = pending.split_to(end + 1);
            frame.truncate(end);
            scanned = 0;

            if handler.on_frame(frame.freeze()).await? == FrameAction::Stop {
                return Ok(());
            }
        }
        scanned = pending.len();
        if scanned > max_frame_length {
            return Err(frame_too_long(scanned, max_frame_length));
        }
    }

    if !pending.is_empty() {
        debug!("discarding {} trailing bytes without delimiter", pending.len());
    }
    Ok(())
}

fn frame_too_long(length: usize, max_frame_length: usize) -> StressError {
    StressError::mismatch(format!(
        "frame of at least {} bytes exceeds the maximum of {}",
        length, max_frame_length
    ))
}
