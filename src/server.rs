//! Echo server.
//!
//! Every validated frame is written straight back. An empty frame (or a
//! zero-length segment) is the client's end-of-stream sentinel: it is echoed
//! once and the connection is torn down.

use crate::error::StressError;
use crate::framing::{FrameAction, FrameHandler, LineFramingPipe, FRAME_DELIMITER};
use crate::segment::{BufferPool, DataSegment};
use crate::serializer::DataSegmentSerializer;
use crate::session::{monitor, SessionLimits, SessionState};
use crate::transport;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server-side settings shared by all connections
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub limits: SessionLimits,
    /// Largest payload accepted from a client
    pub max_buffer_length: usize,
    /// Log data mismatches and connection failures
    pub log_errors: bool,
}

/// Frame handler echoing segments back to the client
pub struct EchoHandler<W> {
    writer: W,
    pool: Arc<BufferPool>,
    serializer: DataSegmentSerializer,
    state: Arc<SessionState>,
    log_errors: bool,
}

impl<W> EchoHandler<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        writer: W,
        pool: Arc<BufferPool>,
        state: Arc<SessionState>,
        max_buffer_length: usize,
        log_errors: bool,
    ) -> Self {
        Self {
            writer,
            serializer: DataSegmentSerializer::new(Arc::clone(&pool), max_buffer_length),
            pool,
            state,
            log_errors,
        }
    }

    async fn echo(&mut self, segment: &DataSegment) -> Result<(), StressError> {
        self.serializer
            .serialize(&mut self.writer, segment, None)
            .await?;
        self.writer.write_all(&[FRAME_DELIMITER]).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn echo_sentinel(&mut self) -> Result<FrameAction, StressError> {
        debug!("client sent the sentinel, echoing and closing");
        let sentinel = DataSegment::empty(&self.pool);
        self.echo(&sentinel).await?;
        Ok(FrameAction::Stop)
    }
}

#[async_trait]
impl<W> FrameHandler for EchoHandler<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn on_frame(&mut self, frame: Bytes) -> Result<FrameAction, StressError> {
        self.state.stamp_read();
        if frame.is_empty() {
            return self.echo_sentinel().await;
        }

        match self.serializer.deserialize(frame) {
            Ok(segment) if segment.is_empty() => {
                segment.release();
                self.echo_sentinel().await
            }
            Ok(segment) => {
                let echoed = self.echo(&segment).await;
                segment.release();
                echoed?;
                self.state.stamp_write();
                Ok(FrameAction::Continue)
            }
            Err(StressError::DataMismatch(message)) => {
                // The client will notice the missing echo; keep serving.
                if self.log_errors {
                    warn!("Server: {}", message);
                }
                Ok(FrameAction::Continue)
            }
            Err(e) => Err(e),
        }
    }
}

/// Serve one connection until the sentinel exchange, end of stream,
/// cancellation of `token`, or a read stall.
pub async fn handle_connection<S>(
    stream: S,
    pool: Arc<BufferPool>,
    settings: &ServerSettings,
    token: &CancellationToken,
) -> Result<(), StressError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(stream);
    let state = Arc::new(SessionState::new());
    let completion = token.child_token();

    let echo = async {
        let mut handler = EchoHandler::new(
            writer,
            pool,
            Arc::clone(&state),
            settings.max_buffer_length,
            settings.log_errors,
        );
        let res = LineFramingPipe::for_payloads(settings.max_buffer_length)
            .run(reader, &mut handler, &completion)
            .await;
        completion.cancel();
        res
    };
    let watchdog = monitor(&state, &settings.limits, &completion, false);

    tokio::try_join!(echo, watchdog).map(|_| ())
}

/// TCP echo server running a fixed set of accept workers
pub struct StressServer {
    listener: Arc<TcpListener>,
    pool: Arc<BufferPool>,
    settings: ServerSettings,
    workers: usize,
}

impl StressServer {
    /// Bind the listener; connections are not accepted until [`run`](Self::run)
    pub async fn bind(
        endpoint: SocketAddr,
        pool: Arc<BufferPool>,
        settings: ServerSettings,
        workers: usize,
    ) -> Result<Self, StressError> {
        let listener = transport::bind(endpoint)?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener: Arc::new(listener),
            pool,
            settings,
            workers: workers.max(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StressError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            handles.push(tokio::spawn(accept_loop(
                worker_id,
                Arc::clone(&self.listener),
                Arc::clone(&self.pool),
                self.settings.clone(),
                token.clone(),
            )));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Server worker task failed: {}", e);
            }
        }
        debug!("Server stopped");
    }
}

async fn accept_loop(
    worker_id: usize,
    listener: Arc<TcpListener>,
    pool: Arc<BufferPool>,
    settings: ServerSettings,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let result = match accepted {
            Ok((stream, peer)) => {
                debug!("Server worker {} accepted {}", worker_id, peer);
                match transport::configure(&stream) {
                    Ok(()) => handle_connection(stream, Arc::clone(&pool), &settings, &token).await,
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            if settings.log_errors {
                error!("Server: unhandled exception: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn settings() -> ServerSettings {
        ServerSettings {
            limits: SessionLimits::default(),
            max_buffer_length: 64,
            log_errors: true,
        }
    }

    #[tokio::test]
    async fn test_echoes_frames_and_sentinel() {
        let pool = BufferPool::for_workers(1, 64);
        let (mut client, server) = tokio::io::duplex(1024);
        let server_pool = Arc::clone(&pool);
        let server = tokio::spawn(async move {
            handle_connection(server, server_pool, &settings(), &CancellationToken::new()).await
        });

        let frame = format!("5,{},hello\n", checksum(b"hello"));
        client.write_all(frame.as_bytes()).await.unwrap();
        // Corrupted frame is skipped without an echo.
        client.write_all(b"5,1,hello\n").await.unwrap();
        client.write_all(b"0,0,\n").await.unwrap();

        server.await.unwrap().unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, format!("{}0,0,\n", frame).into_bytes());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_literal_empty_line_is_sentinel() {
        let pool = BufferPool::for_workers(1, 64);
        let (mut client, server) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            handle_connection(server, pool, &settings(), &CancellationToken::new()).await
        });
        client.write_all(b"\n").await.unwrap();
        server.await.unwrap().unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"0,0,\n");
    }

    #[tokio::test]
    async fn test_oversized_payload_is_not_echoed() {
        let pool = BufferPool::for_workers(1, 64);
        let (mut client, server) = tokio::io::duplex(1024);
        let server_pool = Arc::clone(&pool);
        let server = tokio::spawn(async move {
            handle_connection(server, server_pool, &settings(), &CancellationToken::new()).await
        });

        // Fits the frame limit but not the payload limit: skipped.
        let payload = [b'a'; 65];
        let mut frame = format!("65,{},", checksum(&payload)).into_bytes();
        frame.extend_from_slice(&payload);
        frame.push(FRAME_DELIMITER);
        client.write_all(&frame).await.unwrap();
        client.write_all(b"0,0,\n").await.unwrap();

        server.await.unwrap().unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"0,0,\n");
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_huge_frame_drops_connection() {
        let pool = BufferPool::for_workers(1, 64);
        let (client, server) = tokio::io::duplex(4096);
        let server_pool = Arc::clone(&pool);
        let server = tokio::spawn(async move {
            handle_connection(server, server_pool, &settings(), &CancellationToken::new()).await
        });

        let (mut reader, mut writer) = tokio::io::split(client);
        let sending = tokio::spawn(async move {
            let payload = vec![b'a'; 100_000];
            let mut frame = format!("{},{},", payload.len(), checksum(&payload)).into_bytes();
            frame.extend_from_slice(&payload);
            frame.extend_from_slice(b"\n0,0,\n");
            // The server hangs up part way through.
            let _ = writer.write_all(&frame).await;
        });

        let err = server.await.unwrap().unwrap_err();
        assert!(err.is_data_mismatch(), "{}", err);
        sending.await.unwrap();

        let mut echoed = Vec::new();
        reader.read_to_end(&mut echoed).await.unwrap();
        assert!(echoed.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_client_stalls() {
        let pool = BufferPool::for_workers(1, 64);
        let (_client, server) = tokio::io::duplex(1024);
        let settings = ServerSettings {
            limits: SessionLimits {
                stall_threshold: Duration::from_secs(3),
                monitor_interval: Duration::from_secs(1),
                ..Default::default()
            },
            max_buffer_length: 64,
            log_errors: false,
        };
        let err = handle_connection(server, pool, &settings, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Stall");
    }
}
