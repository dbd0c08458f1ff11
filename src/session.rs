//! Per-connection duplex exchange.
//!
//! A client session runs three loops on one connection:
//!
//! - **Sender** writes random segments, throttled on the number of
//!   in-flight (sent but not yet echoed) messages, and finishes with a
//!   zero-length sentinel once the session lifetime expires.
//! - **Receiver** reassembles echoed frames, validates them and decrements
//!   the in-flight count; the echoed sentinel completes the session.
//! - **Monitor** fails the session when either direction goes quiet for
//!   longer than the stall threshold.
//!
//! The loops share [`SessionState`] through atomics, each field having a
//! single writer. They are joined fail-fast: the first error drops the
//! other two, and every pooled segment they hold is returned on the way out.

use crate::error::{StallDirection, StressError};
use crate::framing::{FrameAction, FrameHandler, LineFramingPipe, FRAME_DELIMITER};
use crate::segment::{BufferPool, DataSegment};
use crate::serializer::DataSegmentSerializer;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Sender pauses longer than this are logged once
const LONG_PAUSE: Duration = Duration::from_secs(1);

/// Flow-control and liveness tuning for one session
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// In-flight count above which the sender pauses
    pub high_water_mark: i64,
    /// In-flight count below which a paused sender resumes
    pub low_water_mark: i64,
    /// Idle time after which a direction counts as stalled
    pub stall_threshold: Duration,
    /// Period of the liveness check
    pub monitor_interval: Duration,
    /// Poll period while the sender is paused
    pub backpressure_poll: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            high_water_mark: crate::defaults::HIGH_WATER_MARK,
            low_water_mark: crate::defaults::LOW_WATER_MARK,
            stall_threshold: crate::defaults::STALL_THRESHOLD,
            monitor_interval: crate::defaults::MONITOR_INTERVAL,
            backpressure_poll: Duration::from_millis(10),
        }
    }
}

/// Mutable state shared by the loops of one session
#[derive(Debug)]
pub struct SessionState {
    started: Instant,
    in_flight: AtomicI64,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    // Set while the sender is deliberately not writing.
    writes_suspended: AtomicBool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            in_flight: AtomicI64::new(0),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            writes_suspended: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// A data frame went out.
    pub fn record_write(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.stamp_write();
    }

    /// A data frame came back and validated.
    pub fn record_read(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.stamp_read();
    }

    pub fn stamp_write(&self) {
        self.last_write_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn stamp_read(&self) {
        self.last_read_ms.store(self.now_ms(), Ordering::Release);
    }

    /// Exempt the write direction from stall checks, or restore it.
    ///
    /// Resuming counts as a write so the idle time restarts.
    pub fn suspend_writes(&self, suspended: bool) {
        if !suspended {
            self.stamp_write();
        }
        self.writes_suspended.store(suspended, Ordering::Release);
    }

    pub fn writes_suspended(&self) -> bool {
        self.writes_suspended.load(Ordering::Acquire)
    }

    pub fn since_last_read(&self) -> Duration {
        let last = self.last_read_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub fn since_last_write(&self) -> Duration {
        let last = self.last_write_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Sentinel handshake finished on both sides
    Completed,
    /// The session or global cancellation token fired first
    Cancelled,
    /// Any error, including a stall
    Failed(anyhow::Error),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionOutcome::Cancelled)
    }
}

/// Writing side of a client session
pub struct Sender<W> {
    writer: W,
    state: Arc<SessionState>,
    pool: Arc<BufferPool>,
    serializer: DataSegmentSerializer,
    rng: StdRng,
    fault_rng: Option<StdRng>,
    max_buffer_length: usize,
    limits: SessionLimits,
    lifetime_deadline: Instant,
}

impl<W> Sender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: W,
        state: Arc<SessionState>,
        pool: Arc<BufferPool>,
        rng: StdRng,
        fault_rng: Option<StdRng>,
        max_buffer_length: usize,
        limits: SessionLimits,
        lifetime_deadline: Instant,
    ) -> Self {
        Self {
            writer,
            state,
            serializer: DataSegmentSerializer::new(Arc::clone(&pool), max_buffer_length),
            pool,
            rng,
            fault_rng,
            max_buffer_length,
            limits,
            lifetime_deadline,
        }
    }

    /// Send random segments until the lifetime expires, then the sentinel.
    ///
    /// The transport is left open; the peer's echo ends the session.
    pub async fn run(mut self) -> Result<(), StressError> {
        while Instant::now() < self.lifetime_deadline {
            self.apply_backpressure().await;

            let segment = DataSegment::random(&self.pool, &mut self.rng, self.max_buffer_length);
            self.serializer
                .serialize(&mut self.writer, &segment, self.fault_rng.as_mut())
                .await?;
            self.writer.write_all(&[FRAME_DELIMITER]).await?;
            self.writer.flush().await?;
            self.state.record_write();
            segment.release();
        }

        debug!("session lifetime expired, sending sentinel");
        let sentinel = DataSegment::empty(&self.pool);
        self.serializer
            .serialize(&mut self.writer, &sentinel, None)
            .await?;
        self.writer.write_all(&[FRAME_DELIMITER]).await?;
        self.writer.flush().await?;
        // Only echoes are expected from here on.
        self.state.suspend_writes(true);
        Ok(())
    }

    async fn apply_backpressure(&self) {
        if self.state.in_flight() <= self.limits.high_water_mark {
            return;
        }

        self.state.suspend_writes(true);
        let paused_at = Instant::now();
        let mut reported = false;
        while self.state.in_flight() >= self.limits.low_water_mark {
            sleep(self.limits.backpressure_poll).await;
            if !reported && paused_at.elapsed() > LONG_PAUSE {
                warn!(
                    "sender paused by backpressure for {:?} ({} messages in flight)",
                    paused_at.elapsed(),
                    self.state.in_flight()
                );
                reported = true;
            }
        }
        self.state.suspend_writes(false);
    }
}

/// Reading side of a client session
pub struct ClientReceiver {
    serializer: DataSegmentSerializer,
    state: Arc<SessionState>,
    lifetime_deadline: Instant,
    completion: CancellationToken,
}

impl ClientReceiver {
    pub fn new(
        pool: Arc<BufferPool>,
        state: Arc<SessionState>,
        max_buffer_length: usize,
        lifetime_deadline: Instant,
        completion: CancellationToken,
    ) -> Self {
        Self {
            serializer: DataSegmentSerializer::new(pool, max_buffer_length),
            state,
            lifetime_deadline,
            completion,
        }
    }

    fn on_sentinel(&mut self) -> Result<FrameAction, StressError> {
        if Instant::now() < self.lifetime_deadline {
            return Err(StressError::mismatch(
                "received end-of-stream sentinel before the session lifetime expired",
            ));
        }
        debug!("peer echoed the sentinel, session complete");
        self.completion.cancel();
        Ok(FrameAction::Stop)
    }
}

#[async_trait]
impl FrameHandler for ClientReceiver {
    async fn on_frame(&mut self, frame: Bytes) -> Result<FrameAction, StressError> {
        if frame.is_empty() {
            return self.on_sentinel();
        }

        let segment = self.serializer.deserialize(frame)?;
        if segment.is_empty() {
            segment.release();
            return self.on_sentinel();
        }
        self.state.record_read();
        segment.release();
        Ok(FrameAction::Continue)
    }
}

/// Fail with a stall error once a watched direction goes quiet.
///
/// Returns `Ok(())` when `completion` is cancelled.
pub async fn monitor(
    state: &SessionState,
    limits: &SessionLimits,
    completion: &CancellationToken,
    watch_writes: bool,
) -> Result<(), StressError> {
    loop {
        tokio::select! {
            _ = completion.cancelled() => return Ok(()),
            _ = sleep(limits.monitor_interval) => {}
        }

        if watch_writes && !state.writes_suspended() {
            let idle = state.since_last_write();
            if idle > limits.stall_threshold {
                return Err(StressError::Stall {
                    direction: StallDirection::Write,
                    idle,
                });
            }
        }

        let idle = state.since_last_read();
        if idle > limits.stall_threshold {
            return Err(StressError::Stall {
                direction: StallDirection::Read,
                idle,
            });
        }
    }
}

/// Parameters of one client session
#[derive(Debug, Clone)]
pub struct ClientSessionParams {
    pub lifetime: Duration,
    pub max_buffer_length: usize,
    pub limits: SessionLimits,
    pub payload_seed: u64,
    /// Seed for randomized chunked writes; `None` writes each payload whole
    pub fault_seed: Option<u64>,
}

/// Drive one client session over `stream` until the sentinel handshake
/// completes, `token` is cancelled, or a loop fails.
pub async fn run_client_session<S>(
    stream: S,
    pool: Arc<BufferPool>,
    params: ClientSessionParams,
    token: &CancellationToken,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Send,
{
    use rand::SeedableRng;

    let (reader, writer) = tokio::io::split(stream);
    let state = Arc::new(SessionState::new());
    let completion = CancellationToken::new();
    let lifetime_deadline = Instant::now() + params.lifetime;

    let sender = Sender::new(
        writer,
        Arc::clone(&state),
        Arc::clone(&pool),
        StdRng::seed_from_u64(params.payload_seed),
        params.fault_seed.map(StdRng::seed_from_u64),
        params.max_buffer_length,
        params.limits.clone(),
        lifetime_deadline,
    )
    .run();

    let receiver = async {
        let mut handler = ClientReceiver::new(
            Arc::clone(&pool),
            Arc::clone(&state),
            params.max_buffer_length,
            lifetime_deadline,
            completion.clone(),
        );
        LineFramingPipe::for_payloads(params.max_buffer_length)
            .run(reader, &mut handler, &CancellationToken::new())
            .await?;
        if completion.is_cancelled() {
            Ok(())
        } else {
            Err(StressError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before the sentinel was echoed",
            )))
        }
    };

    let watchdog = monitor(&state, &params.limits, &completion, true);

    let exchange = async { tokio::try_join!(sender, receiver, watchdog).map(|_| ()) };

    tokio::select! {
        biased;
        _ = token.cancelled() => SessionOutcome::Cancelled,
        res = exchange => match res {
            Ok(()) => SessionOutcome::Completed,
            Err(e) => SessionOutcome::Failed(e.into()),
        },
    }
}

/// Process-level guard against sessions that never reach an outcome.
///
/// Fires `on_hang` if still armed at `deadline`; dropping the watchdog
/// disarms it.
pub struct HangWatchdog {
    _disarm: DropGuard,
}

impl HangWatchdog {
    pub fn arm<F>(deadline: Instant, on_hang: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let disarmed = CancellationToken::new();
        let guard = disarmed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = sleep_until(deadline) => on_hang(),
            }
        });
        Self {
            _disarm: disarmed.drop_guard(),
        }
    }
}
