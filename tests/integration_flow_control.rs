use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use stream_stress::{
    checksum::checksum,
    results::ResultAggregator,
    session::{run_client_session, ClientSessionParams, Sender, SessionState},
    BufferPool, SessionLimits, SessionOutcome, StressError,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

fn params(limits: SessionLimits, lifetime: Duration) -> ClientSessionParams {
    ClientSessionParams {
        lifetime,
        max_buffer_length: 64,
        limits,
        payload_seed: 17,
        fault_seed: None,
    }
}

/// The sender stops at one message over the high water mark and only
/// resumes once the in-flight count drops below the low water mark.
#[tokio::test(start_paused = true)]
async fn sender_respects_water_marks() {
    let pool = BufferPool::for_workers(1, 64);
    let state = Arc::new(SessionState::new());
    let limits = SessionLimits {
        high_water_mark: 10,
        low_water_mark: 4,
        ..SessionLimits::default()
    };
    let sender = Sender::new(
        tokio::io::sink(),
        Arc::clone(&state),
        Arc::clone(&pool),
        StdRng::seed_from_u64(1),
        None,
        64,
        limits,
        Instant::now() + Duration::from_secs(3600),
    );
    let task = tokio::spawn(sender.run());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(state.in_flight(), 11);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(state.in_flight(), 11);

    // Down to the low water mark: still paused.
    for _ in 0..7 {
        state.record_read();
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(state.in_flight(), 4);

    state.record_read();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(state.in_flight(), 11);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(pool.outstanding(), 0);
}

/// A peer that swallows everything and never echoes stalls the session; the
/// failure is classified as a stall and every buffer is returned.
#[tokio::test(start_paused = true)]
async fn silent_peer_fails_with_stall() {
    let pool = BufferPool::for_workers(1, 64);
    let (client, mut peer) = tokio::io::duplex(4096);
    tokio::spawn(async move { tokio::io::copy(&mut peer, &mut tokio::io::sink()).await });

    let limits = SessionLimits {
        high_water_mark: 20,
        low_water_mark: 10,
        stall_threshold: Duration::from_secs(1),
        monitor_interval: Duration::from_millis(100),
        ..SessionLimits::default()
    };
    let started = Instant::now();
    let outcome = run_client_session(
        client,
        Arc::clone(&pool),
        params(limits, Duration::from_secs(60)),
        &CancellationToken::new(),
    )
    .await;

    let error = match outcome {
        SessionOutcome::Failed(e) => e,
        other => panic!("expected a stall, got {:?}", other),
    };
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        error.downcast_ref::<StressError>().map(StressError::kind),
        Some("Stall")
    );

    let aggregator = ResultAggregator::new(1);
    aggregator.record_failure(0, &error, None);
    assert_eq!(aggregator.errors().error_types()[0].key[0].kind, "Stall");
    assert_eq!(pool.outstanding(), 0);
}

/// A peer echoing a corrupted frame ends the session with a data mismatch
/// without leaking pooled buffers.
#[tokio::test]
async fn corrupted_echo_fails_session_and_releases_buffers() {
    let pool = BufferPool::for_workers(1, 64);
    let (client, peer) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(peer);
        let mut reader = BufReader::new(reader);
        let mut frame = Vec::new();
        if matches!(reader.read_until(b'\n', &mut frame).await, Ok(n) if n > 0) {
            let bogus = format!("3,{},abd\n", checksum(b"abc"));
            let _ = writer.write_all(bogus.as_bytes()).await;
        }
        // Keep draining until the client goes away.
        loop {
            frame.clear();
            match reader.read_until(b'\n', &mut frame).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let limits = SessionLimits::default();
    let outcome = run_client_session(
        client,
        Arc::clone(&pool),
        params(limits, Duration::from_secs(60)),
        &CancellationToken::new(),
    )
    .await;

    match outcome {
        SessionOutcome::Failed(e) => {
            let error = e.downcast_ref::<StressError>().expect("typed error");
            assert!(error.is_data_mismatch(), "{}", error);
        }
        other => panic!("expected a data mismatch, got {:?}", other),
    }
    assert_eq!(pool.outstanding(), 0);
}

/// A peer that hangs up mid-exchange fails the session with a transport
/// error and every pooled buffer comes back.
#[tokio::test]
async fn dropped_connection_fails_session_and_releases_buffers() {
    let pool = BufferPool::for_workers(1, 64);
    let (client, peer) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let mut reader = BufReader::new(peer);
        let mut frame = Vec::new();
        for _ in 0..3 {
            frame.clear();
            if !matches!(reader.read_until(b'\n', &mut frame).await, Ok(n) if n > 0) {
                break;
            }
        }
        // Dropping the reader closes both directions.
    });

    let outcome = run_client_session(
        client,
        Arc::clone(&pool),
        params(SessionLimits::default(), Duration::from_secs(60)),
        &CancellationToken::new(),
    )
    .await;

    match outcome {
        SessionOutcome::Failed(e) => {
            let error = e.downcast_ref::<StressError>().expect("typed error");
            assert_eq!(error.kind(), "Io", "{}", error);
        }
        other => panic!("expected a transport failure, got {:?}", other),
    }
    assert_eq!(pool.outstanding(), 0);
}

/// Tripping the session token mid-exchange is a cancellation, not a failure.
#[tokio::test]
async fn cancelled_session_is_not_a_failure() {
    let pool = BufferPool::for_workers(1, 64);
    let (client, mut peer) = tokio::io::duplex(4096);
    tokio::spawn(async move { tokio::io::copy(&mut peer, &mut tokio::io::sink()).await });

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let outcome = run_client_session(
        client,
        Arc::clone(&pool),
        params(SessionLimits::default(), Duration::from_secs(60)),
        &token,
    )
    .await;
    assert!(outcome.is_cancelled());
    assert_eq!(pool.outstanding(), 0);
}
