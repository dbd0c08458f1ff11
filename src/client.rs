//! Stress client.
//!
//! Each worker runs sessions back to back on fresh connections. A session
//! gets a random lifetime and a random cancellation deadline; with the
//! configured probability the deadline lands inside the lifetime and the
//! session is cut short, otherwise the session has to complete the sentinel
//! handshake on its own. A hang watchdog terminates the process when a
//! session outlives its deadline by more than the grace period.

use crate::cli::StressConfig;
use crate::results::ResultAggregator;
use crate::segment::BufferPool;
use crate::session::{run_client_session, ClientSessionParams, HangWatchdog, SessionOutcome};
use crate::transport::{self, CountingStream};
use crate::utils::derive_seed;
use anyhow::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause after a failed connection attempt
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Randomized timing of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPlan {
    pub lifetime: Duration,
    /// Delay after which the session is cancelled
    pub cancel_after: Duration,
}

impl SessionPlan {
    /// Lifetime uniform in `[min_lifetime, max_lifetime]`. With
    /// `cancellation_probability` the cancellation lands at a random point
    /// inside the lifetime, otherwise `grace` after it.
    pub fn random<R: Rng + ?Sized>(
        rng: &mut R,
        min_lifetime: Duration,
        max_lifetime: Duration,
        cancellation_probability: f64,
        grace: Duration,
    ) -> Self {
        let lifetime = if min_lifetime >= max_lifetime {
            min_lifetime
        } else {
            rng.gen_range(min_lifetime..=max_lifetime)
        };
        let cancel_after = if rng.gen_bool(cancellation_probability.clamp(0.0, 1.0)) {
            lifetime.mul_f64(rng.gen::<f64>())
        } else {
            lifetime + grace
        };
        Self {
            lifetime,
            cancel_after,
        }
    }

    pub fn cancels_early(&self) -> bool {
        self.cancel_after < self.lifetime
    }
}

/// Pool of client workers hammering one server endpoint
pub struct StressClient {
    config: Arc<StressConfig>,
    endpoint: SocketAddr,
    aggregator: Arc<ResultAggregator>,
    pool: Arc<BufferPool>,
}

impl StressClient {
    pub fn new(
        config: Arc<StressConfig>,
        endpoint: SocketAddr,
        aggregator: Arc<ResultAggregator>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            config,
            endpoint,
            aggregator,
            pool,
        }
    }

    /// Run all workers until `token` is cancelled
    pub async fn run(self, token: CancellationToken) {
        info!(
            "Client starting {} workers against {}",
            self.config.num_connections, self.endpoint
        );
        let mut handles = Vec::with_capacity(self.config.num_connections);
        for worker_id in 0..self.config.num_connections {
            let worker = Worker {
                id: worker_id,
                config: Arc::clone(&self.config),
                endpoint: self.endpoint,
                aggregator: Arc::clone(&self.aggregator),
                pool: Arc::clone(&self.pool),
            };
            handles.push(tokio::spawn(worker.run(token.clone())));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Client worker task failed: {}", e);
            }
        }
        debug!("Client stopped");
    }
}

struct Worker {
    id: usize,
    config: Arc<StressConfig>,
    endpoint: SocketAddr,
    aggregator: Arc<ResultAggregator>,
    pool: Arc<BufferPool>,
}

impl Worker {
    async fn run(self, token: CancellationToken) {
        let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, self.id as u64));
        let mut job_id: u64 = 0;

        while !token.is_cancelled() {
            job_id += 1;
            let plan = SessionPlan::random(
                &mut rng,
                self.config.min_connection_lifetime,
                self.config.max_connection_lifetime,
                self.config.cancellation_probability,
                self.config.watchdog_grace,
            );
            let params = ClientSessionParams {
                lifetime: plan.lifetime,
                max_buffer_length: self.config.max_buffer_length,
                limits: self.config.session_limits(),
                payload_seed: rng.gen(),
                fault_seed: if self.config.fault_injection {
                    Some(rng.gen())
                } else {
                    None
                },
            };

            let outcome = self.run_session(job_id, plan, params, &token).await;
            match outcome {
                SessionOutcome::Completed => self.aggregator.record_success(self.id),
                SessionOutcome::Cancelled => self.aggregator.record_cancellation(self.id),
                SessionOutcome::Failed(e) => {
                    self.aggregator
                        .record_failure(self.id, &e, Some(format!("Worker #{}", self.id)))
                }
            }
        }
        debug!("Worker #{} stopped after {} sessions", self.id, job_id);
    }

    async fn run_session(
        &self,
        job_id: u64,
        plan: SessionPlan,
        params: ClientSessionParams,
        token: &CancellationToken,
    ) -> SessionOutcome {
        debug!(
            "Worker #{} job {}: lifetime {:?}, cancel after {:?}",
            self.id, job_id, plan.lifetime, plan.cancel_after
        );
        let session_token = token.child_token();

        let canceller = {
            let session_token = session_token.clone();
            let cancel_after = plan.cancel_after;
            tokio::spawn(async move {
                sleep(cancel_after).await;
                session_token.cancel();
            })
        };

        let worker_id = self.id;
        let _watchdog = HangWatchdog::arm(
            Instant::now() + plan.cancel_after + self.config.watchdog_grace,
            move || {
                error!(
                    "Worker #{} job {}: session made no progress past its deadline, terminating",
                    worker_id, job_id
                );
                std::process::exit(crate::defaults::EXIT_HANG);
            },
        );

        let outcome = match self.connect(&session_token).await {
            Ok(Some(stream)) => {
                let stream = CountingStream::new(stream, self.aggregator.counter(self.id));
                run_client_session(stream, Arc::clone(&self.pool), params, &session_token).await
            }
            Ok(None) => SessionOutcome::Cancelled,
            Err(e) => {
                tokio::select! {
                    _ = session_token.cancelled() => {}
                    _ = sleep(CONNECT_RETRY_DELAY) => {}
                }
                SessionOutcome::Failed(e)
            }
        };
        canceller.abort();
        outcome
    }

    async fn connect(
        &self,
        token: &CancellationToken,
    ) -> anyhow::Result<Option<tokio::net::TcpStream>> {
        tokio::select! {
            _ = token.cancelled() => Ok(None),
            stream = transport::connect(self.endpoint) => stream
                .map(Some)
                .with_context(|| format!("failed to connect to {}", self.endpoint)),
        }
    }
}
