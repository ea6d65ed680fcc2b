//! Rate-limited dispatch — bounded job queue, worker pool, sliding-window
//! rate limiter, transport seam.
//!
//! Workers never touch the ledger. Every delivery outcome is reported back
//! to the engine over the outcome channel; the engine alone confirms.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duewatch_core::error::{DuewatchError, Result};
use duewatch_core::types::Threshold;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

/// A unit of deliverable work: "send this reminder".
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub deadline_id: String,
    pub threshold: Threshold,
    /// Recipient (chat) identifier.
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub due_at: DateTime<Utc>,
    /// IANA timezone of the recipient — rendering only.
    pub timezone: String,
    /// Fired later than one scan cadence after it became due.
    pub late: bool,
    /// Delivery failures so far (ledger-owned count).
    pub attempt: u32,
}

/// Terminal result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Worth retrying: throttling, timeouts, 5xx.
    TransientFailure(String),
    /// Never retried: recipient unreachable, blocked, malformed target.
    PermanentFailure(String),
}

/// Outbound transport. Implementations live in duewatch-channels.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, job: &DispatchJob) -> Outcome;
}

/// Process-wide sliding-window rate limiter. `acquire` resolves once a slot
/// frees up, so outbound traffic never exceeds `max_calls` per `window`.
pub struct RateLimiter {
    window: Duration,
    max_calls: usize,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            window,
            max_calls,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait for a free slot in the current window, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    calls.pop_front();
                }
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }
                match calls.front() {
                    Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Exponential backoff for transient failures: base * 2^(attempt-1), capped.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exp)).min(max)
}

/// Cloneable handle for enqueuing dispatch jobs. Dropping every clone closes
/// the queue and lets the workers drain out.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<DispatchJob>,
}

impl Dispatcher {
    pub async fn enqueue(&self, job: DispatchJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| DuewatchError::Dispatch("job queue closed".into()))
    }
}

/// Spawn the dispatch worker pool. Each worker pulls a job, waits on the
/// rate limiter, delivers through the transport, and reports the outcome.
pub fn spawn_workers(
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    workers: usize,
    queue_capacity: usize,
) -> (
    Dispatcher,
    mpsc::Receiver<(DispatchJob, Outcome)>,
    Vec<tokio::task::JoinHandle<()>>,
) {
    let (tx, rx) = mpsc::channel::<DispatchJob>(queue_capacity);
    let (outcome_tx, outcome_rx) = mpsc::channel(queue_capacity);
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let rx = rx.clone();
        let transport = transport.clone();
        let limiter = limiter.clone();
        let outcome_tx = outcome_tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(job) = job else { break };

                limiter.acquire().await;
                tracing::debug!(
                    "📤 worker {worker}: delivering {} [{}] via {}",
                    job.deadline_id,
                    job.threshold.key(),
                    transport.name()
                );
                let outcome = transport.deliver(&job).await;
                if outcome_tx.send((job, outcome)).await.is_err() {
                    break; // engine gone
                }
            }
        }));
    }
    (Dispatcher { tx }, outcome_rx, handles)
}
