//! Scheduler engine — two periodic scan drivers around the ledger.
//!
//! The upcoming scan is the fast path over deadlines inside the widest
//! threshold window. Reconciliation sweeps everything, re-drives stranded
//! reservations, and expires over-budget retries. The drivers share only
//! the ledger, whose conditional-insert `reserve` serializes per key.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use duewatch_core::config::{DispatchConfig, RateLimitConfig, SchedulerConfig};
use duewatch_core::error::Result;
use duewatch_core::types::{Deadline, NotificationPreference, Threshold};
use tokio::sync::{mpsc, watch};

use crate::clock::Clock;
use crate::dispatch::{
    DispatchJob, Dispatcher, Outcome, RateLimiter, Transport, backoff_delay, spawn_workers,
};
use crate::evaluate::{DueThreshold, EvaluatePolicy, due_thresholds};
use crate::ledger::{NotificationLedger, Reservation, RetryDecision, StaleReservation};
use crate::store::DeadlineStore;

/// Snapshot for the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub last_upcoming_scan: Option<DateTime<Utc>>,
    pub last_reconciliation: Option<DateTime<Utc>>,
    pub pending: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
    Upcoming,
    Reconcile,
}

/// Last-started/completed instants per cadence. Only an optimization
/// against redundant rescans inside one tick; restarting from empty is
/// always safe — the ledger is the correctness source of truth.
#[derive(Debug, Default)]
struct ScanCursor {
    upcoming_started: Option<DateTime<Utc>>,
    upcoming_completed: Option<DateTime<Utc>>,
    reconcile_started: Option<DateTime<Utc>>,
    reconcile_completed: Option<DateTime<Utc>>,
}

/// The scheduling core. Construct with [`SchedulerEngine::new`] (spawns the
/// dispatch workers), then call [`SchedulerEngine::start`] to run the scan
/// drivers and outcome loop.
pub struct SchedulerEngine {
    store: Arc<dyn DeadlineStore>,
    ledger: Arc<NotificationLedger>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    dispatch_config: DispatchConfig,
    /// Taken on shutdown so the job queue closes and the workers drain out.
    dispatcher: Mutex<Option<Dispatcher>>,
    outcome_rx: tokio::sync::Mutex<Option<mpsc::Receiver<(DispatchJob, Outcome)>>>,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    cursor: Mutex<ScanCursor>,
}

impl SchedulerEngine {
    /// Build the engine and spawn its dispatch worker pool. Must run inside
    /// a tokio runtime.
    pub fn new(
        store: Arc<dyn DeadlineStore>,
        ledger: Arc<NotificationLedger>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        dispatch_config: DispatchConfig,
        rate_limit: RateLimitConfig,
    ) -> Arc<Self> {
        let limiter = Arc::new(RateLimiter::new(
            rate_limit.max_calls as usize,
            Duration::from_secs(rate_limit.window_secs),
        ));
        let (dispatcher, outcome_rx, worker_handles) = spawn_workers(
            transport,
            limiter,
            dispatch_config.workers,
            dispatch_config.queue_capacity,
        );
        Arc::new(Self {
            store,
            ledger,
            clock,
            config,
            dispatch_config,
            dispatcher: Mutex::new(Some(dispatcher)),
            outcome_rx: tokio::sync::Mutex::new(Some(outcome_rx)),
            worker_handles: Mutex::new(worker_handles),
            cursor: Mutex::new(ScanCursor::default()),
        })
    }

    /// Spawn the scan drivers and the outcome loop. Returns the handle that
    /// owns shutdown.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, _) = watch::channel(false);
        let mut joins = Vec::new();

        {
            let engine = self.clone();
            joins.push(tokio::spawn(async move {
                engine.outcome_loop().await;
            }));
        }
        {
            let engine = self.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let every = Duration::from_secs(engine.config.upcoming_interval_secs);
            joins.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = engine.upcoming_scan().await {
                                tracing::warn!("⚠️ upcoming scan failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
        {
            let engine = self.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let every = Duration::from_secs(engine.config.reconcile_interval_secs);
            joins.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = engine.reconcile_scan().await {
                                tracing::warn!("⚠️ reconciliation failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        if let Ok(mut workers) = self.worker_handles.lock() {
            joins.append(&mut workers);
        }

        SchedulerHandle {
            engine: self.clone(),
            shutdown_tx,
            joins,
            drain_timeout: Duration::from_secs(self.config.shutdown_timeout_secs),
        }
    }

    /// Fast scan: deadlines due inside the widest threshold window.
    pub async fn upcoming_scan(&self) -> Result<()> {
        let now = self.clock.now();
        if !self.begin(Cadence::Upcoming, now) {
            return Ok(());
        }
        let window = Threshold::OneWeek.lead()
            + chrono::Duration::seconds(self.config.late_grace_secs as i64);
        let deadlines = self.store.list_active_due_before(now + window).await?;
        self.scan_deadlines(&deadlines, now, "upcoming").await;
        self.complete(Cadence::Upcoming, self.clock.now());
        Ok(())
    }

    /// Slow sweep: every active deadline, plus ledger repair work.
    pub async fn reconcile_scan(&self) -> Result<()> {
        let now = self.clock.now();
        if !self.begin(Cadence::Reconcile, now) {
            return Ok(());
        }

        // Over-budget pending rows become operator-visible failures.
        match self.ledger.expire_exhausted(self.dispatch_config.retry_budget, now) {
            Ok(0) => {}
            Ok(n) => tracing::warn!("🧾 {n} reservations exhausted their retry budget"),
            Err(e) => tracing::warn!("⚠️ expire pass failed: {e}"),
        }

        // Re-drive reservations stranded by a crash or a missed outcome.
        let cutoff = now - chrono::Duration::seconds(self.config.stale_pending_secs as i64);
        match self.ledger.reclaim_stale(cutoff, now) {
            Ok(stale) => {
                for reservation in stale {
                    let id = reservation.deadline_id.clone();
                    if let Err(e) = self.redispatch(reservation, now).await {
                        tracing::warn!("⚠️ redispatch of {id} failed: {e}");
                    }
                }
            }
            Err(e) => tracing::warn!("⚠️ reclaim pass failed: {e}"),
        }

        let deadlines = self.store.list_active().await?;
        self.scan_deadlines(&deadlines, now, "reconcile").await;
        self.complete(Cadence::Reconcile, self.clock.now());
        Ok(())
    }

    /// Evaluate a batch of deadlines. A failure on one deadline never
    /// aborts the others; errors are counted and summarized at the end.
    async fn scan_deadlines(&self, deadlines: &[Deadline], now: DateTime<Utc>, label: &str) {
        let mut enqueued = 0usize;
        let mut errors = 0usize;
        for deadline in deadlines {
            match self.scan_deadline(deadline, now).await {
                Ok(n) => enqueued += n,
                Err(e) => {
                    errors += 1;
                    tracing::warn!("⚠️ scan of deadline {} failed: {e}", deadline.id);
                }
            }
        }
        if enqueued > 0 || errors > 0 {
            tracing::info!(
                "🔎 {label} scan: {} candidates, {enqueued} enqueued, {errors} errors",
                deadlines.len()
            );
        }
    }

    /// Evaluate one deadline and reserve every newly due threshold.
    async fn scan_deadline(&self, deadline: &Deadline, now: DateTime<Utc>) -> Result<usize> {
        let preference = self.store.preference(deadline.user_id).await?;
        let policy = self.policy();
        let mut enqueued = 0;
        for due in due_thresholds(deadline, &preference, now, &policy) {
            match self.ledger.reserve(&deadline.id, due.threshold, due.late, now) {
                Ok(Reservation::Granted) => {
                    if due.late {
                        tracing::warn!(
                            "⏱️ late threshold {} for '{}' ({})",
                            due.threshold.key(),
                            deadline.title,
                            deadline.id
                        );
                    }
                    self.enqueue(make_job(deadline, &preference, due, 0)).await?;
                    enqueued += 1;
                }
                Ok(Reservation::AlreadyHandled) => {}
                Err(e) => {
                    // Fail closed: without a confirmed reservation, skip the
                    // pair this cycle rather than risk a duplicate send.
                    tracing::warn!(
                        "⚠️ reserve failed for {} [{}], skipping this cycle: {e}",
                        deadline.id,
                        due.threshold.key()
                    );
                }
            }
        }
        Ok(enqueued)
    }

    /// Rebuild and requeue a reclaimed reservation. A reservation whose
    /// deadline no longer exists is cleaned up, never an error.
    async fn redispatch(&self, reservation: StaleReservation, now: DateTime<Utc>) -> Result<()> {
        let Some(deadline) = self.store.get(&reservation.deadline_id).await? else {
            tracing::warn!(
                "🧹 ledger entry for missing deadline {}, cleaning up",
                reservation.deadline_id
            );
            self.ledger.invalidate(&reservation.deadline_id)?;
            return Ok(());
        };
        // A lead threshold for a passed deadline is never fired late.
        if reservation.threshold != Threshold::Due && now >= deadline.due_at {
            self.ledger
                .confirm_failed(&reservation.deadline_id, reservation.threshold, now)?;
            return Ok(());
        }
        let preference = self.store.preference(deadline.user_id).await?;
        let due = DueThreshold {
            threshold: reservation.threshold,
            late: true,
        };
        self.enqueue(make_job(&deadline, &preference, due, reservation.attempts))
            .await
    }

    /// Consume dispatch outcomes and confirm the ledger. The dispatcher
    /// itself never writes ledger state.
    async fn outcome_loop(&self) {
        let mut rx = match self.outcome_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        while let Some((job, outcome)) = rx.recv().await {
            let now = self.clock.now();
            match outcome {
                Outcome::Sent => {
                    match self.ledger.confirm_sent(&job.deadline_id, job.threshold, now) {
                        Ok(()) => tracing::info!(
                            "✅ reminder sent: '{}' [{}] → user {}",
                            job.title,
                            job.threshold.key(),
                            job.user_id
                        ),
                        Err(e) => tracing::warn!(
                            "⚠️ confirm failed for {} [{}]: {e}",
                            job.deadline_id,
                            job.threshold.key()
                        ),
                    }
                }
                Outcome::TransientFailure(reason) => {
                    match self.ledger.confirm_transient(
                        &job.deadline_id,
                        job.threshold,
                        self.dispatch_config.retry_budget,
                        now,
                    ) {
                        Ok(RetryDecision::Retry { attempt }) => {
                            let delay = backoff_delay(
                                Duration::from_secs(self.dispatch_config.backoff_base_secs),
                                Duration::from_secs(self.dispatch_config.backoff_max_secs),
                                attempt,
                            );
                            tracing::warn!(
                                "🔁 transient failure for {} [{}] (attempt {attempt}): {reason}; retrying in {delay:?}",
                                job.deadline_id,
                                job.threshold.key()
                            );
                            self.requeue_after(job, attempt, delay);
                        }
                        Ok(RetryDecision::Exhausted) => tracing::warn!(
                            "❌ retry budget exhausted for {} [{}]: {reason}",
                            job.deadline_id,
                            job.threshold.key()
                        ),
                        Err(e) => tracing::warn!(
                            "⚠️ confirm failed for {} [{}]: {e}",
                            job.deadline_id,
                            job.threshold.key()
                        ),
                    }
                }
                Outcome::PermanentFailure(reason) => {
                    match self.ledger.confirm_failed(&job.deadline_id, job.threshold, now) {
                        Ok(()) => tracing::warn!(
                            "❌ permanent failure for {} [{}]: {reason}",
                            job.deadline_id,
                            job.threshold.key()
                        ),
                        Err(e) => tracing::warn!(
                            "⚠️ confirm failed for {} [{}]: {e}",
                            job.deadline_id,
                            job.threshold.key()
                        ),
                    }
                }
            }
        }
    }

    /// Requeue a transient failure after its backoff delay. During
    /// shutdown the queue is gone; the pending reservation is simply
    /// reclaimed on the next start.
    fn requeue_after(&self, mut job: DispatchJob, attempt: u32, delay: Duration) {
        let Some(dispatcher) = self.dispatcher() else {
            return;
        };
        job.attempt = attempt;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.enqueue(job).await.ok();
        });
    }

    // ─── Collaborator hooks ───────────────────────────────────────────

    /// Due-date edit: wipe the deadline's ledger entries so thresholds are
    /// re-derived against the new instant.
    pub fn on_deadline_edited(&self, deadline_id: &str, new_due: DateTime<Utc>) -> Result<()> {
        let removed = self.ledger.invalidate(deadline_id)?;
        tracing::info!(
            "📝 deadline {deadline_id} rescheduled to {new_due}; {removed} ledger entries invalidated"
        );
        Ok(())
    }

    /// Deadline deletion: drop its ledger entries.
    pub fn on_deadline_deleted(&self, deadline_id: &str) -> Result<()> {
        let removed = self.ledger.invalidate(deadline_id)?;
        tracing::info!("🗑️ deadline {deadline_id} deleted; {removed} ledger entries removed");
        Ok(())
    }

    /// Snapshot for the health surface.
    pub fn status(&self) -> SchedulerStatus {
        let counts = self.ledger.counts().unwrap_or_default();
        let cursor = self.cursor.lock().unwrap();
        SchedulerStatus {
            last_upcoming_scan: cursor.upcoming_completed,
            last_reconciliation: cursor.reconcile_completed,
            pending: counts.pending,
            failed: counts.failed,
        }
    }

    /// Cheap liveness probe of the underlying storage.
    pub fn probe(&self) -> bool {
        self.ledger.counts().is_ok()
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn policy(&self) -> EvaluatePolicy {
        EvaluatePolicy {
            late_grace: chrono::Duration::seconds(self.config.late_grace_secs as i64),
            scan_cadence: chrono::Duration::seconds(self.config.upcoming_interval_secs as i64),
        }
    }

    fn dispatcher(&self) -> Option<Dispatcher> {
        self.dispatcher.lock().ok().and_then(|guard| guard.clone())
    }

    async fn enqueue(&self, job: DispatchJob) -> Result<()> {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.enqueue(job).await,
            None => Ok(()), // shutting down; the reservation is reclaimed later
        }
    }

    fn close_dispatch(&self) {
        if let Ok(mut guard) = self.dispatcher.lock() {
            guard.take();
        }
    }

    /// A scan whose `now` does not advance past the last started scan of
    /// the same cadence is redundant and skipped.
    fn begin(&self, cadence: Cadence, now: DateTime<Utc>) -> bool {
        let mut cursor = self.cursor.lock().unwrap();
        let started = match cadence {
            Cadence::Upcoming => &mut cursor.upcoming_started,
            Cadence::Reconcile => &mut cursor.reconcile_started,
        };
        if started.is_some_and(|s| s >= now) {
            return false;
        }
        *started = Some(now);
        true
    }

    fn complete(&self, cadence: Cadence, at: DateTime<Utc>) {
        let mut cursor = self.cursor.lock().unwrap();
        match cadence {
            Cadence::Upcoming => cursor.upcoming_completed = Some(at),
            Cadence::Reconcile => cursor.reconcile_completed = Some(at),
        }
    }
}

fn make_job(
    deadline: &Deadline,
    preference: &NotificationPreference,
    due: DueThreshold,
    attempt: u32,
) -> DispatchJob {
    DispatchJob {
        deadline_id: deadline.id.clone(),
        threshold: due.threshold,
        user_id: deadline.user_id,
        title: deadline.title.clone(),
        description: deadline.description.clone(),
        due_at: deadline.due_at,
        timezone: preference.timezone.clone(),
        late: due.late,
        attempt,
    }
}

/// A running scheduler: owns the shutdown signal and every task handle.
pub struct SchedulerHandle {
    engine: Arc<SchedulerEngine>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<tokio::task::JoinHandle<()>>,
    drain_timeout: Duration,
}

impl SchedulerHandle {
    pub fn status(&self) -> SchedulerStatus {
        self.engine.status()
    }

    pub fn engine(&self) -> Arc<SchedulerEngine> {
        self.engine.clone()
    }

    /// Stop accepting scan ticks, drain in-flight dispatch up to the
    /// configured timeout, then force-stop. Pending reservations survive
    /// for the next process start.
    pub async fn shutdown(self) {
        tracing::info!("🛑 scheduler stopping...");
        self.shutdown_tx.send(true).ok();
        self.engine.close_dispatch();

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        for mut join in self.joins {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut join).await.is_err() {
                tracing::warn!("⚠️ drain timeout hit; aborting an in-flight task");
                join.abort();
            }
        }
        tracing::info!("🛑 scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::RecordState;
    use crate::store::SqliteDeadlineStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    /// Scripted transport: pops the next outcome per call, defaults to Sent.
    struct MockTransport {
        script: std::sync::Mutex<VecDeque<Outcome>>,
        calls: std::sync::Mutex<Vec<(String, Threshold)>>,
    }

    impl MockTransport {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Threshold)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn name(&self) -> &str {
            "mock"
        }

        async fn deliver(&self, job: &DispatchJob) -> Outcome {
            self.calls
                .lock()
                .unwrap()
                .push((job.deadline_id.clone(), job.threshold));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Outcome::Sent)
        }
    }

    struct Fixture {
        engine: Arc<SchedulerEngine>,
        store: Arc<SqliteDeadlineStore>,
        ledger: Arc<NotificationLedger>,
        clock: Arc<ManualClock>,
        transport: Arc<MockTransport>,
        dir: std::path::PathBuf,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn fixture(name: &str, script: Vec<Outcome>) -> Fixture {
        let dir = std::env::temp_dir().join(format!("duewatch-engine-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).ok();
        let db = dir.join("duewatch.db");

        let store = Arc::new(SqliteDeadlineStore::open(&db).unwrap());
        let ledger = Arc::new(NotificationLedger::open(&db).unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let transport = MockTransport::new(script);

        let config = SchedulerConfig {
            upcoming_interval_secs: 60,
            reconcile_interval_secs: 900,
            late_grace_secs: 3600,
            stale_pending_secs: 600,
            shutdown_timeout_secs: 5,
        };
        let dispatch_config = DispatchConfig {
            workers: 2,
            queue_capacity: 64,
            retry_budget: 3,
            backoff_base_secs: 2,
            backoff_max_secs: 60,
        };
        let rate_limit = RateLimitConfig {
            window_secs: 60,
            max_calls: 100,
        };

        let engine = SchedulerEngine::new(
            store.clone(),
            ledger.clone(),
            transport.clone(),
            clock.clone(),
            config,
            dispatch_config,
            rate_limit,
        );
        Fixture {
            engine,
            store,
            ledger,
            clock,
            transport,
            dir,
        }
    }

    /// Run the outcome loop in the background so confirmations land.
    fn spawn_outcome_loop(engine: &Arc<SchedulerEngine>) -> tokio::task::JoinHandle<()> {
        let engine = engine.clone();
        tokio::spawn(async move { engine.outcome_loop().await })
    }

    /// In paused mode a sleep only completes once every other task is idle,
    /// which drains the dispatch pipeline deterministically.
    async fn drain() {
        tokio::time::sleep(Duration::from_secs(120)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_fires_exactly_once() {
        let f = fixture("once", vec![]);
        let _outcomes = spawn_outcome_loop(&f.engine);

        // only the 1-day reminder enabled
        let mut pref = NotificationPreference::defaults(7);
        pref.notify_on_due = false;
        f.store.update_preference(&pref).unwrap();
        let due_at = t0() + chrono::Duration::hours(25);
        let d = f.store.add(7, "thesis", None, due_at).unwrap();

        // before the threshold instant: nothing
        f.engine.upcoming_scan().await.unwrap();
        drain().await;
        assert!(f.transport.calls().is_empty());

        // one minute after the threshold instant: dispatched and confirmed
        f.clock.set(due_at - chrono::Duration::hours(24) + chrono::Duration::minutes(1));
        f.engine.upcoming_scan().await.unwrap();
        drain().await;
        assert_eq!(f.transport.calls(), vec![(d.id.clone(), Threshold::OneDay)]);
        assert_eq!(
            f.ledger.state(&d.id, Threshold::OneDay).unwrap(),
            Some(RecordState::Sent)
        );

        // thirty seconds later: a no-op
        f.clock.advance(chrono::Duration::seconds(30));
        f.engine.upcoming_scan().await.unwrap();
        drain().await;
        assert_eq!(f.transport.calls().len(), 1);
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_and_slow_scan_do_not_duplicate() {
        let f = fixture("dualscan", vec![]);
        let _outcomes = spawn_outcome_loop(&f.engine);

        let mut pref = NotificationPreference::defaults(7);
        pref.notify_on_due = false;
        f.store.update_preference(&pref).unwrap();
        let due_at = t0() + chrono::Duration::hours(24) - chrono::Duration::minutes(1);
        let d = f.store.add(7, "exam", None, due_at).unwrap();

        // both cadences evaluate the same due threshold; the ledger lets
        // only one dispatch through
        f.engine.upcoming_scan().await.unwrap();
        f.engine.reconcile_scan().await.unwrap();
        drain().await;

        assert_eq!(f.transport.calls(), vec![(d.id.clone(), Threshold::OneDay)]);
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_then_send() {
        let f = fixture(
            "retry",
            vec![
                Outcome::TransientFailure("throttled".into()),
                Outcome::TransientFailure("throttled".into()),
            ],
        );
        let _outcomes = spawn_outcome_loop(&f.engine);

        let mut pref = NotificationPreference::defaults(7);
        pref.notify_on_due = false;
        f.store.update_preference(&pref).unwrap();
        let due_at = t0() + chrono::Duration::hours(24) - chrono::Duration::minutes(1);
        let d = f.store.add(7, "exam", None, due_at).unwrap();

        f.engine.upcoming_scan().await.unwrap();
        drain().await;

        // two transient failures, then the third attempt lands
        assert_eq!(f.transport.calls().len(), 3);
        assert_eq!(
            f.ledger.state(&d.id, Threshold::OneDay).unwrap(),
            Some(RecordState::Sent)
        );
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_is_visible_and_final() {
        let f = fixture(
            "exhaust",
            vec![
                Outcome::TransientFailure("throttled".into()),
                Outcome::TransientFailure("throttled".into()),
                Outcome::TransientFailure("throttled".into()),
            ],
        );
        let _outcomes = spawn_outcome_loop(&f.engine);

        let mut pref = NotificationPreference::defaults(7);
        pref.notify_on_due = false;
        f.store.update_preference(&pref).unwrap();
        let due_at = t0() + chrono::Duration::hours(24) - chrono::Duration::minutes(1);
        let d = f.store.add(7, "exam", None, due_at).unwrap();

        f.engine.upcoming_scan().await.unwrap();
        drain().await;

        assert_eq!(f.transport.calls().len(), 3);
        assert_eq!(
            f.ledger.state(&d.id, Threshold::OneDay).unwrap(),
            Some(RecordState::Failed)
        );
        assert_eq!(f.engine.status().failed, 1);

        // never retried automatically again
        f.clock.advance(chrono::Duration::minutes(5));
        f.engine.upcoming_scan().await.unwrap();
        f.engine.reconcile_scan().await.unwrap();
        drain().await;
        assert_eq!(f.transport.calls().len(), 3);
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_terminal() {
        let f = fixture(
            "permanent",
            vec![Outcome::PermanentFailure("blocked by recipient".into())],
        );
        let _outcomes = spawn_outcome_loop(&f.engine);

        let mut pref = NotificationPreference::defaults(7);
        pref.notify_on_due = false;
        f.store.update_preference(&pref).unwrap();
        let due_at = t0() + chrono::Duration::hours(24) - chrono::Duration::minutes(1);
        let d = f.store.add(7, "exam", None, due_at).unwrap();

        f.engine.upcoming_scan().await.unwrap();
        drain().await;

        assert_eq!(f.transport.calls().len(), 1);
        assert_eq!(
            f.ledger.state(&d.id, Threshold::OneDay).unwrap(),
            Some(RecordState::Failed)
        );
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_invalidates_only_own_entries() {
        let f = fixture("edit", vec![]);
        let _outcomes = spawn_outcome_loop(&f.engine);

        let mut pref = NotificationPreference::defaults(7);
        pref.notify_on_due = false;
        f.store.update_preference(&pref).unwrap();
        let due_at = t0() + chrono::Duration::hours(24) - chrono::Duration::minutes(1);
        let d1 = f.store.add(7, "exam", None, due_at).unwrap();
        let d2 = f.store.add(7, "essay", None, due_at).unwrap();

        f.engine.upcoming_scan().await.unwrap();
        drain().await;
        assert_eq!(f.transport.calls().len(), 2);

        // moving d1 out and back re-arms exactly d1
        let new_due = t0() + chrono::Duration::days(2) + chrono::Duration::minutes(1);
        f.store.set_due(&d1.id, new_due).unwrap();
        f.engine.on_deadline_edited(&d1.id, new_due).unwrap();
        assert_eq!(f.ledger.state(&d1.id, Threshold::OneDay).unwrap(), None);
        assert_eq!(
            f.ledger.state(&d2.id, Threshold::OneDay).unwrap(),
            Some(RecordState::Sent)
        );

        f.clock.set(new_due - chrono::Duration::hours(24) + chrono::Duration::minutes(1));
        f.engine.upcoming_scan().await.unwrap();
        drain().await;

        let calls = f.transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], (d1.id.clone(), Threshold::OneDay));
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_fires_once_then_settles() {
        let f = fixture("overdue", vec![]);
        let _outcomes = spawn_outcome_loop(&f.engine);

        let d = f
            .store
            .add(7, "late already", None, t0() - chrono::Duration::minutes(5))
            .unwrap();

        f.engine.reconcile_scan().await.unwrap();
        drain().await;
        assert_eq!(f.transport.calls(), vec![(d.id.clone(), Threshold::Due)]);
        assert_eq!(
            f.ledger.state(&d.id, Threshold::Due).unwrap(),
            Some(RecordState::Sent)
        );

        // settled: no further notification scheduling for this deadline
        f.clock.advance(chrono::Duration::minutes(10));
        f.engine.reconcile_scan().await.unwrap();
        f.engine.upcoming_scan().await.unwrap();
        drain().await;
        assert_eq!(f.transport.calls().len(), 1);
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciliation_reclaims_stranded_reservation() {
        let f = fixture("reclaim", vec![]);
        let _outcomes = spawn_outcome_loop(&f.engine);

        let mut pref = NotificationPreference::defaults(7);
        pref.notify_on_due = false;
        f.store.update_preference(&pref).unwrap();
        let due_at = t0() + chrono::Duration::hours(24);
        let d = f.store.add(7, "exam", None, due_at).unwrap();

        // simulate a crash between reserve and dispatch
        f.ledger.reserve(&d.id, Threshold::OneDay, false, t0()).unwrap();

        f.clock.set(t0() + chrono::Duration::minutes(15));
        f.engine.reconcile_scan().await.unwrap();
        drain().await;

        assert_eq!(f.transport.calls(), vec![(d.id.clone(), Threshold::OneDay)]);
        assert_eq!(
            f.ledger.state(&d.id, Threshold::OneDay).unwrap(),
            Some(RecordState::Sent)
        );
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_deadline_reservation_cleaned_up() {
        let f = fixture("ghost", vec![]);
        let _outcomes = spawn_outcome_loop(&f.engine);

        f.ledger
            .reserve("ghost-id", Threshold::OneDay, false, t0())
            .unwrap();

        f.clock.set(t0() + chrono::Duration::minutes(15));
        f.engine.reconcile_scan().await.unwrap();
        drain().await;

        assert!(f.transport.calls().is_empty());
        assert_eq!(f.ledger.state("ghost-id", Threshold::OneDay).unwrap(), None);
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_tick_rescan_skipped() {
        let f = fixture("cursor", vec![]);
        assert!(f.engine.begin(Cadence::Upcoming, t0()));
        assert!(!f.engine.begin(Cadence::Upcoming, t0()));
        // an independent cadence is unaffected
        assert!(f.engine.begin(Cadence::Reconcile, t0()));
        // time moved on: the next tick scans again
        assert!(f.engine.begin(Cadence::Upcoming, t0() + chrono::Duration::seconds(60)));
        std::fs::remove_dir_all(&f.dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_preserves_pending() {
        let f = fixture("shutdown", vec![]);
        let handle = f.engine.start();

        // a reservation with no dispatched job survives shutdown untouched
        f.ledger
            .reserve("d-pending", Threshold::OneHour, false, t0())
            .unwrap();

        handle.shutdown().await;
        assert_eq!(
            f.ledger.state("d-pending", Threshold::OneHour).unwrap(),
            Some(RecordState::Pending)
        );
        std::fs::remove_dir_all(&f.dir).ok();
    }
}
