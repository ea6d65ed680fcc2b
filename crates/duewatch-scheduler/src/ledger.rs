//! Notification ledger — durable exactly-once bookkeeping for
//! (deadline, threshold) reminder state.
//!
//! `reserve` is the linchpin: one conditional insert on the composite
//! primary key, never a read-then-write pair. Two scan cycles racing on the
//! same key cannot both be granted, in-process or across processes.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use duewatch_core::error::{DuewatchError, Result};
use duewatch_core::types::Threshold;
use rusqlite::{Connection, OptionalExtension};

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns this (deadline, threshold) pair and must dispatch it.
    Granted,
    /// Sent already, pending elsewhere, or terminally failed — skip.
    AlreadyHandled,
}

/// What the engine should do after reporting a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with backoff; `attempt` counts delivery failures so far.
    Retry { attempt: u32 },
    /// Retry budget spent — the record is now terminally failed.
    Exhausted,
}

/// State of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Sent,
    Failed,
}

impl RecordState {
    fn from_str(s: &str) -> RecordState {
        match s {
            "sent" => RecordState::Sent,
            "failed" => RecordState::Failed,
            _ => RecordState::Pending,
        }
    }
}

/// A pending reservation reclaimed for re-dispatch.
#[derive(Debug, Clone)]
pub struct StaleReservation {
    pub deadline_id: String,
    pub threshold: Threshold,
    pub attempts: u32,
}

/// Pending/sent/failed totals for the status surface.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LedgerCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

/// SQLite-backed ledger. One row per (deadline, threshold) pair; `sent` and
/// `failed` are terminal.
pub struct NotificationLedger {
    conn: Mutex<Connection>,
}

impl NotificationLedger {
    /// Open or create the ledger database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(path).map_err(|e| DuewatchError::Ledger(format!("open: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| DuewatchError::Ledger(e.to_string()))?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS notification_ledger (
                deadline_id TEXT NOT NULL,
                threshold TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                late INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_attempt_at TEXT NOT NULL,
                sent_at TEXT,
                PRIMARY KEY (deadline_id, threshold)
            );",
        )
        .map_err(|e| DuewatchError::Ledger(format!("migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DuewatchError::Ledger(e.to_string()))
    }

    /// Atomically create a `pending` record for the key. Granted iff the
    /// insert changed a row; any existing record — pending, sent, or
    /// failed — means another cycle already owns the pair.
    pub fn reserve(
        &self,
        deadline_id: &str,
        threshold: Threshold,
        late: bool,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO notification_ledger
                 (deadline_id, threshold, state, attempts, late, created_at, last_attempt_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4)",
                rusqlite::params![deadline_id, threshold.key(), late as i32, now.to_rfc3339()],
            )
            .map_err(|e| DuewatchError::Ledger(format!("reserve: {e}")))?;
        Ok(if changed == 1 {
            Reservation::Granted
        } else {
            Reservation::AlreadyHandled
        })
    }

    /// Mark a pending record sent. Replay-safe: a record that already went
    /// terminal is left untouched.
    pub fn confirm_sent(
        &self,
        deadline_id: &str,
        threshold: Threshold,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE notification_ledger SET state = 'sent', sent_at = ?3
             WHERE deadline_id = ?1 AND threshold = ?2 AND state = 'pending'",
            rusqlite::params![deadline_id, threshold.key(), now.to_rfc3339()],
        )
        .map_err(|e| DuewatchError::Ledger(format!("confirm sent: {e}")))?;
        Ok(())
    }

    /// Record a transient delivery failure and decide whether the engine
    /// should requeue the job.
    pub fn confirm_transient(
        &self,
        deadline_id: &str,
        threshold: Threshold,
        budget: u32,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE notification_ledger SET attempts = attempts + 1, last_attempt_at = ?3
             WHERE deadline_id = ?1 AND threshold = ?2 AND state = 'pending'",
            rusqlite::params![deadline_id, threshold.key(), now.to_rfc3339()],
        )
        .map_err(|e| DuewatchError::Ledger(format!("confirm transient: {e}")))?;

        let attempts = conn
            .query_row(
                "SELECT attempts FROM notification_ledger
                 WHERE deadline_id = ?1 AND threshold = ?2",
                rusqlite::params![deadline_id, threshold.key()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| DuewatchError::Ledger(format!("confirm transient: {e}")))?
            as u32;

        if attempts >= budget {
            conn.execute(
                "UPDATE notification_ledger SET state = 'failed'
                 WHERE deadline_id = ?1 AND threshold = ?2 AND state = 'pending'",
                rusqlite::params![deadline_id, threshold.key()],
            )
            .map_err(|e| DuewatchError::Ledger(format!("confirm transient: {e}")))?;
            Ok(RetryDecision::Exhausted)
        } else {
            Ok(RetryDecision::Retry { attempt: attempts })
        }
    }

    /// Terminal delivery failure (recipient unreachable, blocked).
    pub fn confirm_failed(
        &self,
        deadline_id: &str,
        threshold: Threshold,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE notification_ledger SET state = 'failed', last_attempt_at = ?3
             WHERE deadline_id = ?1 AND threshold = ?2 AND state = 'pending'",
            rusqlite::params![deadline_id, threshold.key(), now.to_rfc3339()],
        )
        .map_err(|e| DuewatchError::Ledger(format!("confirm failed: {e}")))?;
        Ok(())
    }

    /// Drop every ledger entry for a deadline whose due instant changed or
    /// which was deleted. Returns how many entries went away.
    pub fn invalidate(&self, deadline_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM notification_ledger WHERE deadline_id = ?1",
                [deadline_id],
            )
            .map_err(|e| DuewatchError::Ledger(format!("invalidate: {e}")))?;
        Ok(removed)
    }

    /// Re-lease pending reservations whose last attempt predates `cutoff`
    /// and return them for re-dispatch. The lease bump keeps the next
    /// reconciliation from reclaiming the same rows again immediately.
    pub fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StaleReservation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "UPDATE notification_ledger SET last_attempt_at = ?2
                 WHERE state = 'pending' AND last_attempt_at < ?1
                 RETURNING deadline_id, threshold, attempts",
            )
            .map_err(|e| DuewatchError::Ledger(format!("reclaim: {e}")))?;
        let rows = stmt
            .query_map(
                rusqlite::params![cutoff.to_rfc3339(), now.to_rfc3339()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .map_err(|e| DuewatchError::Ledger(format!("reclaim: {e}")))?;

        let mut reclaimed = Vec::new();
        for row in rows {
            let (deadline_id, key, attempts) =
                row.map_err(|e| DuewatchError::Ledger(format!("reclaim: {e}")))?;
            let Some(threshold) = Threshold::from_key(&key) else {
                tracing::warn!("unknown threshold key '{key}' in ledger, skipping");
                continue;
            };
            reclaimed.push(StaleReservation {
                deadline_id,
                threshold,
                attempts: attempts as u32,
            });
        }
        Ok(reclaimed)
    }

    /// Flip over-budget pending records to failed. Returns how many flipped.
    pub fn expire_exhausted(&self, budget: u32, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let flipped = conn
            .execute(
                "UPDATE notification_ledger SET state = 'failed', last_attempt_at = ?2
                 WHERE state = 'pending' AND attempts >= ?1",
                rusqlite::params![budget, now.to_rfc3339()],
            )
            .map_err(|e| DuewatchError::Ledger(format!("expire: {e}")))?;
        Ok(flipped)
    }

    /// Totals per state.
    pub fn counts(&self) -> Result<LedgerCounts> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM notification_ledger GROUP BY state")
            .map_err(|e| DuewatchError::Ledger(format!("counts: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| DuewatchError::Ledger(format!("counts: {e}")))?;

        let mut counts = LedgerCounts::default();
        for row in rows {
            let (state, n) = row.map_err(|e| DuewatchError::Ledger(format!("counts: {e}")))?;
            match RecordState::from_str(&state) {
                RecordState::Pending => counts.pending = n as u64,
                RecordState::Sent => counts.sent = n as u64,
                RecordState::Failed => counts.failed = n as u64,
            }
        }
        Ok(counts)
    }

    /// Current state of a key, if a record exists.
    pub fn state(&self, deadline_id: &str, threshold: Threshold) -> Result<Option<RecordState>> {
        let conn = self.lock()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM notification_ledger
                 WHERE deadline_id = ?1 AND threshold = ?2",
                rusqlite::params![deadline_id, threshold.key()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| DuewatchError::Ledger(format!("state: {e}")))?;
        Ok(state.map(|s| RecordState::from_str(&s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_ledger(name: &str) -> (NotificationLedger, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("duewatch-ledger-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("ledger.db");
        (NotificationLedger::open(&path).unwrap(), dir)
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_reserve_then_duplicate() {
        let (ledger, dir) = temp_ledger("dup");
        assert_eq!(
            ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap(),
            Reservation::Granted
        );
        assert_eq!(
            ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap(),
            Reservation::AlreadyHandled
        );
        // a different threshold for the same deadline is its own key
        assert_eq!(
            ledger.reserve("d1", Threshold::OneHour, false, now()).unwrap(),
            Reservation::Granted
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_sent_is_terminal() {
        let (ledger, dir) = temp_ledger("terminal");
        ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap();
        ledger.confirm_sent("d1", Threshold::OneDay, now()).unwrap();
        assert_eq!(
            ledger.state("d1", Threshold::OneDay).unwrap(),
            Some(RecordState::Sent)
        );

        // reservation stays refused and failure cannot overwrite sent
        assert_eq!(
            ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap(),
            Reservation::AlreadyHandled
        );
        ledger.confirm_failed("d1", Threshold::OneDay, now()).unwrap();
        assert_eq!(
            ledger.state("d1", Threshold::OneDay).unwrap(),
            Some(RecordState::Sent)
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_concurrent_reserve_single_grant() {
        let (ledger, dir) = temp_ledger("race");
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap()
            }));
        }
        let grants = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r == Reservation::Granted)
            .count();
        assert_eq!(grants, 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalidate_scoped_to_one_deadline() {
        let (ledger, dir) = temp_ledger("invalidate");
        ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap();
        ledger.reserve("d1", Threshold::OneHour, false, now()).unwrap();
        ledger.reserve("d2", Threshold::OneDay, false, now()).unwrap();

        assert_eq!(ledger.invalidate("d1").unwrap(), 2);
        assert_eq!(ledger.state("d1", Threshold::OneDay).unwrap(), None);
        assert_eq!(ledger.state("d1", Threshold::OneHour).unwrap(), None);
        assert_eq!(
            ledger.state("d2", Threshold::OneDay).unwrap(),
            Some(RecordState::Pending)
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_transient_within_budget_then_sent() {
        let (ledger, dir) = temp_ledger("retry");
        ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap();

        assert_eq!(
            ledger.confirm_transient("d1", Threshold::OneDay, 3, now()).unwrap(),
            RetryDecision::Retry { attempt: 1 }
        );
        assert_eq!(
            ledger.confirm_transient("d1", Threshold::OneDay, 3, now()).unwrap(),
            RetryDecision::Retry { attempt: 2 }
        );
        ledger.confirm_sent("d1", Threshold::OneDay, now()).unwrap();
        assert_eq!(
            ledger.state("d1", Threshold::OneDay).unwrap(),
            Some(RecordState::Sent)
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_budget_exhaustion_is_terminal() {
        let (ledger, dir) = temp_ledger("exhaust");
        ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap();

        for expected in 1..3u32 {
            assert_eq!(
                ledger.confirm_transient("d1", Threshold::OneDay, 3, now()).unwrap(),
                RetryDecision::Retry { attempt: expected }
            );
        }
        assert_eq!(
            ledger.confirm_transient("d1", Threshold::OneDay, 3, now()).unwrap(),
            RetryDecision::Exhausted
        );
        assert_eq!(
            ledger.state("d1", Threshold::OneDay).unwrap(),
            Some(RecordState::Failed)
        );
        assert_eq!(
            ledger.reserve("d1", Threshold::OneDay, false, now()).unwrap(),
            Reservation::AlreadyHandled
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_reclaim_stale_bumps_lease() {
        let (ledger, dir) = temp_ledger("reclaim");
        let t0 = now();
        ledger.reserve("d1", Threshold::OneDay, false, t0).unwrap();
        ledger.confirm_sent("d1", Threshold::OneDay, t0).unwrap();
        ledger.reserve("d2", Threshold::OneHour, false, t0).unwrap();

        let later = t0 + chrono::Duration::minutes(20);
        let cutoff = later - chrono::Duration::minutes(10);
        let stale = ledger.reclaim_stale(cutoff, later).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].deadline_id, "d2");
        assert_eq!(stale[0].threshold, Threshold::OneHour);

        // the lease was bumped, so the same cutoff finds nothing
        assert!(ledger.reclaim_stale(cutoff, later).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_expire_exhausted_and_counts() {
        let (ledger, dir) = temp_ledger("expire");
        let t = now();
        ledger.reserve("d1", Threshold::OneDay, false, t).unwrap();
        ledger.reserve("d2", Threshold::OneDay, false, t).unwrap();
        ledger.reserve("d3", Threshold::OneDay, false, t).unwrap();
        ledger.confirm_sent("d3", Threshold::OneDay, t).unwrap();

        // d1 burns through the budget
        for _ in 0..3 {
            ledger.confirm_transient("d1", Threshold::OneDay, 5, t).unwrap();
        }
        assert_eq!(ledger.expire_exhausted(3, t).unwrap(), 1);

        let counts = ledger.counts().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.sent, 1);
        assert_eq!(counts.failed, 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
