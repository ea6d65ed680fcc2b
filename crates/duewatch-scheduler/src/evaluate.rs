//! Threshold evaluation — decides which reminder thresholds are due for a
//! deadline at a given instant. Pure: no clock reads, no storage.

use chrono::{DateTime, Duration, Utc};
use duewatch_core::types::{Deadline, NotificationPreference, Threshold};

/// Staleness policy for thresholds that became due while the scheduler was
/// not running.
#[derive(Debug, Clone, Copy)]
pub struct EvaluatePolicy {
    /// Thresholds trailing `now` by more than this are skipped outright,
    /// so an extended outage cannot flush a burst of stale reminders.
    pub late_grace: Duration,
    /// Anything more than one scan cadence behind is flagged late.
    pub scan_cadence: Duration,
}

/// A threshold that should fire now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueThreshold {
    pub threshold: Threshold,
    /// Missed by more than one scan cadence — kept for observability.
    pub late: bool,
}

/// Compute the thresholds due for `deadline` at `now`, largest lead first.
///
/// A lead threshold is due iff `due_at - lead <= now < due_at`; it never
/// fires once the deadline itself has passed. The on-due threshold fires
/// once `now >= due_at`. All comparisons are UTC — the owner's timezone
/// never enters threshold arithmetic, so DST transitions cannot shift a
/// reminder.
pub fn due_thresholds(
    deadline: &Deadline,
    preference: &NotificationPreference,
    now: DateTime<Utc>,
    policy: &EvaluatePolicy,
) -> Vec<DueThreshold> {
    let mut due = Vec::new();
    if deadline.archived {
        return due;
    }

    for threshold in preference.enabled_leads() {
        let fire_at = deadline.due_at - threshold.lead();
        if now < fire_at || now >= deadline.due_at {
            continue;
        }
        let behind = now - fire_at;
        if behind > policy.late_grace {
            continue; // too stale to be worth delivering
        }
        due.push(DueThreshold {
            threshold,
            late: behind > policy.scan_cadence,
        });
    }

    // One final on-due notification for a deadline that has passed; after
    // its ledger record goes terminal the deadline is settled.
    if preference.notify_on_due && now >= deadline.due_at {
        let behind = now - deadline.due_at;
        if behind <= policy.late_grace {
            due.push(DueThreshold {
                threshold: Threshold::Due,
                late: behind > policy.scan_cadence,
            });
        }
    }

    due
}
