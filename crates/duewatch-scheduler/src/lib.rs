//! # Duewatch Scheduler
//!
//! The notification scheduling core: periodic scans over stored deadlines,
//! at-most-one delivery per (deadline, threshold) pair across restarts and
//! overlapping scan cycles, dispatch through a rate-limited sender.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine
//!   ├── upcoming scan (fast, e.g. 60s)
//!   ├── reconcile scan (slow, e.g. 15min)
//!   │       both: store → evaluate → ledger.reserve → job queue
//!   ├── rate-limited workers: job queue → Transport → outcome queue
//!   └── outcome loop: confirm sent/failed, requeue transients with backoff
//!
//! NotificationLedger (SQLite) is the only shared mutable state; its
//! conditional-insert reserve is the exactly-once linchpin.
//! ```

pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod evaluate;
pub mod ledger;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchJob, Dispatcher, Outcome, RateLimiter, Transport};
pub use engine::{SchedulerEngine, SchedulerHandle, SchedulerStatus};
pub use evaluate::{DueThreshold, EvaluatePolicy, due_thresholds};
pub use ledger::{LedgerCounts, NotificationLedger, RecordState, Reservation, RetryDecision};
pub use store::{DeadlineStore, SqliteDeadlineStore};
