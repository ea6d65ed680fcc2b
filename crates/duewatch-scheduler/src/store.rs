//! Deadline store — SQLite-backed source of deadlines and per-user
//! notification preferences. The scheduler consumes it read-only; every
//! write comes from the CRUD surface (bot commands, admin API).

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duewatch_core::error::{DuewatchError, Result};
use duewatch_core::types::{Deadline, NotificationPreference};
use rusqlite::{Connection, OptionalExtension, Row};

/// Read side consumed by the scheduler engine.
#[async_trait]
pub trait DeadlineStore: Send + Sync {
    /// Active deadlines with a due instant before `before`, past-due
    /// included. Ordered by due instant.
    async fn list_active_due_before(&self, before: DateTime<Utc>) -> Result<Vec<Deadline>>;

    /// Every active deadline — the reconciliation sweep.
    async fn list_active(&self) -> Result<Vec<Deadline>>;

    /// The user's preference, created with defaults on first read.
    async fn preference(&self, user_id: i64) -> Result<NotificationPreference>;

    /// Look up one deadline.
    async fn get(&self, id: &str) -> Result<Option<Deadline>>;
}

pub struct SqliteDeadlineStore {
    conn: Mutex<Connection>,
    /// Template applied when a preference row is created lazily. The
    /// `user_id` field of the template is ignored.
    defaults: NotificationPreference,
}

impl SqliteDeadlineStore {
    /// Open or create the deadline database with built-in new-user defaults.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_defaults(path, NotificationPreference::defaults(0))
    }

    /// Open with configured new-user defaults.
    pub fn open_with_defaults(path: &Path, defaults: NotificationPreference) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(path).map_err(|e| DuewatchError::Store(format!("open: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| DuewatchError::Store(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
            defaults,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS deadlines (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                due_at TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deadlines_due ON deadlines(archived, due_at);

            CREATE TABLE IF NOT EXISTS notification_settings (
                user_id INTEGER PRIMARY KEY,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                notify_on_due INTEGER NOT NULL DEFAULT 1,
                notify_1_hour INTEGER NOT NULL DEFAULT 0,
                notify_3_hours INTEGER NOT NULL DEFAULT 0,
                notify_1_day INTEGER NOT NULL DEFAULT 1,
                notify_3_days INTEGER NOT NULL DEFAULT 0,
                notify_1_week INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );",
        )
        .map_err(|e| DuewatchError::Store(format!("migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DuewatchError::Store(e.to_string()))
    }

    // ─── CRUD (owned by the command surface, not the scheduler) ───────

    /// Insert a new deadline and return it.
    pub fn add(
        &self,
        user_id: i64,
        title: &str,
        description: Option<&str>,
        due_at: DateTime<Utc>,
    ) -> Result<Deadline> {
        let mut deadline = Deadline::new(user_id, title, due_at);
        deadline.description = description.map(|s| s.to_string());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO deadlines (id, user_id, title, description, due_at, archived, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            rusqlite::params![
                deadline.id,
                deadline.user_id,
                deadline.title,
                deadline.description,
                deadline.due_at.to_rfc3339(),
                deadline.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| DuewatchError::Store(format!("add: {e}")))?;
        Ok(deadline)
    }

    /// Move a deadline's due instant. Returns false when the id is unknown.
    /// The caller must also invalidate the ledger for this deadline.
    pub fn set_due(&self, id: &str, due_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE deadlines SET due_at = ?2 WHERE id = ?1",
                rusqlite::params![id, due_at.to_rfc3339()],
            )
            .map_err(|e| DuewatchError::Store(format!("set due: {e}")))?;
        Ok(changed == 1)
    }

    /// Archive a deadline, removing it from all future scans.
    pub fn archive(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute("UPDATE deadlines SET archived = 1 WHERE id = ?1", [id])
            .map_err(|e| DuewatchError::Store(format!("archive: {e}")))?;
        Ok(changed == 1)
    }

    /// Delete a deadline. The caller must also remove its ledger entries.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute("DELETE FROM deadlines WHERE id = ?1", [id])
            .map_err(|e| DuewatchError::Store(format!("delete: {e}")))?;
        Ok(changed == 1)
    }

    /// Upsert a user's notification preference.
    pub fn update_preference(&self, pref: &NotificationPreference) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notification_settings
             (user_id, timezone, notify_on_due, notify_1_hour, notify_3_hours,
              notify_1_day, notify_3_days, notify_1_week, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id) DO UPDATE SET
                timezone = excluded.timezone,
                notify_on_due = excluded.notify_on_due,
                notify_1_hour = excluded.notify_1_hour,
                notify_3_hours = excluded.notify_3_hours,
                notify_1_day = excluded.notify_1_day,
                notify_3_days = excluded.notify_3_days,
                notify_1_week = excluded.notify_1_week",
            rusqlite::params![
                pref.user_id,
                pref.timezone,
                pref.notify_on_due as i32,
                pref.notify_1_hour as i32,
                pref.notify_3_hours as i32,
                pref.notify_1_day as i32,
                pref.notify_3_days as i32,
                pref.notify_1_week as i32,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| DuewatchError::Store(format!("update preference: {e}")))?;
        Ok(())
    }
}

fn row_to_deadline(row: &Row<'_>) -> rusqlite::Result<Deadline> {
    let due_at: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    Ok(Deadline {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        due_at: DateTime::parse_from_rfc3339(&due_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        archived: row.get::<_, i32>(5)? != 0,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

const DEADLINE_COLUMNS: &str = "id, user_id, title, description, due_at, archived, created_at";

#[async_trait]
impl DeadlineStore for SqliteDeadlineStore {
    async fn list_active_due_before(&self, before: DateTime<Utc>) -> Result<Vec<Deadline>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEADLINE_COLUMNS} FROM deadlines
                 WHERE archived = 0 AND due_at < ?1 ORDER BY due_at"
            ))
            .map_err(|e| DuewatchError::Store(format!("list due: {e}")))?;
        let rows = stmt
            .query_map([before.to_rfc3339()], row_to_deadline)
            .map_err(|e| DuewatchError::Store(format!("list due: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DuewatchError::Store(format!("list due: {e}")))
    }

    async fn list_active(&self) -> Result<Vec<Deadline>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEADLINE_COLUMNS} FROM deadlines
                 WHERE archived = 0 ORDER BY due_at"
            ))
            .map_err(|e| DuewatchError::Store(format!("list active: {e}")))?;
        let rows = stmt
            .query_map([], row_to_deadline)
            .map_err(|e| DuewatchError::Store(format!("list active: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DuewatchError::Store(format!("list active: {e}")))
    }

    async fn preference(&self, user_id: i64) -> Result<NotificationPreference> {
        let conn = self.lock()?;
        // lazy default creation, first read wins
        conn.execute(
            "INSERT OR IGNORE INTO notification_settings
             (user_id, timezone, notify_on_due, notify_1_hour, notify_3_hours,
              notify_1_day, notify_3_days, notify_1_week, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                user_id,
                self.defaults.timezone,
                self.defaults.notify_on_due as i32,
                self.defaults.notify_1_hour as i32,
                self.defaults.notify_3_hours as i32,
                self.defaults.notify_1_day as i32,
                self.defaults.notify_3_days as i32,
                self.defaults.notify_1_week as i32,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| DuewatchError::Store(format!("preference: {e}")))?;

        conn.query_row(
            "SELECT user_id, timezone, notify_on_due, notify_1_hour, notify_3_hours,
                    notify_1_day, notify_3_days, notify_1_week
             FROM notification_settings WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(NotificationPreference {
                    user_id: row.get(0)?,
                    timezone: row.get(1)?,
                    notify_on_due: row.get::<_, i32>(2)? != 0,
                    notify_1_hour: row.get::<_, i32>(3)? != 0,
                    notify_3_hours: row.get::<_, i32>(4)? != 0,
                    notify_1_day: row.get::<_, i32>(5)? != 0,
                    notify_3_days: row.get::<_, i32>(6)? != 0,
                    notify_1_week: row.get::<_, i32>(7)? != 0,
                })
            },
        )
        .map_err(|e| DuewatchError::Store(format!("preference: {e}")))
    }

    async fn get(&self, id: &str) -> Result<Option<Deadline>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {DEADLINE_COLUMNS} FROM deadlines WHERE id = ?1"),
            [id],
            row_to_deadline,
        )
        .optional()
        .map_err(|e| DuewatchError::Store(format!("get: {e}")))
    }
}
