//! Core data model — deadlines, reminder thresholds, user preferences.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A user-defined deadline. Owned by the CRUD layer; the scheduler core
/// reads deadlines but never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deadline {
    /// Unique deadline ID.
    pub id: String,
    /// Owning user (also the chat the reminder is delivered to).
    pub user_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Due instant, stored in UTC. All threshold arithmetic happens in UTC;
    /// the owner's timezone matters only when rendering messages.
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Deadline {
    /// Create a new active deadline.
    pub fn new(user_id: i64, title: &str, due_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            title: title.to_string(),
            description: None,
            due_at,
            archived: false,
            created_at: Utc::now(),
        }
    }
}

/// A reminder threshold — the lead time before a deadline at which a
/// notification fires. `Due` is the final on-due notification and carries
/// no lead time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    OneWeek,
    ThreeDays,
    OneDay,
    ThreeHours,
    OneHour,
    Due,
}

impl Threshold {
    /// Lead thresholds in evaluation order — largest lead first.
    pub const LEADS: [Threshold; 5] = [
        Threshold::OneWeek,
        Threshold::ThreeDays,
        Threshold::OneDay,
        Threshold::ThreeHours,
        Threshold::OneHour,
    ];

    /// Lead time before the due instant. Zero for `Due`.
    pub fn lead(&self) -> Duration {
        match self {
            Threshold::OneWeek => Duration::days(7),
            Threshold::ThreeDays => Duration::days(3),
            Threshold::OneDay => Duration::days(1),
            Threshold::ThreeHours => Duration::hours(3),
            Threshold::OneHour => Duration::hours(1),
            Threshold::Due => Duration::zero(),
        }
    }

    /// Stable key used as half of the ledger's composite primary key.
    pub fn key(&self) -> &'static str {
        match self {
            Threshold::OneWeek => "1_week",
            Threshold::ThreeDays => "3_days",
            Threshold::OneDay => "1_day",
            Threshold::ThreeHours => "3_hours",
            Threshold::OneHour => "1_hour",
            Threshold::Due => "due",
        }
    }

    pub fn from_key(key: &str) -> Option<Threshold> {
        match key {
            "1_week" => Some(Threshold::OneWeek),
            "3_days" => Some(Threshold::ThreeDays),
            "1_day" => Some(Threshold::OneDay),
            "3_hours" => Some(Threshold::ThreeHours),
            "1_hour" => Some(Threshold::OneHour),
            "due" => Some(Threshold::Due),
            _ => None,
        }
    }

    /// Human label for rendered messages.
    pub fn label(&self) -> &'static str {
        match self {
            Threshold::OneWeek => "1 week",
            Threshold::ThreeDays => "3 days",
            Threshold::OneDay => "1 day",
            Threshold::ThreeHours => "3 hours",
            Threshold::OneHour => "1 hour",
            Threshold::Due => "now",
        }
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Per-user notification preferences. Read by the scheduler, written only
/// by the settings CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub user_id: i64,
    /// IANA timezone identifier. Affects rendering only, never threshold math.
    pub timezone: String,
    pub notify_on_due: bool,
    pub notify_1_hour: bool,
    pub notify_3_hours: bool,
    pub notify_1_day: bool,
    pub notify_3_days: bool,
    pub notify_1_week: bool,
}

impl NotificationPreference {
    /// Defaults for a user seen for the first time: on-due and 1-day reminders.
    pub fn defaults(user_id: i64) -> Self {
        Self {
            user_id,
            timezone: "UTC".into(),
            notify_on_due: true,
            notify_1_hour: false,
            notify_3_hours: false,
            notify_1_day: true,
            notify_3_days: false,
            notify_1_week: false,
        }
    }

    /// Build a preference with exactly the given thresholds enabled.
    pub fn from_enabled(user_id: i64, timezone: &str, enabled: &[Threshold]) -> Self {
        let mut pref = Self {
            user_id,
            timezone: timezone.to_string(),
            notify_on_due: false,
            notify_1_hour: false,
            notify_3_hours: false,
            notify_1_day: false,
            notify_3_days: false,
            notify_1_week: false,
        };
        for threshold in enabled {
            pref.set_enabled(*threshold, true);
        }
        pref
    }

    pub fn set_enabled(&mut self, threshold: Threshold, on: bool) {
        match threshold {
            Threshold::OneWeek => self.notify_1_week = on,
            Threshold::ThreeDays => self.notify_3_days = on,
            Threshold::OneDay => self.notify_1_day = on,
            Threshold::ThreeHours => self.notify_3_hours = on,
            Threshold::OneHour => self.notify_1_hour = on,
            Threshold::Due => self.notify_on_due = on,
        }
    }

    pub fn is_enabled(&self, threshold: Threshold) -> bool {
        match threshold {
            Threshold::OneWeek => self.notify_1_week,
            Threshold::ThreeDays => self.notify_3_days,
            Threshold::OneDay => self.notify_1_day,
            Threshold::ThreeHours => self.notify_3_hours,
            Threshold::OneHour => self.notify_1_hour,
            Threshold::Due => self.notify_on_due,
        }
    }

    /// Enabled lead thresholds, largest lead first.
    pub fn enabled_leads(&self) -> Vec<Threshold> {
        Threshold::LEADS
            .iter()
            .copied()
            .filter(|t| self.is_enabled(*t))
            .collect()
    }
}

/// Parse an IANA timezone identifier, falling back to UTC. A bad identifier
/// is a data problem, never a scheduling problem.
pub fn parse_tz(id: &str) -> Tz {
    id.parse().unwrap_or_else(|_| {
        tracing::warn!("unknown timezone '{id}', falling back to UTC");
        chrono_tz::UTC
    })
}
