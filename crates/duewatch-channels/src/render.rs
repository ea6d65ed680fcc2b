//! Reminder text rendering. The due instant is localized to the
//! recipient's timezone here and nowhere else — threshold math upstream is
//! UTC-only.

use duewatch_core::types::{Threshold, parse_tz};
use duewatch_scheduler::DispatchJob;

/// Render the reminder body for a job.
pub fn render_body(job: &DispatchJob) -> String {
    let tz = parse_tz(&job.timezone);
    let when = job.due_at.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z");

    let mut body = match job.threshold {
        Threshold::Due => format!("Your deadline \"{}\" is due now ({when})!", job.title),
        threshold => format!(
            "\"{}\" is due in {} — {when}.",
            job.title,
            threshold.label()
        ),
    };
    if let Some(description) = &job.description {
        body.push('\n');
        body.push_str(description);
    }
    if job.late {
        body.push_str("\n(This reminder was delayed.)");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn job(threshold: Threshold, timezone: &str) -> DispatchJob {
        DispatchJob {
            deadline_id: "d1".into(),
            threshold,
            user_id: 7,
            title: "thesis".into(),
            description: None,
            due_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            timezone: timezone.into(),
            late: false,
            attempt: 0,
        }
    }

    #[test]
    fn test_render_localizes_due_time() {
        // Moscow is UTC+3 year-round
        let body = render_body(&job(Threshold::OneDay, "Europe/Moscow"));
        assert!(body.contains("due in 1 day"), "{body}");
        assert!(body.contains("2026-03-01 15:00"), "{body}");
    }

    #[test]
    fn test_render_unknown_timezone_falls_back_to_utc() {
        let body = render_body(&job(Threshold::OneHour, "Not/AZone"));
        assert!(body.contains("2026-03-01 12:00"), "{body}");
    }

    #[test]
    fn test_render_overdue() {
        let body = render_body(&job(Threshold::Due, "UTC"));
        assert!(body.contains("is due now"), "{body}");
    }

    #[test]
    fn test_render_late_suffix_and_description() {
        let mut j = job(Threshold::OneDay, "UTC");
        j.late = true;
        j.description = Some("chapter 3 revisions".into());
        let body = render_body(&j);
        assert!(body.contains("chapter 3 revisions"), "{body}");
        assert!(body.contains("delayed"), "{body}");
    }
}
