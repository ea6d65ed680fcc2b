//! Console transport — logs reminders instead of sending them. Used when
//! no external channel is configured, and handy in demos.

use async_trait::async_trait;
use duewatch_scheduler::{DispatchJob, Outcome, Transport};

use crate::render::render_body;

#[derive(Debug, Default)]
pub struct ConsoleSender;

#[async_trait]
impl Transport for ConsoleSender {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, job: &DispatchJob) -> Outcome {
        tracing::info!("📣 [user {}] {}", job.user_id, render_body(job));
        Outcome::Sent
    }
}
