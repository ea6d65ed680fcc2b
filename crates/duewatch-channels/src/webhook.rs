//! Generic HTTP webhook transport — POSTs the reminder as JSON.

use async_trait::async_trait;
use duewatch_core::config::WebhookConfig;
use duewatch_scheduler::{DispatchJob, Outcome, Transport};

use crate::render::render_body;
use crate::telegram::classify_status;

/// Delivers reminders to an external HTTP endpoint.
pub struct WebhookSender {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transport for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, job: &DispatchJob) -> Outcome {
        let mut request = self
            .client
            .post(&self.config.url)
            .json(&serde_json::json!({
                "deadline_id": job.deadline_id,
                "threshold": job.threshold.key(),
                "user_id": job.user_id,
                "title": job.title,
                "body": render_body(job),
                "due_at": job.due_at.to_rfc3339(),
                "late": job.late,
            }))
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return Outcome::TransientFailure(format!("Webhook send failed: {e}")),
        };

        let status = response.status();
        if status.is_success() {
            tracing::info!("✅ Webhook reminder posted to {}", self.config.url);
            return Outcome::Sent;
        }
        classify_status(status, format!("Webhook error {status}"))
    }
}
