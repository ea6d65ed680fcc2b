//! Telegram Bot API transport — reminder delivery via `sendMessage`.

use async_trait::async_trait;
use duewatch_core::config::TelegramConfig;
use duewatch_scheduler::{DispatchJob, Outcome, Transport};

use crate::render::render_body;

/// Sends reminders to the owning user's chat through the Bot API.
pub struct TelegramSender {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramSender {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{}",
            self.config.bot_token, method
        )
    }
}

#[async_trait]
impl Transport for TelegramSender {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, job: &DispatchJob) -> Outcome {
        let text = format!("⏰ {}", render_body(job));
        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": job.user_id,
                "text": text,
            }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            // network trouble is worth retrying
            Err(e) => return Outcome::TransientFailure(format!("Telegram send failed: {e}")),
        };

        let status = response.status();
        if status.is_success() {
            tracing::info!("✅ Telegram reminder sent to chat {}", job.user_id);
            return Outcome::Sent;
        }
        let detail = response.text().await.unwrap_or_default();
        classify_status(status, format!("Telegram API error {status}: {detail}"))
    }
}

/// Map an HTTP error status to a dispatch outcome. 429 and 5xx are the
/// provider telling us to back off; other 4xx (blocked bot, unknown chat)
/// will never succeed.
pub(crate) fn classify_status(status: reqwest::StatusCode, detail: String) -> Outcome {
    if status.as_u16() == 429 || status.is_server_error() {
        Outcome::TransientFailure(detail)
    } else {
        Outcome::PermanentFailure(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "x".into()),
            Outcome::TransientFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "x".into()),
            Outcome::TransientFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "x".into()),
            Outcome::PermanentFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "x".into()),
            Outcome::PermanentFailure(_)
        ));
    }
}
