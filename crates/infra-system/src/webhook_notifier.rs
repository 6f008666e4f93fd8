// Webhook notifier
// Posts Slack-compatible `{"text": ...}` payloads; delivery failures are logged only
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, warn};

use scanfleet_core::application::retry::Backoff;
use scanfleet_core::error::{AppError, Result};
use scanfleet_core::port::{Notification, Notifier};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    max_attempts: u32,
    backoff: Backoff,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Config(format!("webhook client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Exponential(DEFAULT_BASE_DELAY),
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = Backoff::Exponential(base_delay);
        self
    }

    async fn post_once(&self, body: &serde_json::Value) -> std::result::Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", status))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) {
        let body = serde_json::json!({ "text": notification.text() });

        for attempt in 1..=self.max_attempts {
            match self.post_once(&body).await {
                Ok(()) => {
                    debug!(attempt = attempt, "Notification delivered");
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Notification delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "Giving up on notification");
                }
            }
        }
    }
}
