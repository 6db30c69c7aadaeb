//! Telegram Bot API channel.

use super::{DeliveryError, NotificationChannel};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    token: String,
    timeout: Duration,
}

impl TelegramChannel {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
        }
    }

    fn send_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.token)
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), DeliveryError> {
        let form = [
            ("chat_id", recipient.trim()),
            ("text", text),
            ("parse_mode", "HTML"),
        ];
        let resp = self
            .client
            .post(self.send_url())
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let status = status.as_u16();
        debug!(chat_id = %recipient, status, "telegram accepted message");
        Ok(())
    }
}
