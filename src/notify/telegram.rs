use super::{DeliveryError, NotificationChannel};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API `sendMessage`. The delivery address is the chat id.
#[derive(Clone)]
pub struct TelegramChannel {
    api_url: String,
    bot_token: String,
    parse_mode: String,
    http: Client,
}

impl TelegramChannel {
    pub fn new(api_url: &str, bot_token: &str, parse_mode: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            parse_mode: parse_mode.to_string(),
            http,
        })
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    async fn send(&self, delivery_address: &str, message: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "chat_id": delivery_address,
                "text": message,
                "parse_mode": self.parse_mode,
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        let status = resp.status();
        let body: TelegramResponse = resp.json().await?;
        if status.is_success() && body.ok {
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                description: body.description.unwrap_or_default(),
            })
        }
    }
}
