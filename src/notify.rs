use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::DeliveryError;
use crate::models::UserId;
use crate::store::Notifier;

const API_BASE: &str = "https://api.telegram.org";

/// Delivers notifications as Telegram bot messages in the user's chat.
pub struct TelegramNotifier {
    http: reqwest::Client,
    send_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            send_url: format!("{API_BASE}/bot{bot_token}/sendMessage"),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, user_id: UserId, text: &str) -> Result<(), DeliveryError> {
        let body = serde_json::json!({
            "chat_id": user_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        let response = self.http.post(&self.send_url).json(&body).send().await?;
        let status = response.status().as_u16();
        let reply: ApiResponse = response.json().await?;
        if reply.ok {
            return Ok(());
        }

        Err(classify_failure(
            reply.error_code.unwrap_or(status),
            reply.description.as_deref().unwrap_or(""),
        ))
    }
}

/// Blocked, deactivated and never-started chats cannot receive anything again.
fn classify_failure(code: u16, description: &str) -> DeliveryError {
    let lowered = description.to_lowercase();
    let unreachable = code == 403
        || lowered.contains("blocked")
        || lowered.contains("deactivated")
        || lowered.contains("chat not found");

    let message = format!("telegram error {code}: {description}");
    if unreachable {
        DeliveryError::PermanentlyUnreachable(message)
    } else {
        DeliveryError::Transient(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_user_is_unreachable() {
        assert!(matches!(
            classify_failure(403, "Forbidden: bot was blocked by the user"),
            DeliveryError::PermanentlyUnreachable(_)
        ));
        assert!(matches!(
            classify_failure(400, "Bad Request: chat not found"),
            DeliveryError::PermanentlyUnreachable(_)
        ));
    }

    #[test]
    fn rate_limit_and_markup_errors_are_transient() {
        assert!(matches!(
            classify_failure(429, "Too Many Requests: retry after 5"),
            DeliveryError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(400, "Bad Request: can't parse entities"),
            DeliveryError::Transient(_)
        ));
    }

    #[test]
    fn api_reply_parses_without_optional_fields() {
        let reply: ApiResponse = serde_json::from_str(r#"{"ok":true,"result":{}}"#).unwrap();
        assert!(reply.ok);
        assert!(reply.error_code.is_none());
    }
}
