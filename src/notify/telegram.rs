//! Telegram Bot API client: `sendMessage` for output and `getUpdates`
//! long polling for command intake.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Notifier, NotifyError};

const API_URL: &str = "https://api.telegram.org";

/// The JSON payload for the Telegram `sendMessage` endpoint.
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    #[serde(default)]
    from: Option<Sender>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
}

/// An incoming text message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub update_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub text: String,
}

/// A client for the Telegram Bot API.
pub struct TelegramClient {
    client: Client,
    base_url: String,
    token: String,
}

impl TelegramClient {
    /// Returns `None` when the token is empty so the caller can fall back to
    /// log-only notifications.
    pub fn new(token: &str) -> Option<Self> {
        if token.is_empty() {
            warn!("Telegram is not configured (missing bot token)");
            return None;
        }
        Some(Self::with_base_url(token, API_URL.to_string()))
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(token: &str, base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            token: token.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let payload = SendMessagePayload {
            chat_id,
            text,
            parse_mode: "MarkdownV2",
        };

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to decode error response".to_string());
            return Err(NotifyError::Api(error_text));
        }

        Ok(())
    }

    /// Long-poll for new messages at or after `offset`. Returns the offset
    /// for the next call along with the text messages received.
    pub async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<(i64, Vec<ChatMessage>), NotifyError> {
        let response = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", timeout.as_secs().to_string()),
                ("allowed_updates", "[\"message\"]".to_string()),
            ])
            .timeout(timeout + Duration::from_secs(10))
            .send()
            .await?;

        let body: ApiResponse<Vec<Update>> = response.json().await?;
        if !body.ok {
            return Err(NotifyError::Api(body.description.unwrap_or_default()));
        }

        let updates = body.result.unwrap_or_default();
        debug!(count = updates.len(), "Received Telegram updates");
        let next_offset = updates
            .iter()
            .map(|u| u.update_id + 1)
            .max()
            .unwrap_or(offset);
        Ok((next_offset, updates.into_iter().filter_map(into_chat_message).collect()))
    }
}

/// Messages with a known sender; a missing text becomes empty.
fn into_chat_message(update: Update) -> Option<ChatMessage> {
    let message = update.message?;
    let sender = message.from?;
    Some(ChatMessage {
        update_id: update.update_id,
        chat_id: message.chat.id,
        user_id: sender.id,
        username: sender.username,
        first_name: sender.first_name,
        text: message.text.unwrap_or_default(),
    })
}

#[async_trait]
impl Notifier for TelegramClient {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        self.send_message(chat_id, text).await
    }
}
