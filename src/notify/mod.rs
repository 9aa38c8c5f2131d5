//! User notifications and chat command intake.
//!
//! The trading core only produces [`TradeEvent`]s; this layer renders them
//! and delivers them. Delivery failures are logged and never reach trading.

pub mod commands;
pub mod render;
mod telegram;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::trading::TradeEvent;

pub use telegram::{ChatMessage, TelegramClient};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Telegram API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Telegram API returned an error: {0}")]
    Api(String),
}

/// Delivers rendered text to a user's chat.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError>;
}

/// Fallback used when no bot token is configured: messages go to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        info!(chat_id, message = %text, "Notification");
        Ok(())
    }
}

/// Send, logging instead of failing.
pub async fn deliver(notifier: &dyn Notifier, chat_id: i64, text: &str) {
    if let Err(e) = notifier.send(chat_id, text).await {
        warn!(chat_id, error = %e, "Failed to deliver notification");
    }
}

/// Render and deliver trading events to their user.
pub async fn deliver_events(notifier: &dyn Notifier, user_id: i64, events: &[TradeEvent]) {
    for event in events {
        debug!(user_id, event = event.name(), "Delivering trade event");
        deliver(notifier, user_id, &render::event(event)).await;
    }
}
