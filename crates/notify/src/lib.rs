use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

mod message;

pub use message::{ChangeReport, Message};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers messages to whoever is watching.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        info!(message = %message.render(), "notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// Posts messages to a Telegram chat through the bot API.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        Self::with_api_base(TELEGRAM_API_BASE, bot_token, chat_id)
    }

    pub fn with_api_base(api_base: &str, bot_token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), bot_token),
            chat_id: chat_id.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &Message) -> Result<(), NotifyError> {
        let text = message.render();
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text: &text,
            disable_web_page_preview: false,
        };
        let response = self.client.post(&self.endpoint).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Telegram when both credentials are present, otherwise the log.
pub fn from_credentials(
    bot_token: Option<&str>,
    chat_id: Option<&str>,
) -> Result<Arc<dyn Notifier>, NotifyError> {
    let token = bot_token.map(str::trim).filter(|t| !t.is_empty());
    let chat = chat_id.map(str::trim).filter(|c| !c.is_empty());
    match (token, chat) {
        (Some(token), Some(chat)) => Ok(Arc::new(TelegramNotifier::new(token, chat)?)),
        _ => {
            warn!("telegram credentials not set; notifications go to the log");
            Ok(Arc::new(LogNotifier))
        }
    }
}
