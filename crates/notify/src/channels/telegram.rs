//! Telegram Bot API channel.
//!
//! Outbound calls (`sendMessage`, `editMessageReplyMarkup`,
//! `answerCallbackQuery`) back the [`ChatTransport`] implementation. Inbound
//! updates are fetched with long polling through [`TelegramChannel::get_updates`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::message::{ChatId, ControlRow, MessageId, OutboundMessage, ParseMode};
use crate::ChatTransport;

/// Environment variable for the bot token.
const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";

/// Environment variable overriding the Bot API base URL.
const ENV_TELEGRAM_API_URL: &str = "TELEGRAM_API_URL";

/// Public Bot API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Telegram answers this when an edit would leave the message unchanged.
const NOT_MODIFIED: &str = "message is not modified";

/// Telegram Bot API channel.
pub struct TelegramChannel {
    token: Option<String>,
    api_url: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// Create a Telegram channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let token = std::env::var(ENV_TELEGRAM_TOKEN).ok();
        let api_url =
            std::env::var(ENV_TELEGRAM_API_URL).unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        if token.is_some() {
            debug!("Telegram channel enabled");
        } else {
            debug!("Telegram channel disabled (TELEGRAM_TOKEN not set)");
        }

        Self {
            token,
            api_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Telegram channel with a specific bot token.
    #[must_use]
    pub fn new(token: String) -> Self {
        Self {
            token: Some(token),
            api_url: DEFAULT_API_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the channel at another Bot API server.
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Check if a token is configured.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Fetch the bot's own account. Used at startup to verify the token.
    pub async fn get_me(&self) -> Result<User, ChannelError> {
        self.call("getMe", &serde_json::json!({})).await
    }

    /// Long-poll for updates newer than `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, ChannelError> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout_secs,
            allowed_updates: &["message", "callback_query"],
        };
        self.call("getUpdates", &request).await
    }

    async fn call<B, T>(&self, method: &'static str, body: &B) -> Result<T, ChannelError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_TELEGRAM_TOKEN.to_string()))?;
        let url = format!("{}/bot{token}/{method}", self.api_url);

        debug!(channel = "telegram", method, "Calling Bot API");

        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        let envelope: ApiResponse<T> = serde_json::from_slice(&body).inspect_err(|e| {
            warn!(channel = "telegram", method, status = %status, error = %e, "Bot API returned an unreadable body");
        })?;

        if envelope.ok {
            if let Some(result) = envelope.result {
                return Ok(result);
            }
        }

        if let Some(retry_after_secs) = envelope.parameters.and_then(|p| p.retry_after) {
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let description = envelope
            .description
            .unwrap_or_else(|| format!("HTTP {status}"));
        warn!(
            channel = "telegram",
            method,
            status = %status,
            description = %description,
            "Bot API request failed"
        );
        Err(ChannelError::Rejected {
            method,
            description,
        })
    }
}

#[async_trait]
impl ChatTransport for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send_message(
        &self,
        chat: ChatId,
        message: &OutboundMessage,
    ) -> Result<MessageId, ChannelError> {
        let request = SendMessageRequest {
            chat_id: chat,
            text: &message.text,
            parse_mode: match message.parse_mode {
                ParseMode::Html => Some("HTML"),
                ParseMode::Plain => None,
            },
            reply_markup: message.controls.as_ref().map(InlineKeyboard::from),
        };
        let sent: Message = self.call("sendMessage", &request).await?;
        Ok(sent.message_id)
    }

    async fn edit_controls(
        &self,
        chat: ChatId,
        message: MessageId,
        controls: Option<&ControlRow>,
    ) -> Result<(), ChannelError> {
        let request = EditReplyMarkupRequest {
            chat_id: chat,
            message_id: message,
            reply_markup: controls.map(InlineKeyboard::from),
        };
        // Result is the edited message or `true`; neither is needed.
        match self
            .call::<_, serde_json::Value>("editMessageReplyMarkup", &request)
            .await
        {
            Ok(_) => Ok(()),
            Err(ChannelError::Rejected { description, .. }) if description.contains(NOT_MODIFIED) => {
                debug!(channel = "telegram", chat, message, "Controls already up to date");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChannelError> {
        let request = AnswerCallbackRequest {
            callback_query_id: callback_id,
        };
        self.call::<_, bool>("answerCallbackQuery", &request)
            .await
            .map(|_| ())
    }
}

// =============================================================================
// Telegram API types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'static [&'static str],
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: ChatId,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard>,
}

#[derive(Debug, Serialize)]
struct EditReplyMarkupRequest {
    chat_id: ChatId,
    message_id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboard>,
}

#[derive(Debug, Serialize)]
struct AnswerCallbackRequest<'a> {
    callback_query_id: &'a str,
}

#[derive(Debug, Serialize)]
struct InlineKeyboard {
    inline_keyboard: Vec<Vec<InlineButton>>,
}

#[derive(Debug, Serialize)]
struct InlineButton {
    text: String,
    callback_data: String,
}

impl From<&ControlRow> for InlineKeyboard {
    fn from(row: &ControlRow) -> Self {
        let buttons = row
            .buttons
            .iter()
            .map(|b| InlineButton {
                text: b.text.clone(),
                callback_data: b.data.clone(),
            })
            .collect();
        Self {
            inline_keyboard: vec![buttons],
        }
    }
}

/// Incoming update from `getUpdates`.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    /// Monotonic update identifier
    pub update_id: i64,
    /// New chat message
    pub message: Option<Message>,
    /// Button press on an inline keyboard
    pub callback_query: Option<CallbackQuery>,
}

/// A chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    /// Message identifier inside the chat
    pub message_id: MessageId,
    /// Sender (absent for channel posts)
    pub from: Option<User>,
    /// Chat the message belongs to
    pub chat: Chat,
    /// Text body
    pub text: Option<String>,
}

/// A button press.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    /// Query identifier, needed to answer it
    pub id: String,
    /// Member who pressed the button
    pub from: User,
    /// Message the button was attached to
    pub message: Option<Message>,
    /// Opaque button payload
    pub data: Option<String>,
}

/// A Telegram account.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    /// Numeric user identifier
    pub id: i64,
    /// Display first name
    pub first_name: String,
    /// Optional `@username`
    pub username: Option<String>,
}

impl User {
    /// Username if set, otherwise the first name.
    #[must_use]
    pub fn handle(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.first_name)
    }
}

/// A Telegram chat.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Chat {
    /// Chat identifier
    pub id: ChatId,
    /// "private", "group", "supergroup" or "channel"
    #[serde(rename = "type")]
    pub kind: String,
    /// Group title
    #[serde(default)]
    pub title: Option<String>,
    /// Username of a private chat
    #[serde(default)]
    pub username: Option<String>,
}

impl Chat {
    /// Name to show when listing chats.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}
