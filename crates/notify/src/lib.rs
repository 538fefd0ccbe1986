//! Chat transport for the alert relay.
//!
//! This crate sends alert messages with interactive control rows into a chat
//! platform and edits those rows later as alerts are acknowledged, forwarded
//! or resolved.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Button, ChatTransport, ControlRow, OutboundMessage, TelegramChannel};
//!
//! # async fn run() -> Result<(), notify::ChannelError> {
//! let telegram = TelegramChannel::from_env();
//!
//! let msg = OutboundMessage::html("<b>nginx down</b>").with_controls(ControlRow::new(vec![
//!     Button::new("Acknowledge", r#"{"button":"Acknowledge","alert":"nginx"}"#),
//! ]));
//! let message_id = telegram.send_message(-1001, &msg).await?;
//! telegram.edit_controls(-1001, message_id, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! - `TELEGRAM_TOKEN`: Bot API token (enables the Telegram channel)
//! - `TELEGRAM_API_URL`: Bot API base URL, defaults to the public endpoint
//!
//! # Architecture
//!
//! - [`ChatTransport`] trait defines the send/edit surface the escalation
//!   engine drives
//! - [`TelegramChannel`] implements it over the Telegram Bot API and also
//!   exposes long polling for inbound updates

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod message;

pub use channels::telegram::TelegramChannel;
pub use channels::ChatTransport;
pub use error::ChannelError;
pub use message::{Button, ChatId, ControlRow, MessageId, OutboundMessage, ParseMode};
