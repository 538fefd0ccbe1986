//! Chat channel implementations.

pub mod telegram;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::message::{ChatId, ControlRow, MessageId, OutboundMessage};

/// Trait for chat platforms that can carry interactive alert messages.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Send a message and return the platform's reference to it.
    async fn send_message(
        &self,
        chat: ChatId,
        message: &OutboundMessage,
    ) -> Result<MessageId, ChannelError>;

    /// Replace the control row of an existing message. `None` clears it.
    async fn edit_controls(
        &self,
        chat: ChatId,
        message: MessageId,
        controls: Option<&ControlRow>,
    ) -> Result<(), ChannelError>;

    /// Tell the platform an interactive callback has been handled.
    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChannelError>;
}
