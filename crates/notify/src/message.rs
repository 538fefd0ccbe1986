//! Outbound message types shared by every chat channel.

use serde::{Deserialize, Serialize};

/// Identifier of a chat (user, group or channel) on the platform.
pub type ChatId = i64;

/// Identifier of a message inside a chat, used for later edits.
pub type MessageId = i64;

/// How the platform should interpret the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParseMode {
    /// Plain text
    #[default]
    Plain,
    /// Platform HTML subset
    Html,
}

/// A single interactive button.
///
/// `data` is opaque to the transport: it is handed back verbatim in the
/// callback raised when a chat member presses the button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Label shown to chat members
    pub text: String,
    /// Opaque callback payload
    pub data: String,
}

impl Button {
    /// Create a button.
    #[must_use]
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

/// One row of buttons attached under a message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlRow {
    /// Buttons, left to right
    pub buttons: Vec<Button>,
}

impl ControlRow {
    /// Create a row from buttons.
    #[must_use]
    pub fn new(buttons: Vec<Button>) -> Self {
        Self { buttons }
    }

    /// Labels of the buttons in order.
    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.buttons.iter().map(|b| b.text.as_str()).collect()
    }

    /// Whether a button with this label is present.
    #[must_use]
    pub fn has(&self, label: &str) -> bool {
        self.buttons.iter().any(|b| b.text == label)
    }
}

/// A message to send into a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Message body
    pub text: String,
    /// Text interpretation
    pub parse_mode: ParseMode,
    /// Optional control row
    pub controls: Option<ControlRow>,
}

impl OutboundMessage {
    /// Plain text message without controls.
    #[must_use]
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parse_mode: ParseMode::Plain,
            controls: None,
        }
    }

    /// HTML message without controls.
    #[must_use]
    pub fn html(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parse_mode: ParseMode::Html,
            controls: None,
        }
    }

    /// Attach a control row.
    #[must_use]
    pub fn with_controls(mut self, controls: ControlRow) -> Self {
        self.controls = Some(controls);
        self
    }
}
