//! Interactive callback payloads and the control rows that carry them.
//!
//! Wire format: `{"button": "Acknowledge"|"Forward", "alert": <correlation id>}`.

use notify::{Button, ControlRow};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::level::Level;

/// Label and payload name of the acknowledge control.
pub const ACKNOWLEDGE: &str = "Acknowledge";

/// Label and payload name of the forward control.
pub const FORWARD: &str = "Forward";

/// What a pressed button asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackAction {
    Acknowledge,
    Forward,
}

impl CallbackAction {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Acknowledge => ACKNOWLEDGE,
            Self::Forward => FORWARD,
        }
    }
}

/// Decoded button payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackData {
    #[serde(rename = "button")]
    pub action: CallbackAction,
    #[serde(rename = "alert")]
    pub alert_id: String,
}

/// Callback payload could not be understood.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Payload was absent
    #[error("callback carries no data")]
    Empty,

    /// Payload was not valid JSON or named an unknown button
    #[error("malformed callback payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CallbackData {
    #[must_use]
    pub fn new(action: CallbackAction, alert_id: impl Into<String>) -> Self {
        Self {
            action,
            alert_id: alert_id.into(),
        }
    }

    /// Parse the opaque data attached to a pressed button.
    pub fn decode(data: Option<&str>) -> Result<Self, CallbackError> {
        let data = data.filter(|d| !d.trim().is_empty()).ok_or(CallbackError::Empty)?;
        Ok(serde_json::from_str(data)?)
    }

    #[must_use]
    pub fn encode(&self) -> String {
        // Two plain fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn button(&self) -> Button {
        Button::new(self.action.label(), self.encode())
    }
}

/// Control row offered for a case at `level`.
///
/// Forward is hidden once the last tier is reached.
#[must_use]
pub fn controls_for_level(alert_id: &str, level: Level) -> ControlRow {
    let mut buttons = vec![CallbackData::new(CallbackAction::Acknowledge, alert_id).button()];
    if !level.is_last() {
        buttons.push(CallbackData::new(CallbackAction::Forward, alert_id).button());
    }
    ControlRow::new(buttons)
}
