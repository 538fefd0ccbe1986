//! Inbound alert notifications and how they are rendered.

use notify::OutboundMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Alert status as reported by the alerting system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Condition is active
    Firing,
    /// Condition has cleared
    Resolved,
}

/// One notification about an alerting condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertNotification {
    /// Receiver that routed the notification
    pub receiver: String,
    /// Firing or resolved
    pub status: AlertStatus,
    /// Stable key grouping repeated notifications about one condition
    pub correlation_id: String,
    /// Labels common to the alert group
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations common to the alert group
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl AlertNotification {
    /// Create a firing notification with no labels.
    #[must_use]
    pub fn firing(correlation_id: impl Into<String>) -> Self {
        Self {
            receiver: String::new(),
            status: AlertStatus::Firing,
            correlation_id: correlation_id.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Create a resolved notification with no labels.
    #[must_use]
    pub fn resolved(correlation_id: impl Into<String>) -> Self {
        Self {
            status: AlertStatus::Resolved,
            ..Self::firing(correlation_id)
        }
    }

    #[must_use]
    pub fn is_firing(&self) -> bool {
        self.status == AlertStatus::Firing
    }

    /// Node whose owner takes the first level-1 assignment.
    ///
    /// Alerts are grouped by node, so the correlation ID doubles as the node name.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.correlation_id
    }

    /// Get the alert name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map_or("unknown", String::as_str)
    }

    /// Get the summary annotation.
    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        self.annotations.get("summary").map(String::as_str)
    }
}

/// Renders alert notifications into chat messages.
pub trait AlertFormatter: Send + Sync {
    /// Message posted when a case is created.
    fn firing(&self, alert: &AlertNotification) -> OutboundMessage;

    /// Message posted when a case is resolved.
    fn resolved(&self, alert: &AlertNotification) -> OutboundMessage;
}

/// Plain-text formatter used when no template is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter;

impl PlainFormatter {
    fn render(prefix: &str, alert: &AlertNotification) -> String {
        let mut text = format!("[{prefix}] {} ({})", alert.name(), alert.correlation_id);
        if let Some(summary) = alert.summary() {
            let _ = write!(text, "\n{summary}");
        }
        text
    }
}

impl AlertFormatter for PlainFormatter {
    fn firing(&self, alert: &AlertNotification) -> OutboundMessage {
        OutboundMessage::plain(Self::render("FIRING", alert))
    }

    fn resolved(&self, alert: &AlertNotification) -> OutboundMessage {
        OutboundMessage::plain(Self::render("RESOLVED", alert))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let n: AlertNotification = serde_json::from_str(
            r#"{"receiver":"tg","status":"resolved","correlation_id":"nginx"}"#,
        )
        .unwrap();
        assert_eq!(n.status, AlertStatus::Resolved);
        assert!(!n.is_firing());
        assert_eq!(n.node_name(), "nginx");
    }

    #[test]
    fn test_plain_formatter() {
        let mut n = AlertNotification::firing("nginx");
        n.labels.insert("alertname".into(), "InstanceDown".into());
        n.annotations.insert("summary".into(), "nginx is down".into());

        let msg = PlainFormatter.firing(&n);
        assert_eq!(msg.text, "[FIRING] InstanceDown (nginx)\nnginx is down");
        assert!(msg.controls.is_none());
        assert!(PlainFormatter.resolved(&n).text.starts_with("[RESOLVED]"));
    }
}
