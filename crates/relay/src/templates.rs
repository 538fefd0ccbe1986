//! Alert message rendering using Handlebars.
//!
//! One template renders both firing and resolved notifications; it can tell
//! them apart through the `firing` flag in the context. Output is sent with
//! HTML parse mode, so values are HTML-escaped.

use anyhow::{Context, Result};
use escalation::{AlertFormatter, AlertNotification, PlainFormatter};
use handlebars::Handlebars;
use notify::OutboundMessage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

const TEMPLATE_NAME: &str = "alert";

/// Built-in alert template.
pub const DEFAULT_TEMPLATE: &str = "\
<b>[{{status_label}}] {{alertname}}</b>{{#each labels}}
{{@key}}: {{this}}{{/each}}{{#if summary}}

{{summary}}{{/if}}";

#[derive(Debug, Serialize)]
struct AlertContext<'a> {
    firing: bool,
    status_label: &'static str,
    alertname: &'a str,
    receiver: &'a str,
    correlation_id: &'a str,
    summary: Option<&'a str>,
    labels: &'a BTreeMap<String, String>,
    annotations: &'a BTreeMap<String, String>,
}

/// Formatter backed by a Handlebars template.
pub struct TemplateFormatter {
    handlebars: Handlebars<'static>,
}

impl TemplateFormatter {
    /// Formatter using [`DEFAULT_TEMPLATE`].
    pub fn new() -> Result<Self> {
        Self::from_source(DEFAULT_TEMPLATE)
    }

    /// Formatter using the template file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        Self::from_source(&source)
            .with_context(|| format!("Invalid template {}", path.display()))
    }

    pub fn from_source(source: &str) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars
            .register_template_string(TEMPLATE_NAME, source)
            .context("Failed to compile alert template")?;
        Ok(Self { handlebars })
    }

    fn render(&self, alert: &AlertNotification) -> Result<String> {
        let firing = alert.is_firing();
        let context = AlertContext {
            firing,
            status_label: if firing { "FIRING" } else { "RESOLVED" },
            alertname: alert.name(),
            receiver: &alert.receiver,
            correlation_id: &alert.correlation_id,
            summary: alert.summary(),
            labels: &alert.labels,
            annotations: &alert.annotations,
        };
        Ok(self.handlebars.render(TEMPLATE_NAME, &context)?)
    }

    fn format(&self, alert: &AlertNotification) -> OutboundMessage {
        match self.render(alert) {
            Ok(text) => OutboundMessage::html(text.trim_end()),
            Err(e) => {
                warn!(alert_id = %alert.correlation_id, error = %e, "Template rendering failed, using plain text");
                if alert.is_firing() {
                    PlainFormatter.firing(alert)
                } else {
                    PlainFormatter.resolved(alert)
                }
            }
        }
    }
}

impl AlertFormatter for TemplateFormatter {
    fn firing(&self, alert: &AlertNotification) -> OutboundMessage {
        self.format(alert)
    }

    fn resolved(&self, alert: &AlertNotification) -> OutboundMessage {
        self.format(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::ParseMode;

    fn alert() -> AlertNotification {
        let mut alert = AlertNotification::firing("node-1");
        alert.labels.insert("alertname".into(), "InstanceDown".into());
        alert.labels.insert("instance".into(), "node-1:9100".into());
        alert
            .annotations
            .insert("summary".into(), "node-1 <unreachable>".into());
        alert
    }

    #[test]
    fn test_default_template() {
        let formatter = TemplateFormatter::new().unwrap();
        let msg = formatter.firing(&alert());

        assert_eq!(msg.parse_mode, ParseMode::Html);
        assert!(msg.text.starts_with("<b>[FIRING] InstanceDown</b>"));
        assert!(msg.text.contains("\nalertname: InstanceDown\n"));
        assert!(msg.text.contains("\ninstance: node-1:9100\n\n"));
        assert!(msg.text.ends_with("node-1 &lt;unreachable&gt;"));
    }

    #[test]
    fn test_resolved_label() {
        let formatter = TemplateFormatter::new().unwrap();
        let mut resolved = alert();
        resolved.status = escalation::AlertStatus::Resolved;
        assert!(formatter
            .resolved(&resolved)
            .text
            .starts_with("<b>[RESOLVED] InstanceDown</b>"));
    }

    #[test]
    fn test_custom_template_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("alert.hbs");
        std::fs::write(
            &path,
            "{{#if firing}}down{{else}}up{{/if}}: {{correlation_id}}",
        )
        .unwrap();

        let formatter = TemplateFormatter::from_file(&path).unwrap();
        assert_eq!(formatter.firing(&alert()).text, "down: node-1");
        assert_eq!(
            formatter
                .resolved(&AlertNotification::resolved("node-1"))
                .text,
            "up: node-1"
        );
    }

    #[test]
    fn test_invalid_template_rejected() {
        assert!(TemplateFormatter::from_source("{{#if firing}}unclosed").is_err());
        assert!(TemplateFormatter::from_file(Path::new("/nonexistent/alert.hbs")).is_err());
    }
}
