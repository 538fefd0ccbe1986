//! Alertmanager API v2 client backing the `/status`, `/alerts` and
//! `/silences` commands.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /api/v2/status`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerStatus {
    pub version_info: VersionInfo,
    /// When the Alertmanager process started
    pub uptime: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

/// One entry of `GET /api/v2/alerts`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAlert {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub status: AlertState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertState {
    /// active, suppressed or unprocessed
    pub state: String,
}

/// One entry of `GET /api/v2/silences`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Silence {
    pub id: String,
    pub status: SilenceState,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SilenceState {
    /// active, pending or expired
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default = "default_true")]
    pub is_equal: bool,
}

fn default_true() -> bool {
    true
}

impl ActiveAlert {
    fn name(&self) -> &str {
        self.labels.get("alertname").map_or("unnamed", String::as_str)
    }

    /// One chat line per alert, plus its summary when present.
    pub fn describe(&self) -> String {
        let mut text = format!(
            "{} [{}] since {}",
            self.name(),
            self.status.state,
            self.starts_at.format("%Y-%m-%d %H:%M UTC")
        );
        let labels: Vec<String> = self
            .labels
            .iter()
            .filter(|(k, _)| k.as_str() != "alertname")
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !labels.is_empty() {
            let _ = write!(text, "\n  {}", labels.join(", "));
        }
        if let Some(summary) = self.annotations.get("summary") {
            let _ = write!(text, "\n  {summary}");
        }
        text
    }
}

impl Matcher {
    fn operator(&self) -> &'static str {
        match (self.is_equal, self.is_regex) {
            (true, false) => "=",
            (false, false) => "!=",
            (true, true) => "=~",
            (false, true) => "!~",
        }
    }
}

impl Silence {
    pub fn is_expired(&self) -> bool {
        self.status.state == "expired"
    }

    pub fn describe(&self) -> String {
        let matchers: Vec<String> = self
            .matchers
            .iter()
            .map(|m| format!("{}{}\"{}\"", m.name, m.operator(), m.value))
            .collect();
        let mut text = format!(
            "{{{}}} until {} ({})",
            matchers.join(", "),
            self.ends_at.format("%Y-%m-%d %H:%M UTC"),
            self.id
        );
        if !self.created_by.is_empty() || !self.comment.is_empty() {
            let _ = write!(text, "\n  {}: {}", self.created_by, self.comment);
        }
        text
    }
}

/// Read-only client for one Alertmanager instance.
#[derive(Debug, Clone)]
pub struct AlertmanagerClient {
    base_url: String,
    client: reqwest::Client,
}

impl AlertmanagerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn status(&self) -> Result<AlertmanagerStatus> {
        self.get("status").await
    }

    pub async fn alerts(&self) -> Result<Vec<ActiveAlert>> {
        self.get("alerts").await
    }

    pub async fn silences(&self) -> Result<Vec<Silence>> {
        self.get("silences").await
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}/api/v2/{endpoint}", self.base_url);
        debug!(url = %url, "Querying Alertmanager");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach Alertmanager")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Alertmanager {endpoint} request failed with status {status}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse Alertmanager {endpoint} response"))
    }
}

/// Coarse human-readable duration: the two largest non-zero units.
pub fn humanize(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    let units = [
        (secs / 86_400, "d"),
        (secs % 86_400 / 3_600, "h"),
        (secs % 3_600 / 60, "m"),
        (secs % 60, "s"),
    ];
    let parts: Vec<String> = units
        .iter()
        .skip_while(|(n, _)| *n == 0)
        .take(2)
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{n}{unit}"))
        .collect();
    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AlertmanagerClient {
        AlertmanagerClient::new(format!("{}/", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "cluster": {"status": "ready"},
                "versionInfo": {"version": "0.27.0", "revision": "0aa3c2a"},
                "config": {"original": ""},
                "uptime": "2024-01-01T00:00:00.000Z"
            })))
            .mount(&server)
            .await;

        let status = client(&server).status().await.unwrap();
        assert_eq!(status.version_info.version, "0.27.0");
        assert_eq!(status.uptime.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_alerts_and_silences() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "labels": {"alertname": "InstanceDown", "instance": "node-1"},
                "annotations": {"summary": "node-1 is down"},
                "startsAt": "2024-01-01T10:30:00Z",
                "endsAt": "2024-01-01T11:30:00Z",
                "fingerprint": "abc",
                "status": {"state": "active", "silencedBy": [], "inhibitedBy": []}
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/silences"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": "s-1",
                "status": {"state": "active"},
                "matchers": [
                    {"name": "alertname", "value": "InstanceDown", "isRegex": false, "isEqual": true},
                    {"name": "instance", "value": "node-.*", "isRegex": true}
                ],
                "startsAt": "2024-01-01T00:00:00Z",
                "endsAt": "2024-01-02T00:00:00Z",
                "createdBy": "alice",
                "comment": "maintenance"
            }])))
            .mount(&server)
            .await;

        let client = client(&server);
        let alerts = client.alerts().await.unwrap();
        assert_eq!(
            alerts[0].describe(),
            "InstanceDown [active] since 2024-01-01 10:30 UTC\n  instance=node-1\n  node-1 is down"
        );

        let silences = client.silences().await.unwrap();
        assert!(!silences[0].is_expired());
        assert_eq!(
            silences[0].describe(),
            "{alertname=\"InstanceDown\", instance=~\"node-.*\"} until 2024-01-02 00:00 UTC (s-1)\n  alice: maintenance"
        );
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/alerts"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = client(&server).alerts().await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize(chrono::Duration::seconds(0)), "0s");
        assert_eq!(humanize(chrono::Duration::seconds(42)), "42s");
        assert_eq!(humanize(chrono::Duration::seconds(3_720)), "1h 2m");
        assert_eq!(humanize(chrono::Duration::seconds(90_000)), "1d 1h");
        assert_eq!(humanize(chrono::Duration::seconds(86_405)), "1d");
    }
}
