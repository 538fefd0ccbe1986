//! HTTP server for Alertmanager webhooks.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use escalation::{AlertNotification, AlertStatus, DispatchHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::store::Store;

/// Alertmanager webhook payload.
///
/// Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerPayload {
    #[serde(default)]
    pub version: String,
    /// Unique identifier for this group of alerts
    #[serde(default)]
    pub group_key: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub receiver: String,
    /// Labels the group was formed on
    #[serde(default)]
    pub group_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub external_url: String,
    #[serde(default)]
    pub alerts: Vec<AlertmanagerAlert>,
}

/// Individual alert within a group.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    pub status: AlertStatus,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fingerprint: String,
}

impl AlertmanagerPayload {
    /// Correlation ID for the group: the first group label value by key,
    /// falling back to the group key.
    pub fn correlation_id(&self) -> Option<&str> {
        self.group_labels
            .values()
            .next()
            .map(String::as_str)
            .or(Some(self.group_key.as_str()))
            .filter(|id| !id.is_empty())
    }

    pub fn to_notification(&self) -> Option<AlertNotification> {
        Some(AlertNotification {
            receiver: self.receiver.clone(),
            status: self.status,
            correlation_id: self.correlation_id()?.to_string(),
            labels: self.common_labels.clone(),
            annotations: self.common_annotations.clone(),
        })
    }
}

/// Shared state for HTTP handlers.
pub struct AppState {
    pub handle: DispatchHandle,
    pub store: Arc<Store>,
    pub started_at: DateTime<Utc>,
}

/// Build the relay router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/alertmanager", post(alertmanager_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    started_at: DateTime<Utc>,
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
    })
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    /// Intake events handed to the dispatch loop
    events_submitted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl WebhookResponse {
    fn error(status: StatusCode, error: &str) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                status: "error",
                correlation_id: None,
                events_submitted: 0,
                error: Some(error.to_string()),
            }),
        )
    }
}

async fn alertmanager_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AlertmanagerPayload>,
) -> impl IntoResponse {
    let Some(notification) = payload.to_notification() else {
        warn!(receiver = %payload.receiver, "Alert group has neither group labels nor group key");
        return WebhookResponse::error(StatusCode::BAD_REQUEST, "alert group has no correlation id");
    };
    info!(
        alert_id = %notification.correlation_id,
        status = ?notification.status,
        alerts = payload.alerts.len(),
        "Received Alertmanager webhook"
    );

    let submitted = match notification.status {
        // Resolution closes every case of the alert, wherever it was opened,
        // so it does not depend on who is subscribed now.
        AlertStatus::Resolved => match state.handle.submit_resolved(notification.clone()).await {
            Ok(()) => 1,
            Err(_) => {
                return WebhookResponse::error(StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down")
            }
        },
        AlertStatus::Firing => {
            let chats = state.store.chats().await;
            if chats.is_empty() {
                warn!(alert_id = %notification.correlation_id, "No subscribed chats, alert dropped");
            }
            for chat in &chats {
                if state
                    .handle
                    .submit_alert(notification.clone(), chat.id)
                    .await
                    .is_err()
                {
                    return WebhookResponse::error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "relay is shutting down",
                    );
                }
            }
            chats.len()
        }
    };

    (
        StatusCode::OK,
        Json(WebhookResponse {
            status: "ok",
            correlation_id: Some(notification.correlation_id),
            events_submitted: submitted,
            error: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use escalation::{CaseState, Dispatcher, EscalationConfig, Level, Member};
    use notify::{ChannelError, ChatId, ChatTransport, ControlRow, MessageId, OutboundMessage};
    use tower::ServiceExt;

    use crate::store::SubscribedChat;

    struct NullTransport;

    #[async_trait]
    impl ChatTransport for NullTransport {
        fn name(&self) -> &'static str {
            "null"
        }

        async fn send_message(
            &self,
            _chat: ChatId,
            _message: &OutboundMessage,
        ) -> Result<MessageId, ChannelError> {
            Ok(1)
        }

        async fn edit_controls(
            &self,
            _chat: ChatId,
            _message: MessageId,
            _controls: Option<&ControlRow>,
        ) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn answer_callback(&self, _callback_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    const FIRING: &str = r#"{
        "version": "4",
        "groupKey": "{}:{alertname=\"InstanceDown\"}",
        "status": "firing",
        "receiver": "telegram",
        "groupLabels": {"instance": "node-1", "alertname": "InstanceDown"},
        "commonLabels": {"alertname": "InstanceDown", "instance": "node-1"},
        "commonAnnotations": {"summary": "node-1 is down"},
        "externalURL": "http://alertmanager:9093",
        "alerts": [{
            "status": "firing",
            "labels": {"alertname": "InstanceDown"},
            "annotations": {},
            "startsAt": "2024-01-01T00:00:00Z",
            "fingerprint": "abc"
        }]
    }"#;

    async fn setup(chats: &[ChatId]) -> (Router, Dispatcher, Arc<Store>) {
        let store = Arc::new(Store::in_memory());
        for (i, id) in chats.iter().enumerate() {
            store
                .add_chat(SubscribedChat {
                    id: *id,
                    name: format!("chat-{i}"),
                })
                .await
                .unwrap();
            store
                .add_member(Member::new("alice", Level::L1, *id), Some("other"))
                .await
                .unwrap();
        }
        let (dispatcher, handle) =
            Dispatcher::new(EscalationConfig::default(), store.clone(), Arc::new(NullTransport));
        let state = Arc::new(AppState {
            handle,
            store: store.clone(),
            started_at: Utc::now(),
        });
        (build_router(state), dispatcher, store)
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/alertmanager")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_correlation_id_uses_first_group_label() {
        let payload: AlertmanagerPayload = serde_json::from_str(FIRING).unwrap();
        // "alertname" sorts before "instance"
        assert_eq!(payload.correlation_id(), Some("InstanceDown"));

        let mut payload = payload;
        payload.group_labels.clear();
        assert_eq!(
            payload.correlation_id(),
            Some("{}:{alertname=\"InstanceDown\"}")
        );
        payload.group_key.clear();
        assert_eq!(payload.correlation_id(), None);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _dispatcher, _store) = setup(&[]).await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_webhook_fans_out_to_subscribed_chats() {
        let (app, mut dispatcher, _store) = setup(&[-1, -2]).await;
        let response = app.oneshot(post(FIRING)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["events_submitted"], 2);
        assert_eq!(json["correlation_id"], "InstanceDown");

        assert_eq!(dispatcher.process_pending().await, 2);
        let ids = dispatcher.registry().ids_for("InstanceDown");
        assert_eq!(ids.len(), 2);
        for id in ids {
            let case = dispatcher.registry().get(id).unwrap();
            assert_eq!(case.state(), CaseState::Active(Level::L1));
            assert_eq!(case.assignee, "alice");
        }
    }

    #[tokio::test]
    async fn test_resolved_webhook() {
        let (app, mut dispatcher, _store) = setup(&[-1]).await;
        app.clone().oneshot(post(FIRING)).await.unwrap();
        let resolved = FIRING.replace(r#""status": "firing""#, r#""status": "resolved""#);
        let response = app.oneshot(post(&resolved)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        dispatcher.process_pending().await;
        let ids = dispatcher.registry().ids_for("InstanceDown");
        assert_eq!(
            dispatcher.registry().get(ids[0]).unwrap().state(),
            CaseState::Resolved
        );
    }

    #[tokio::test]
    async fn test_resolved_reaches_cases_after_last_chat_unsubscribes() {
        let (app, mut dispatcher, store) = setup(&[-1]).await;
        app.clone().oneshot(post(FIRING)).await.unwrap();
        dispatcher.process_pending().await;
        let id = dispatcher.registry().ids_for("InstanceDown")[0];
        assert!(dispatcher.timers().is_armed(id));

        assert!(store.remove_chat(-1).await.unwrap());
        let resolved = FIRING.replace(r#""status": "firing""#, r#""status": "resolved""#);
        let response = app.oneshot(post(&resolved)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["events_submitted"], 1);

        dispatcher.process_pending().await;
        let case = dispatcher.registry().get(id).unwrap();
        assert_eq!(case.state(), CaseState::Resolved);
        assert!(!dispatcher.timers().is_armed(id));
    }

    #[tokio::test]
    async fn test_webhook_without_correlation_id() {
        let (app, _dispatcher, _store) = setup(&[-1]).await;
        let response = app
            .oneshot(post(r#"{"status":"firing","receiver":"telegram"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_rejects_unknown_status() {
        let (app, _dispatcher, _store) = setup(&[-1]).await;
        let response = app
            .oneshot(post(r#"{"status":"pending","groupKey":"g"}"#))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_webhook_after_shutdown() {
        let (app, mut dispatcher, _store) = setup(&[-1]).await;
        dispatcher.shutdown().await;
        let response = app.oneshot(post(FIRING)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
