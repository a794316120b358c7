use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use mailhook_common::envelope::{NotificationBatch, NotificationEnvelope};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use crate::metrics_consts::{
    NOTIFICATIONS_RECEIVED_COUNTER, NOTIFICATIONS_REJECTED_COUNTER, NOTIFICATION_QUEUE_FULL_COUNTER,
};

/// Shared state of the ingress: the expected `clientState` and the queue the worker consumes.
#[derive(Clone)]
pub struct IngressState {
    client_state: Arc<str>,
    queue: mpsc::Sender<Vec<NotificationEnvelope>>,
}

impl IngressState {
    pub fn new(client_state: &str, queue: mpsc::Sender<Vec<NotificationEnvelope>>) -> Self {
        Self {
            client_state: Arc::from(client_state),
            queue,
        }
    }
}

#[derive(Deserialize)]
pub struct WebhookParams {
    #[serde(rename = "validationToken")]
    validation_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Receive a batch of change notifications.
///
/// The provider validates a new subscription by POSTing a `validationToken` query parameter,
/// which must be echoed back as plain text. Every other request carries a batch whose
/// notifications must all hold our `clientState`. Accepted batches are queued for the worker and
/// acknowledged right away; processing continues after the response is sent.
pub async fn post_webhook(
    State(state): State<IngressState>,
    Query(params): Query<WebhookParams>,
    body: Bytes,
) -> Response {
    if let Some(token) = params.validation_token {
        debug!("answering subscription validation handshake");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token,
        )
            .into_response();
    }

    let batch: NotificationBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => return rejected(StatusCode::BAD_REQUEST, &format!("invalid body: {e}")),
    };

    metrics::counter!(NOTIFICATIONS_RECEIVED_COUNTER).increment(batch.value.len() as u64);

    if batch
        .value
        .iter()
        .any(|n| n.client_state.as_deref() != Some(state.client_state.as_ref()))
    {
        metrics::counter!(NOTIFICATIONS_REJECTED_COUNTER).increment(batch.value.len() as u64);
        return rejected(StatusCode::UNAUTHORIZED, "clientState does not match");
    }

    let count = batch.value.len();
    if count > 0 {
        match state.queue.try_send(batch.value) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!(NOTIFICATION_QUEUE_FULL_COUNTER).increment(1);
                return rejected(StatusCode::SERVICE_UNAVAILABLE, "notification queue is full");
            }
            Err(TrySendError::Closed(_)) => {
                error!("notification queue is closed");
                return rejected(StatusCode::SERVICE_UNAVAILABLE, "notification queue is closed");
            }
        }
    }

    (
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            status: "accepted".to_owned(),
            count: Some(count),
            error: None,
        }),
    )
        .into_response()
}

fn rejected(status: StatusCode, msg: &str) -> Response {
    warn!(status = status.as_u16(), msg);
    (
        status,
        Json(WebhookResponse {
            status: "rejected".to_owned(),
            count: None,
            error: Some(msg.to_owned()),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{
        body::Body,
        http::{self, Request},
        Router,
    };
    use http_body_util::BodyExt; // for `collect`
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use crate::handlers::app::add_routes;

    const MAX_BODY_SIZE: usize = 1_000_000;

    fn app(capacity: usize) -> (Router, Receiver<Vec<NotificationEnvelope>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let app = add_routes(
            Router::new(),
            IngressState::new("s3cret", tx),
            MAX_BODY_SIZE,
            10,
        );
        (app, rx)
    }

    fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    fn notifications(client_state: &str, n: usize) -> String {
        json!({
            "value": (0..n).map(|i| json!({
                "subscriptionId": "sub",
                "clientState": client_state,
                "changeType": "created",
                "resource": format!("Users/ap@corp.com/Messages/AAMk{i}"),
            })).collect::<Vec<_>>()
        })
        .to_string()
    }

    async fn json_body(response: Response) -> WebhookResponse {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn webhook_validation_handshake() {
        let (app, mut rx) = app(1);

        let response = app
            .oneshot(post("/webhook?validationToken=abc%20123", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"abc 123");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn webhook_accepts_and_enqueues_batch() {
        let (app, mut rx) = app(1);

        let response = app
            .oneshot(post("/webhook", notifications("s3cret", 3)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            json_body(response).await,
            WebhookResponse {
                status: "accepted".to_owned(),
                count: Some(3),
                error: None,
            }
        );

        let batch = rx.try_recv().expect("batch should be queued");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].resource, "Users/ap@corp.com/Messages/AAMk2");
        assert_eq!(batch[0].change_type, "created");
    }

    #[tokio::test]
    async fn webhook_empty_batch_is_accepted_without_enqueueing() {
        let (app, mut rx) = app(1);

        let response = app
            .oneshot(post("/webhook", r#"{"value": []}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn webhook_envelope_without_resource_does_not_reject_batch() {
        let (app, mut rx) = app(1);

        let response = app
            .oneshot(post(
                "/webhook",
                r#"{"value": [
                    {"clientState": "s3cret", "changeType": "created", "resource": "Users/a/Messages/b"},
                    {"clientState": "s3cret", "changeType": "created"}
                ]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await.count, Some(2));

        let batch = rx.try_recv().expect("batch should be queued");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].resource, "");
    }

    #[tokio::test]
    async fn webhook_rejects_wrong_client_state() {
        let (app, mut rx) = app(1);

        let response = app
            .oneshot(post("/webhook", notifications("guess", 1)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn webhook_rejects_missing_client_state() {
        let (app, _rx) = app(1);

        let response = app
            .oneshot(post(
                "/webhook",
                r#"{"value": [{"resource": "Users/a/Messages/b", "changeType": "created"}]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_payload_not_json() {
        let (app, _rx) = app(1);

        let response = app.oneshot(post("/webhook", "x")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await.status, "rejected");
    }

    #[tokio::test]
    async fn webhook_payload_body_too_large() {
        let (app, _rx) = app(1);

        let bytes: Vec<u8> = vec![b'a'; MAX_BODY_SIZE + 1];

        let response = app.oneshot(post("/webhook", bytes)).await.unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn webhook_queue_full() {
        let (app, _rx) = app(1);

        let response = app
            .clone()
            .oneshot(post("/webhook", notifications("s3cret", 1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .oneshot(post("/webhook", notifications("s3cret", 1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
