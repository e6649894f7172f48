//! HTTP tunnel for the broker's pub/sub.
//!
//! Agents that cannot reach Valkey directly publish and long-poll through
//! this service. Each relay subscription wraps one upstream [`Subscription`]
//! and buffers what arrives between polls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dockhand_bus::shutdown;
use dockhand_bus::transport::http::wire::{
    self, ErrorBody, PollQuery, PollResponse, PublishRequest, SubscribeRequest, SubscribeResponse,
};
use dockhand_bus::{Subscription, Transport, TransportError};
use thiserror::Error;
use tokio::sync::watch;

/// Upper bound on messages returned by one poll.
pub const MAX_POLL_BATCH: usize = 1000;

// ===================================================================
// Errors
// ===================================================================

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("unknown subscription: {0}")]
    NotFound(String),

    #[error("subscription closed upstream: {0}")]
    Gone(String),

    #[error("payload is not valid base64: {0}")]
    BadPayload(String),

    #[error("upstream broker: {0}")]
    Upstream(#[from] TransportError),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::BadPayload(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "relay request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

// ===================================================================
// State
// ===================================================================

struct RelaySubscription {
    channel: String,
    upstream: tokio::sync::Mutex<Subscription>,
    last_seen: Mutex<Instant>,
}

impl RelaySubscription {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Relay settings that are not tied to the upstream connection.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Shared bearer token; `None` disables auth.
    pub token: Option<String>,
    /// Subscriptions not polled for this long are dropped.
    pub idle_timeout: Duration,
    /// Cap on the client-requested long-poll wait.
    pub max_wait: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            token: None,
            idle_timeout: Duration::from_secs(120),
            max_wait: Duration::from_secs(30),
        }
    }
}

pub struct RelayState {
    upstream: Arc<dyn Transport>,
    settings: RelaySettings,
    subscriptions: Mutex<HashMap<String, Arc<RelaySubscription>>>,
}

impl RelayState {
    pub fn new(upstream: Arc<dyn Transport>, settings: RelaySettings) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            settings,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RelaySubscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: &str) -> Result<Arc<RelaySubscription>, RelayError> {
        self.table()
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(id.to_string()))
    }

    fn remove(&self, id: &str) -> Option<Arc<RelaySubscription>> {
        self.table().remove(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.table().len()
    }

    /// Drop subscriptions idle past the timeout. Returns how many went.
    ///
    /// A subscription with a poll in flight is never idle.
    pub fn reap_idle(&self) -> usize {
        let ttl = self.settings.idle_timeout;
        let mut table = self.table();
        let before = table.len();
        table.retain(|id, sub| {
            let busy = sub.upstream.try_lock().is_err();
            let keep = busy || sub.idle_for() < ttl;
            if !keep {
                tracing::info!(subscription_id = %id, channel = %sub.channel, "reaping idle subscription");
            }
            keep
        });
        before - table.len()
    }
}

/// Reap idle subscriptions every half timeout until `stop` fires.
pub async fn run_reaper(state: Arc<RelayState>, mut stop: watch::Receiver<bool>) {
    let period = (state.settings.idle_timeout / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            () = shutdown::wait_for(&mut stop) => break,
            _ = ticker.tick() => {
                state.reap_idle();
            }
        }
    }
}

// ===================================================================
// Handlers
// ===================================================================

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn publish(
    State(state): State<Arc<RelayState>>,
    Json(request): Json<PublishRequest>,
) -> Result<StatusCode, RelayError> {
    let bytes = wire::decode_payload(&request.payload)
        .map_err(|e| RelayError::BadPayload(e.to_string()))?;
    state.upstream.publish(&request.channel, &bytes).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn subscribe(
    State(state): State<Arc<RelayState>>,
    Json(request): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscribeResponse>), RelayError> {
    let upstream = state.upstream.subscribe(&request.channel).await?;
    let id = uuid::Uuid::new_v4().to_string();
    let entry = Arc::new(RelaySubscription {
        channel: request.channel,
        upstream: tokio::sync::Mutex::new(upstream),
        last_seen: Mutex::new(Instant::now()),
    });
    tracing::debug!(subscription_id = %id, channel = %entry.channel, "relay subscription opened");
    state.table().insert(id.clone(), entry);
    Ok((
        StatusCode::CREATED,
        Json(SubscribeResponse {
            subscription_id: id,
        }),
    ))
}

async fn poll(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, RelayError> {
    let entry = state.get(&id)?;
    entry.touch();
    let wait = Duration::from_millis(query.wait_ms).min(state.settings.max_wait);
    let max = query.max.clamp(1, MAX_POLL_BATCH);

    let mut upstream = entry.upstream.lock().await;
    let mut messages = Vec::new();
    match tokio::time::timeout(wait, upstream.recv()).await {
        Err(_elapsed) => {}
        Ok(None) => {
            drop(upstream);
            state.remove(&id);
            tracing::debug!(subscription_id = %id, "upstream subscription closed");
            return Err(RelayError::Gone(id));
        }
        Ok(Some(first)) => {
            messages.push(wire::encode_payload(&first));
            while messages.len() < max {
                let Some(next) = upstream.try_recv() else {
                    break;
                };
                messages.push(wire::encode_payload(&next));
            }
        }
    }
    drop(upstream);
    entry.touch();
    Ok(Json(PollResponse { messages }))
}

async fn unsubscribe(
    State(state): State<Arc<RelayState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, RelayError> {
    state
        .remove(&id)
        .ok_or_else(|| RelayError::NotFound(id.clone()))?;
    tracing::debug!(subscription_id = %id, "relay subscription closed by client");
    Ok(StatusCode::NO_CONTENT)
}

async fn require_token(
    State(state): State<Arc<RelayState>>,
    request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    if let Some(expected) = &state.settings.token {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return Err(RelayError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

/// Build the relay's router. `/health` is served without auth.
pub fn router(state: Arc<RelayState>) -> Router {
    let api = Router::new()
        .route("/v1/publish", post(publish))
        .route("/v1/subscriptions", post(subscribe))
        .route("/v1/subscriptions/{id}", delete(unsubscribe))
        .route("/v1/subscriptions/{id}/messages", get(poll))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state);
    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;
    use axum::body::Body;
    use dockhand_bus::MemoryBroker;
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    fn state_with(broker: &Arc<MemoryBroker>, settings: RelaySettings) -> Arc<RelayState> {
        RelayState::new(broker.clone(), settings)
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn publish_forwards_decoded_bytes() {
        let broker = Arc::new(MemoryBroker::new());
        let app = router(state_with(&broker, RelaySettings::default()));
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/publish",
                &serde_json::json!({"channel": "cmd:k", "payload": wire::encode_payload(b"hi")}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(broker.published("cmd:k"), vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn bad_base64_is_rejected() {
        let broker = Arc::new(MemoryBroker::new());
        let app = router(state_with(&broker, RelaySettings::default()));
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/publish",
                &serde_json::json!({"channel": "cmd:k", "payload": "%%%"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upstream_subscribe_failure_is_bad_gateway() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_fail_subscribe(true);
        let app = router(state_with(&broker, RelaySettings::default()));
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/subscriptions",
                &serde_json::json!({"channel": "resp:k"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: ErrorBody = body_json(response).await;
        assert!(body.error.contains("upstream"));
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let broker = Arc::new(MemoryBroker::new());
        let app = router(state_with(&broker, RelaySettings::default()));
        let response = app
            .oneshot(
                axum::http::Request::get("/v1/subscriptions/nope/messages?wait_ms=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn poll_returns_buffered_messages_then_gone_after_disconnect() {
        let broker = Arc::new(MemoryBroker::new());
        let state = state_with(&broker, RelaySettings::default());
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/subscriptions",
                &serde_json::json!({"channel": "resp:k"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let SubscribeResponse { subscription_id } = body_json(response).await;

        broker.publish("resp:k", b"one").await.unwrap();
        broker.publish("resp:k", b"two").await.unwrap();
        let uri = format!("/v1/subscriptions/{subscription_id}/messages?wait_ms=1000&max=10");
        let response = app
            .clone()
            .oneshot(axum::http::Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let batch: PollResponse = body_json(response).await;
        let decoded: Vec<Vec<u8>> = batch
            .messages
            .iter()
            .map(|m| wire::decode_payload(m).unwrap())
            .collect();
        assert_eq!(decoded, vec![b"one".to_vec(), b"two".to_vec()]);

        broker.disconnect_all();
        let response = app
            .oneshot(axum::http::Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(state.subscription_count(), 0);
    }

    #[tokio::test]
    async fn token_is_required_except_for_health() {
        let broker = Arc::new(MemoryBroker::new());
        let settings = RelaySettings {
            token: Some("s3cret".to_string()),
            ..RelaySettings::default()
        };
        let app = router(state_with(&broker, settings));

        let health = app
            .clone()
            .oneshot(axum::http::Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let body = serde_json::json!({"channel": "cmd:k", "payload": ""});
        let denied = app
            .clone()
            .oneshot(json_request("POST", "/v1/publish", &body))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut allowed = json_request("POST", "/v1/publish", &body);
        allowed
            .headers_mut()
            .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        assert_eq!(
            app.oneshot(allowed).await.unwrap().status(),
            StatusCode::NO_CONTENT
        );
    }

    #[tokio::test]
    async fn idle_subscriptions_are_reaped() {
        let broker = Arc::new(MemoryBroker::new());
        let settings = RelaySettings {
            idle_timeout: Duration::from_millis(20),
            ..RelaySettings::default()
        };
        let state = state_with(&broker, settings);
        let app = router(state.clone());
        app.oneshot(json_request(
            "POST",
            "/v1/subscriptions",
            &serde_json::json!({"channel": "resp:k"}),
        ))
        .await
        .unwrap();
        assert_eq!(state.reap_idle(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(state.reap_idle(), 1);
        assert_eq!(state.subscription_count(), 0);
        // Dropping the relay subscription released the upstream one.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.subscriber_count("resp:k"), 0);
    }
}
