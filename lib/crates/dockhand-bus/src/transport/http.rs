//! Pub/sub tunneled through `dockhand-relay`.
//!
//! Publish is a single `POST`. Subscribe registers a relay-side subscription
//! and spawns a long-poll pump that feeds the local queue, so callers see the
//! same behaviour as a direct connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::mpsc;

use super::{Subscription, Transport, SUBSCRIPTION_BUFFER};
use crate::error::TransportError;

/// Request and response bodies shared with the relay.
pub mod wire {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct PublishRequest {
        pub channel: String,
        /// Base64 of the raw message bytes.
        pub payload: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct SubscribeRequest {
        pub channel: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct SubscribeResponse {
        pub subscription_id: String,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
    pub struct PollResponse {
        pub messages: Vec<String>,
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    pub struct PollQuery {
        #[serde(default = "default_wait_ms")]
        pub wait_ms: u64,
        #[serde(default = "default_max")]
        pub max: usize,
    }

    impl Default for PollQuery {
        fn default() -> Self {
            Self {
                wait_ms: default_wait_ms(),
                max: default_max(),
            }
        }
    }

    fn default_wait_ms() -> u64 {
        25_000
    }

    fn default_max() -> usize {
        100
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct ErrorBody {
        pub error: String,
    }

    #[must_use]
    pub fn encode_payload(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    /// # Errors
    ///
    /// Returns the decode error when `text` is not valid base64.
    pub fn decode_payload(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(text)
    }
}

/// Transport that reaches the broker through the relay's HTTP API.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    poll: wire::PollQuery,
    closed: AtomicBool,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            poll: wire::PollQuery::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Override how long each long-poll waits on the relay.
    #[must_use]
    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll.wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        authorize(request, self.token.as_deref())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

fn authorize(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

async fn status_reason(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<wire::ErrorBody>().await {
        Ok(body) => format!("{status}: {}", body.error),
        Err(_) => status.to_string(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let publish_err = |reason: String| TransportError::Publish {
            destination: destination.to_string(),
            reason,
        };
        let body = wire::PublishRequest {
            channel: destination.to_string(),
            payload: wire::encode_payload(payload),
        };
        let response = self
            .authorized(self.client.post(self.url("/v1/publish")))
            .json(&body)
            .send()
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(publish_err(status_reason(response).await));
        }
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let subscribe_err = |reason: String| TransportError::Subscribe {
            destination: destination.to_string(),
            reason,
        };
        let response = self
            .authorized(self.client.post(self.url("/v1/subscriptions")))
            .json(&wire::SubscribeRequest {
                channel: destination.to_string(),
            })
            .send()
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(subscribe_err(status_reason(response).await));
        }
        let wire::SubscribeResponse { subscription_id } = response
            .json()
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pump = Pump {
            client: self.client.clone(),
            messages_url: self.url(&format!("/v1/subscriptions/{subscription_id}/messages")),
            token: self.token.clone(),
            poll: self.poll,
            destination: destination.to_string(),
        };
        let pump = tokio::spawn(pump.run(tx));

        let client = self.client.clone();
        let delete_url = self.url(&format!("/v1/subscriptions/{subscription_id}"));
        let token = self.token.clone();
        Ok(Subscription::new(destination, rx)
            .with_pump(pump)
            .on_close(move || {
                // Runs from Drop, which may happen outside a runtime.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let request = authorize(client.delete(&delete_url), token.as_deref());
                        if let Err(e) = request.send().await {
                            tracing::debug!(error = %e, "relay unsubscribe failed");
                        }
                    });
                }
            }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Pump {
    client: reqwest::Client,
    messages_url: String,
    token: Option<String>,
    poll: wire::PollQuery,
    destination: String,
}

impl Pump {
    /// Long-poll until the relay drops the subscription, a request fails or
    /// the local receiver goes away.
    async fn run(self, tx: mpsc::Sender<Vec<u8>>) {
        // Leave headroom over the relay-side wait before giving up on a poll.
        let request_timeout = Duration::from_millis(self.poll.wait_ms) + Duration::from_secs(10);
        loop {
            let request = authorize(self.client.get(&self.messages_url), self.token.as_deref())
                .query(&self.poll)
                .timeout(request_timeout);
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(destination = %self.destination, error = %e, "relay poll failed");
                    return;
                }
            };
            match response.status() {
                StatusCode::NOT_FOUND | StatusCode::GONE => {
                    tracing::debug!(destination = %self.destination, "relay subscription closed");
                    return;
                }
                status if !status.is_success() => {
                    tracing::warn!(destination = %self.destination, %status, "relay poll rejected");
                    return;
                }
                _ => {}
            }
            let batch: wire::PollResponse = match response.json().await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(destination = %self.destination, error = %e, "bad relay poll body");
                    return;
                }
            };
            for encoded in batch.messages {
                let Ok(bytes) = wire::decode_payload(&encoded) else {
                    tracing::warn!(destination = %self.destination, "dropping non-base64 relay message");
                    continue;
                };
                if tx.send(bytes).await.is_err() {
                    return;
                }
            }
        }
    }
}
