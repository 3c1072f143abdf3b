/// Transport channel to the relay endpoint.
///
/// [`RelayTransport`] is the I/O seam: production uses [`HttpRelay`]
/// (reqwest over `POST /send` and `POST /ack`), tests substitute a mock
/// that records calls. The inbound side is a long-lived `GET /events`
/// push stream consumed by [`event_stream_task`], which reconnects on
/// its own after a fixed delay — callers never manage the connection.
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use url::Url;

use crate::error::MqError;
use crate::wire::{AckRequest, RelayEvent, SendRequest, SseBuffer};

/// One-shot delivery and acknowledgement calls against the relay.
#[async_trait::async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// Issue a single delivery attempt. Any failure (transport error or
    /// non-2xx) is retryable, never fatal.
    async fn send_once(&self, request: &SendRequest) -> Result<(), MqError>;

    /// Confirm receipt of a message. Best-effort: the caller logs
    /// failures and moves on — a lost ack just means the sender
    /// redelivers into our dedup guard.
    async fn acknowledge(&self, ack: &AckRequest) -> Result<(), MqError>;
}

/// HTTP implementation of [`RelayTransport`].
#[derive(Debug, Clone)]
pub struct HttpRelay {
    http: reqwest::Client,
    send_url: Url,
    ack_url: Url,
    events_url: Url,
}

impl HttpRelay {
    pub fn new(base: &str) -> Result<Self, MqError> {
        let base = Url::parse(base).map_err(|e| MqError::Config {
            reason: e.to_string(),
        })?;
        let join = |path: &str| {
            base.join(path).map_err(|e| MqError::Config {
                reason: e.to_string(),
            })
        };
        Ok(Self {
            http: reqwest::Client::new(),
            send_url: join("send")?,
            ack_url: join("ack")?,
            events_url: join("events")?,
        })
    }

    pub(crate) fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    pub(crate) fn events_url(&self) -> Url {
        self.events_url.clone()
    }

    async fn post<T: serde::Serialize>(&self, url: &Url, body: &T) -> Result<(), MqError> {
        let response = self.http.post(url.clone()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MqError::RelayStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RelayTransport for HttpRelay {
    async fn send_once(&self, request: &SendRequest) -> Result<(), MqError> {
        self.post(&self.send_url, request).await
    }

    async fn acknowledge(&self, ack: &AckRequest) -> Result<(), MqError> {
        self.post(&self.ack_url, ack).await
    }
}

/// Consume the relay's push stream, forwarding events into the runtime.
///
/// Runs until the receiving side is dropped. Every disconnect — failed
/// request, mid-stream error, clean end — leads to a fixed-delay
/// reconnect; subscriptions live in the router and are unaffected.
pub(crate) async fn event_stream_task(
    http: reqwest::Client,
    events_url: Url,
    tx: mpsc::Sender<RelayEvent>,
    reconnect_delay: Duration,
) {
    loop {
        match http.get(events_url.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("event stream connected");
                let mut chunks = response.bytes_stream();
                let mut buffer = SseBuffer::new();
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for event in buffer.push(&bytes) {
                                if tx.send(event).await.is_err() {
                                    return; // runtime is gone
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!("event stream read error: {e}");
                            break;
                        }
                    }
                }
                tracing::warn!(
                    "event stream disconnected, reconnecting in {:?}",
                    reconnect_delay
                );
            }
            Ok(response) => {
                tracing::warn!(
                    "event stream rejected with status {}, reconnecting in {:?}",
                    response.status(),
                    reconnect_delay
                );
            }
            Err(e) => {
                tracing::warn!("event stream connect failed: {e}, reconnecting in {:?}", reconnect_delay);
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}
