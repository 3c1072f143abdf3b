/// MQ runtime — integrates store, router, retry, and transport into a
/// live event loop.
///
/// The runtime owns all mutable state (store, subscriptions, peer
/// directory) inside one task and exposes a channel-based API, so
/// callers never touch bookkeeping directly and nothing needs a lock
/// beyond the shared peer directory.
mod r#loop;

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::MqConfig;
use crate::error::MqError;
use crate::peers::{PeerDirectory, PeerMeta};
use crate::relay::{HttpRelay, RelayTransport};
use crate::router::{Delivery, Handler, HandlerError, SubscriptionId, TopicPattern};
use crate::store::OutboxEntry;
use crate::types::{MessageId, PeerId, SendStatus};
use crate::wire::RelayEvent;

use r#loop::{mq_loop, StreamControl};

/// Outcome of the *first* delivery attempt for one message.
///
/// `InFlight` means the relay accepted the hand-off — not that the
/// remote peer processed it. Final success is observed when a
/// `delivered` event removes the outbox entry; final failure through
/// [`MqHandle::on_delivery_failed`].
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub status: SendStatus,
}

/// Callback invoked once per outbox entry that exhausts its attempts.
pub type FailureCallback = Arc<dyn Fn(&OutboxEntry) + Send + Sync>;

// ── Commands (handle → loop) ──────────────────────────────────────────

pub(crate) enum MqCommand {
    Send {
        destination: PeerId,
        topic: String,
        payload: Value,
        reply: oneshot::Sender<SendReceipt>,
    },
    Subscribe {
        pattern: TopicPattern,
        handler: Handler,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Broadcast {
        topic: String,
        payload: Value,
        reply: oneshot::Sender<Vec<SendReceipt>>,
    },
    OnDeliveryFailed {
        callback: FailureCallback,
    },
    OutboxEntries {
        reply: oneshot::Sender<Vec<OutboxEntry>>,
    },
    FailedEntries {
        reply: oneshot::Sender<Vec<OutboxEntry>>,
    },
    ClearFailed {
        id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

// ── Internal loop events ──────────────────────────────────────────────

/// Feedback from spawned I/O tasks and ack handles into the loop.
pub(crate) enum LoopEvent {
    SendOutcome { message_id: MessageId, ok: bool },
    Acknowledged {
        from: PeerId,
        seq: u64,
        message_id: MessageId,
    },
}

// ── MqHandle (app-facing API) ─────────────────────────────────────────

/// Handle to a running MQ client.
///
/// Cheap to clone. All methods are channel sends into the runtime loop;
/// they fail only with [`MqError::Shutdown`] once the loop is gone.
#[derive(Clone)]
pub struct MqHandle {
    cmd_tx: mpsc::Sender<MqCommand>,
    peers: Arc<Mutex<PeerDirectory>>,
}

impl MqHandle {
    /// Queue a message for reliable delivery.
    ///
    /// Resolves on the first attempt's outcome; a failed first attempt
    /// still returns `Ok` (status `Pending`) and is retried in the
    /// background up to the configured attempt cap.
    pub async fn send(
        &self,
        destination: impl Into<PeerId>,
        topic: impl Into<String>,
        payload: Value,
    ) -> Result<SendReceipt, MqError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MqCommand::Send {
                destination: destination.into(),
                topic: topic.into(),
                payload,
                reply,
            })
            .await
            .map_err(|_| MqError::Shutdown)?;
        rx.await.map_err(|_| MqError::Shutdown)
    }

    /// Register a handler for a topic pattern (exact, or trailing-`*`
    /// prefix wildcard). Returns the token for [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: impl Fn(Delivery) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Result<SubscriptionId, MqError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MqCommand::Subscribe {
                pattern: TopicPattern::parse(pattern),
                handler: Arc::new(handler),
                reply,
            })
            .await
            .map_err(|_| MqError::Shutdown)?;
        rx.await.map_err(|_| MqError::Shutdown)
    }

    /// Remove a subscription from future dispatches.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), MqError> {
        self.cmd_tx
            .send(MqCommand::Unsubscribe { id })
            .await
            .map_err(|_| MqError::Shutdown)
    }

    /// Fan a message out to every peer in the directory.
    pub async fn broadcast(
        &self,
        topic: impl Into<String>,
        payload: Value,
    ) -> Result<Vec<SendReceipt>, MqError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MqCommand::Broadcast {
                topic: topic.into(),
                payload,
                reply,
            })
            .await
            .map_err(|_| MqError::Shutdown)?;
        rx.await.map_err(|_| MqError::Shutdown)
    }

    /// Register a callback for permanently failed deliveries. Invoked
    /// once per entry, at the moment it transitions to failed.
    pub async fn on_delivery_failed(
        &self,
        callback: impl Fn(&OutboxEntry) + Send + Sync + 'static,
    ) -> Result<(), MqError> {
        self.cmd_tx
            .send(MqCommand::OnDeliveryFailed {
                callback: Arc::new(callback),
            })
            .await
            .map_err(|_| MqError::Shutdown)
    }

    /// Snapshot of all live outbox entries.
    pub async fn outbox_entries(&self) -> Result<Vec<OutboxEntry>, MqError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MqCommand::OutboxEntries { reply })
            .await
            .map_err(|_| MqError::Shutdown)?;
        rx.await.map_err(|_| MqError::Shutdown)
    }

    /// Entries that exhausted their attempts, retained for inspection.
    pub async fn failed_entries(&self) -> Result<Vec<OutboxEntry>, MqError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MqCommand::FailedEntries { reply })
            .await
            .map_err(|_| MqError::Shutdown)?;
        rx.await.map_err(|_| MqError::Shutdown)
    }

    /// Drop a failed entry. Returns whether anything was removed.
    pub async fn clear_failed(&self, id: impl Into<MessageId>) -> Result<bool, MqError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MqCommand::ClearFailed {
                id: id.into(),
                reply,
            })
            .await
            .map_err(|_| MqError::Shutdown)?;
        rx.await.map_err(|_| MqError::Shutdown)
    }

    /// Current peer directory snapshot.
    pub fn peers(&self) -> Vec<PeerMeta> {
        self.peers
            .lock()
            .map(|dir| dir.peers())
            .unwrap_or_default()
    }

    /// Stop the runtime loop. In-flight attempts are abandoned.
    pub async fn shutdown(&self) -> Result<(), MqError> {
        self.cmd_tx
            .send(MqCommand::Shutdown)
            .await
            .map_err(|_| MqError::Shutdown)
    }
}

// ── MqClient (constructors) ───────────────────────────────────────────

/// The MQ client. Construct with [`spawn`](Self::spawn) (HTTP relay) or
/// [`spawn_with`](Self::spawn_with) (any transport + injected event
/// stream, for tests and embedders).
pub struct MqClient;

impl MqClient {
    /// Spawn a client against the configured HTTP relay.
    ///
    /// Must be called within a tokio runtime. The push stream is opened
    /// lazily on the first send or subscribe.
    pub fn spawn(config: MqConfig) -> Result<MqHandle, MqError> {
        let relay = HttpRelay::new(&config.relay_url)?;
        let (event_tx, event_rx) = mpsc::channel(config.channel_buffer);
        let stream = StreamControl::lazy(
            relay.http(),
            relay.events_url(),
            event_tx,
            config.reconnect_delay,
        );
        Ok(Self::spawn_inner(config, Arc::new(relay), event_rx, stream))
    }

    /// Spawn a client over an arbitrary transport and event source.
    /// The event stream is treated as already open.
    pub fn spawn_with<T: RelayTransport>(
        config: MqConfig,
        transport: T,
        events: mpsc::Receiver<RelayEvent>,
    ) -> MqHandle {
        Self::spawn_inner(config, Arc::new(transport), events, StreamControl::external())
    }

    fn spawn_inner<T: RelayTransport>(
        config: MqConfig,
        transport: Arc<T>,
        event_rx: mpsc::Receiver<RelayEvent>,
        stream: StreamControl,
    ) -> MqHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_buffer);
        let peers = Arc::new(Mutex::new(PeerDirectory::new()));

        tokio::spawn(mq_loop(
            transport,
            config,
            cmd_rx,
            event_rx,
            peers.clone(),
            stream,
        ));

        MqHandle { cmd_tx, peers }
    }
}
