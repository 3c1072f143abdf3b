//! Caravel MQ — reliable message-queue transport for the Caravel peer
//! client.
//!
//! Sits between application features (chat, calls, groups, listen
//! rooms) and a relay endpoint reachable over HTTP plus a server-push
//! event stream. Payloads are opaque; what this crate guarantees is
//! delivery bookkeeping:
//!
//! - a session-scoped durable outbox/inbox ([`store`]),
//! - idempotent receive via `(from, seq)` dedup,
//! - bounded retry with a periodic sweep ([`retry`]),
//! - topic-based pub/sub routing with prefix wildcards ([`router`]).
//!
//! An outbox entry is removed only on an explicit `delivered` event
//! from the relay — a 200 on `POST /send` means the relay accepted the
//! hand-off, not that the remote peer processed it.
//!
//! Entry point: [`MqClient::spawn`] returning an [`MqHandle`].

pub mod config;
pub mod error;
pub mod peers;
pub mod relay;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod store;
pub mod types;
pub mod wire;

pub use config::MqConfig;
pub use error::MqError;
pub use peers::{PeerDirectory, PeerMeta, PEER_ANNOUNCE_TOPIC, PEER_GONE_TOPIC};
pub use relay::{HttpRelay, RelayTransport};
pub use retry::{plan_sweep, SweepAction};
pub use router::{
    AckHandle, Delivery, Handler, HandlerError, SubscriptionId, TopicPattern, TopicRouter,
};
pub use runtime::{FailureCallback, MqClient, MqHandle, SendReceipt};
pub use store::{InboxRecord, OutboxEntry, Store};
pub use types::{now_ms, MessageId, PeerId, SendStatus, MAX_ATTEMPTS};
pub use wire::{AckRequest, RelayEvent, SendRequest, SendResponse, WireMessage};
