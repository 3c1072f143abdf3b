/// Wire types for the relay endpoint.
///
/// Everything on this surface is JSON: two request/response calls
/// (`POST /send`, `POST /ack`) and a server-push stream (`GET /events`)
/// framed as SSE `data:` blocks. Payloads are opaque — they pass through
/// as `serde_json::Value` and are never interpreted here.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MessageId, PeerId};

// ── Request/response calls ─────────────────────────────────────────────

/// Body of `POST /send` — one delivery attempt for one outbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub destination: PeerId,
    pub topic: String,
    pub payload: Value,
    pub message_id: MessageId,
}

/// Body of the `POST /send` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub status: String,
}

/// Body of `POST /ack` — best-effort receipt confirmation.
///
/// `from` names the original sender so the relay can route the
/// `delivered` event back to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub message_id: MessageId,
    pub from: PeerId,
}

// ── Push stream envelopes ──────────────────────────────────────────────

/// One envelope from the `GET /events` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    /// An inbound message for this peer.
    Message { from: PeerId, msg: WireMessage },
    /// The remote peer took receipt of one of our messages — the
    /// corresponding outbox entry can be deleted.
    Delivered { msg_id: MessageId },
}

/// Message body inside a `message` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: MessageId,
    /// Per-sender monotonically increasing sequence number.
    pub seq: u64,
    pub topic: String,
    pub payload: Value,
}

// ── SSE framing ────────────────────────────────────────────────────────

/// Incremental parser for the SSE-framed event stream.
///
/// Feed it raw chunks as they arrive; it yields complete [`RelayEvent`]s.
/// Blocks are separated by a blank line; only `data:` lines carry
/// payload. Malformed blocks are logged and skipped — one bad event
/// must not kill the stream.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buf: String,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain any complete events.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RelayEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let block: String = self.buf.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<RelayEvent> {
    let data: String = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.trim_start())
        .collect::<Vec<_>>()
        .join("\n");

    if data.is_empty() {
        return None; // comment or keep-alive block
    }

    match serde_json::from_str(&data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!("dropping malformed stream event: {e}");
            None
        }
    }
}
