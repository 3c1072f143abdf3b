/// Peer metadata directory — a derived read cache over the router.
///
/// Maintained entirely through two built-in subscriptions on the
/// well-known `peer-announce` / `peer-gone` topics; nothing in the core
/// special-cases it. Also supplies the destination list for
/// `broadcast`.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::PeerId;

/// Topic a peer publishes on when it joins or refreshes its metadata.
pub const PEER_ANNOUNCE_TOPIC: &str = "peer-announce";

/// Topic a peer (or the relay on its behalf) publishes on when leaving.
pub const PEER_GONE_TOPIC: &str = "peer-gone";

/// Last-announced metadata for one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMeta {
    pub id: PeerId,
    /// Announced metadata, verbatim. Opaque to the transport.
    pub meta: Value,
    /// Unix ms timestamp of the latest announce.
    pub last_seen: u64,
}

/// id → metadata map, fed by router dispatch.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<PeerId, PeerMeta>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announce: upsert, latest metadata wins.
    pub fn apply_announce(&mut self, from: &str, meta: Value, now_ms: u64) {
        self.peers.insert(
            from.to_string(),
            PeerMeta {
                id: from.to_string(),
                meta,
                last_seen: now_ms,
            },
        );
    }

    /// Record a departure.
    pub fn apply_gone(&mut self, from: &str) {
        self.peers.remove(from);
    }

    pub fn get(&self, id: &str) -> Option<&PeerMeta> {
        self.peers.get(id)
    }

    /// All known peers.
    pub fn peers(&self) -> Vec<PeerMeta> {
        self.peers.values().cloned().collect()
    }

    /// Ids of all known peers — the `broadcast` fan-out list.
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
