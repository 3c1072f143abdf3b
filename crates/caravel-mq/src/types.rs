use serde::{Deserialize, Serialize};

/// Identity of a peer, as assigned by the relay. Opaque to this crate.
pub type PeerId = String;

/// Unique message token (UUID v4 in practice).
pub type MessageId = String;

/// Maximum delivery attempts before an outbox entry is marked failed.
pub const MAX_ATTEMPTS: u32 = 10;

/// Default interval between retry sweeps.
pub const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Default delay before reconnecting a dropped event stream.
pub const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(3);

/// Lifecycle status of an outbox entry.
///
/// `Pending` -> `InFlight` on each attempt, back to `Pending` when the
/// attempt fails, `Failed` once attempts are exhausted. Removal (on a
/// delivery confirmation) is the only successful exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendStatus {
    Pending,
    InFlight,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Pending => "pending",
            SendStatus::InFlight => "in-flight",
            SendStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SendStatus::Pending),
            "in-flight" => Some(SendStatus::InFlight),
            "failed" => Some(SendStatus::Failed),
            _ => None,
        }
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
