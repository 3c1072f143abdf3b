use std::path::PathBuf;
use std::time::Duration;

use crate::types::{MAX_ATTEMPTS, RECONNECT_DELAY, RETRY_INTERVAL};

/// Configuration for an [`MqClient`](crate::MqClient).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use caravel_mq::MqConfig;
///
/// let config = MqConfig::new()
///     .relay_url("http://relay.local:8787")
///     .max_attempts(5);
/// ```
#[derive(Debug, Clone)]
pub struct MqConfig {
    /// Base URL of the relay endpoint (`/send`, `/ack`, `/events`).
    pub(crate) relay_url: String,
    /// Path for the on-disk store. `None` keeps bookkeeping memory-only.
    pub(crate) store_path: Option<PathBuf>,
    /// Interval between retry sweeps over the outbox.
    pub(crate) retry_interval: Duration,
    /// Delivery attempts before an entry is marked failed.
    pub(crate) max_attempts: u32,
    /// Delay before reconnecting a dropped event stream.
    pub(crate) reconnect_delay: Duration,
    /// Buffer size for the command and event channels.
    pub(crate) channel_buffer: usize,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MqConfig {
    /// Create a new config with defaults.
    ///
    /// If the `CARAVEL_RELAY_URL` environment variable is set, it is used
    /// as the relay endpoint. This can be overridden with [`.relay_url()`].
    pub fn new() -> Self {
        let relay_url = std::env::var("CARAVEL_RELAY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());

        Self {
            relay_url,
            store_path: Some(PathBuf::from("caravel-mq.db")),
            retry_interval: RETRY_INTERVAL,
            max_attempts: MAX_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            channel_buffer: 1024,
        }
    }

    /// Set the relay base URL.
    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    /// Set the on-disk store path.
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Keep all bookkeeping in memory, with no on-disk mirror.
    pub fn memory_only(mut self) -> Self {
        self.store_path = None;
        self
    }

    /// Set the retry sweep interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the maximum delivery attempts per message.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the event stream reconnect delay.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the command/event channel buffer size.
    pub fn channel_buffer(mut self, size: usize) -> Self {
        self.channel_buffer = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behavior() {
        let config = MqConfig::new();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert!(config.store_path.is_some());
    }

    #[test]
    fn builder_overrides() {
        let config = MqConfig::new()
            .relay_url("http://example.org:9000")
            .memory_only()
            .max_attempts(3)
            .retry_interval(Duration::from_millis(50));
        assert_eq!(config.relay_url, "http://example.org:9000");
        assert!(config.store_path.is_none());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_interval, Duration::from_millis(50));
    }
}
