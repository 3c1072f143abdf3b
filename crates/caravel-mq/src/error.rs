/// Errors for the Caravel MQ transport.
///
/// Most failures are retryable by design (see the retry module); this
/// type surfaces only what callers can observe through the public API.
#[derive(Debug, thiserror::Error)]
pub enum MqError {
    #[error("relay request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("relay rejected request: http status {status}")]
    RelayStatus { status: u16 },

    #[error("invalid relay url: {reason}")]
    Config { reason: String },

    #[error("client is shut down")]
    Shutdown,
}
