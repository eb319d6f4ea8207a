//! Client error taxonomy shared by every component.
//!
//! Errors are `Clone` so a terminal [`crate::documents::UploadTask`] can carry
//! its failure. Only [`ClientError::Network`] is considered transient.

/// Error returned by session, gateway, realtime, and document operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Login rejected with 401/403.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// A request came back 401; the session has been cleared. Never retried.
    #[error("session is no longer authorized")]
    Unauthorized,

    /// Transport failure (connect, timeout, reset). Callers may retry.
    #[error("network error: {0}")]
    Network(String),

    /// Server-reported failure other than 401/413.
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },

    /// Upload rejected for size, locally (limit known) or by the server (413).
    #[error("payload of {size} bytes is too large{}", limit_suffix(.limit))]
    PayloadTooLarge { size: u64, limit: Option<u64> },

    /// A realtime channel is already running for this session.
    #[error("realtime channel already connected")]
    AlreadyConnected,

    /// The same logical operation is already in flight.
    #[error("operation already in progress")]
    AlreadyInProgress,

    /// A login was overtaken by a logout (or a 401) before it could finish.
    #[error("cancelled by a session change")]
    Cancelled,

    /// Client-side permission guard (e.g. deleting another user's document).
    #[error("not permitted: {0}")]
    Forbidden(String),

    /// Chat submitted while the realtime channel is not open.
    #[error("realtime channel is not open")]
    NotConnected,

    /// Response body did not match the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),
}

fn limit_suffix(limit: &Option<u64>) -> String {
    limit
        .map(|l| format!(" (limit {} bytes)", l))
        .unwrap_or_default()
}

impl ClientError {
    /// True for errors a caller may retry (network only; never `Unauthorized` or `Api`).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }

    /// True when the error means the session is gone and the user must log in again.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, ClientError::Unauthorized)
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e.to_string())
    }
}
