//! Client error types.

/// Errors that can occur when using the consultation client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
    },

    /// The wallet cannot cover the first unit of a metered activity.
    #[error("admission denied: balance={balance}, required={required}")]
    AdmissionDenied {
        /// Current balance.
        balance: i64,
        /// Credits needed to start.
        required: i64,
    },

    /// The caller is not allowed to act on the resource.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Server message.
        message: String,
    },

    /// The resource does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Server message.
        message: String,
    },

    /// The request conflicts with the resource's current state.
    #[error("conflict: {message}")]
    Conflict {
        /// Server message.
        message: String,
    },

    /// A provider behind the service is down; the request may be retried.
    #[error("service unavailable: {message}")]
    Unavailable {
        /// Server message.
        message: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
