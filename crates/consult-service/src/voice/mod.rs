//! Voice provider integration.
//!
//! The voice provider hosts the realtime call. The service only exchanges a
//! short-lived session token before the call and fetches the transcript after it.

mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use consult_core::BillingError;

pub use client::VoiceClient;

/// Errors from the voice provider.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response.
    #[error("voice API error ({status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Client construction failed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<VoiceError> for BillingError {
    fn from(err: VoiceError) -> Self {
        Self::ExternalUnavailable {
            service: "voice".to_string(),
            message: err.to_string(),
        }
    }
}

/// Credentials a client uses to join a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSession {
    /// Short-lived token for the realtime connection.
    pub token: String,
    /// Provider-side conversation id, when assigned up front.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// A voice call backend.
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    /// Exchange the API key for a session token for `agent_id`.
    ///
    /// # Errors
    ///
    /// Fails when the provider is unreachable or refuses the exchange.
    async fn session_token(&self, agent_id: &str) -> Result<VoiceSession, VoiceError>;

    /// Fetch the transcript of a finished conversation as `speaker: text` lines.
    ///
    /// # Errors
    ///
    /// Fails when the provider is unreachable or the conversation is unknown.
    async fn transcript(&self, conversation_id: &str) -> Result<String, VoiceError>;
}
