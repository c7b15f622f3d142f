//! Error types for the consultation engine.

use crate::consultation::ConsultationStatus;
use crate::ids::IdError;

/// Result type for consultation engine operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in consultation and billing operations.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// The payer cannot afford the metered activity they are about to start.
    #[error("admission denied: balance={balance}, required={required}")]
    AdmissionDenied {
        /// Current balance in credits.
        balance: i64,
        /// Credits required to start.
        required: i64,
    },

    /// A ledger write failed after the service was already rendered.
    #[error("billing unrecorded for {user_id}: {amount} credits ({reason})")]
    BillingUnrecorded {
        /// The user that should have been charged.
        user_id: String,
        /// The amount that was not recorded.
        amount: i64,
        /// Underlying failure.
        reason: String,
    },

    /// An out-of-order or duplicate consultation state transition.
    #[error("transition rejected: {from} -> {to}")]
    TransitionRejected {
        /// Current status.
        from: ConsultationStatus,
        /// Requested status.
        to: ConsultationStatus,
    },

    /// A model, telephony or other provider is unavailable.
    #[error("external service unavailable: {service} - {message}")]
    ExternalUnavailable {
        /// The service that failed.
        service: String,
        /// Error message.
        message: String,
    },

    /// A call session was not connected within its connect window.
    #[error("connect window elapsed for call {call_id}")]
    ConnectWindowElapsed {
        /// The abandoned call.
        call_id: String,
    },

    /// The requested expert cannot be consulted (unknown, AI-only, or no linked account).
    #[error("expert unresolved: {expert_id}")]
    ExpertUnresolved {
        /// The expert that could not be resolved.
        expert_id: String,
    },

    /// The actor is not a participant of the consultation or session.
    #[error("not a participant: {user_id}")]
    NotParticipant {
        /// The offending user.
        user_id: String,
    },

    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Entity identifier.
        id: String,
    },

    /// Duplicate event (idempotency).
    #[error("duplicate event: {event_id}")]
    DuplicateEvent {
        /// The event ID that was duplicated.
        event_id: String,
    },

    /// Invalid amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BillingError {
    /// Whether the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalUnavailable { .. } | Self::Storage(_))
    }
}
