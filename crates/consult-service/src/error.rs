//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use consult_core::BillingError;
use consult_store::StoreError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but not a participant.
    #[error("forbidden")]
    Forbidden,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - invalid state transition or expired session.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The expert exists but cannot take this kind of consultation.
    #[error("expert unresolved: {0}")]
    ExpertUnresolved(String),

    /// The payer cannot afford to start a metered activity.
    #[error("admission denied: balance={balance}, required={required}")]
    AdmissionDenied {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// Duplicate event (idempotency).
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// A provider is unavailable; the request may be retried.
    #[error("external service unavailable: {0}")]
    ExternalService(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::ExpertUnresolved(id) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "expert_unresolved",
                format!("Expert {id} cannot be consulted"),
                None,
            ),
            Self::AdmissionDenied { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "admission_denied",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "required": required
                })),
            ),
            Self::DuplicateEvent(id) => (
                StatusCode::CONFLICT,
                "duplicate_event",
                format!("Event {id} already processed"),
                None,
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "external_unavailable",
                msg.clone(),
                Some(serde_json::json!({ "retryable": true })),
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::AdmissionDenied { balance, required } => {
                Self::AdmissionDenied { balance, required }
            }
            BillingError::TransitionRejected { .. } | BillingError::ConnectWindowElapsed { .. } => {
                Self::Conflict(err.to_string())
            }
            BillingError::ExternalUnavailable { service, message } => {
                Self::ExternalService(format!("{service}: {message}"))
            }
            BillingError::ExpertUnresolved { expert_id } => Self::ExpertUnresolved(expert_id),
            BillingError::NotParticipant { .. } => Self::Forbidden,
            BillingError::NotFound { entity, id } => {
                Self::NotFound(format!("{entity} not found: {id}"))
            }
            BillingError::DuplicateEvent { event_id } => Self::DuplicateEvent(event_id),
            BillingError::InvalidAmount(msg) => Self::BadRequest(msg),
            BillingError::InvalidId(e) => Self::BadRequest(e.to_string()),
            BillingError::BillingUnrecorded { .. }
            | BillingError::Storage(_)
            | BillingError::Configuration(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => {
                Self::NotFound(format!("{entity} not found: {id}"))
            }
            StoreError::DuplicateEvent { event_id } => Self::DuplicateEvent(event_id),
            StoreError::ConsultationClosed { id } => {
                Self::Conflict(format!("consultation closed: {id}"))
            }
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_core::ConsultationStatus;

    #[test]
    fn billing_errors_map_to_status_codes() {
        let cases = [
            (
                ApiError::from(BillingError::AdmissionDenied {
                    balance: 0,
                    required: 12,
                }),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                ApiError::from(BillingError::ExternalUnavailable {
                    service: "chat".into(),
                    message: "timeout".into(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(BillingError::TransitionRejected {
                    from: ConsultationStatus::Completed,
                    to: ConsultationStatus::Active,
                }),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(BillingError::NotParticipant {
                    user_id: "u".into(),
                }),
                StatusCode::FORBIDDEN,
            ),
            (
                ApiError::from(BillingError::NotFound {
                    entity: "consultation",
                    id: "c".into(),
                }),
                StatusCode::NOT_FOUND,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn store_duplicate_is_conflict() {
        let err = ApiError::from(StoreError::DuplicateEvent {
            event_id: "txn_1".into(),
        });
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
