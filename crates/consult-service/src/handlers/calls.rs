//! Metered voice call handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use consult_core::{CallId, ExpertId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::meter::{CallNotes, CallSummary, CallTicket};
use crate::state::AppState;

fn parse_call_id(raw: &str) -> Result<CallId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid call id: {raw}")))
}

/// Start call request.
#[derive(Debug, Deserialize)]
pub struct StartCallRequest {
    /// Expert to call.
    pub expert_id: String,
}

/// Admit the caller and hand out voice session credentials.
pub async fn start_call(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<StartCallRequest>,
) -> Result<Json<CallTicket>, ApiError> {
    let expert_id: ExpertId = body
        .expert_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid expert_id: {}", body.expert_id)))?;
    let expert = state
        .store
        .get_expert(&expert_id)
        .await?
        .ok_or_else(|| ApiError::ExpertUnresolved(expert_id.to_string()))?;

    Ok(Json(state.calls.start(&auth.user_id, &expert).await?))
}

/// Call state response.
#[derive(Debug, Serialize)]
pub struct CallConnectedResponse {
    /// Call ID.
    pub call_id: String,
    /// Whether the call is accruing.
    pub connected: bool,
}

/// Report that the voice provider connected the call.
pub async fn call_connected(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<CallConnectedResponse>, ApiError> {
    let call_id = parse_call_id(&id)?;
    state.calls.connected(&call_id, &auth.user_id).await?;
    Ok(Json(CallConnectedResponse {
        call_id: call_id.to_string(),
        connected: true,
    }))
}

/// End call request. Both fields are optional.
#[derive(Debug, Default, Deserialize)]
pub struct EndCallRequest {
    /// Transcript captured by the client.
    #[serde(default)]
    pub transcript: Option<String>,
    /// Provider conversation id to fetch the transcript with.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl From<EndCallRequest> for CallNotes {
    fn from(body: EndCallRequest) -> Self {
        Self {
            transcript: body.transcript,
            conversation_id: body.conversation_id,
        }
    }
}

/// End call response.
#[derive(Debug, Serialize)]
pub struct EndCallResponse {
    /// Billing and memory outcome.
    #[serde(flatten)]
    pub summary: CallSummary,
    /// Balance after final settlement.
    pub balance: i64,
}

/// End a call and settle the last partial minute.
///
/// The call is counted in the relationship memory before the response; key
/// points are extracted afterwards.
pub async fn end_call(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    body: Option<Json<EndCallRequest>>,
) -> Result<Json<EndCallResponse>, ApiError> {
    let call_id = parse_call_id(&id)?;
    let notes: CallNotes = body.map(|Json(b)| b).unwrap_or_default().into();

    let summary = state.calls.end(&call_id, &auth.user_id, notes).await?;
    let balance = state.ledger.balance(&auth.user_id).await?;
    Ok(Json(EndCallResponse { summary, balance }))
}
