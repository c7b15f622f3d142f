//! Relationship memory handler.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use consult_core::{ConversationMemory, ExpertId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// What the expert remembers about the caller.
pub async fn get_memory(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(expert_id): Path<String>,
) -> Result<Json<ConversationMemory>, ApiError> {
    let expert_id: ExpertId = expert_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid expert_id: {expert_id}")))?;

    let memory = state
        .distiller
        .get(&auth.user_id, &expert_id)
        .await?
        .unwrap_or_else(|| ConversationMemory::new(auth.user_id, expert_id));
    Ok(Json(memory))
}
