//! Expert registration (operators only).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use consult_core::{Expert, ExpertId, ExpertKind, UserId};

use crate::auth::AdminAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Expert registration request.
#[derive(Debug, Deserialize)]
pub struct PutExpertRequest {
    /// Name shown to seekers.
    pub display_name: String,
    /// `ai` or `human`.
    pub kind: ExpertKind,
    /// Account a human expert signs in with.
    #[serde(default)]
    pub linked_user: Option<String>,
    /// System prompt for AI personas.
    #[serde(default)]
    pub persona: Option<String>,
    /// Voice provider agent.
    #[serde(default)]
    pub voice_agent_id: Option<String>,
}

/// Create or replace an expert profile.
pub async fn put_expert(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(id): Path<String>,
    Json(body): Json<PutExpertRequest>,
) -> Result<Json<Expert>, ApiError> {
    let id: ExpertId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid expert id: {id}")))?;
    let linked_user = body
        .linked_user
        .as_deref()
        .map(|raw| {
            raw.parse::<UserId>()
                .map_err(|_| ApiError::BadRequest(format!("Invalid linked_user: {raw}")))
        })
        .transpose()?;
    if body.display_name.trim().is_empty() {
        return Err(ApiError::BadRequest("display_name must not be empty".into()));
    }

    let created_at = state
        .store
        .get_expert(&id)
        .await?
        .map_or_else(Utc::now, |existing| existing.created_at);

    let expert = Expert {
        id,
        display_name: body.display_name.trim().to_string(),
        kind: body.kind,
        linked_user,
        persona: body.persona,
        voice_agent_id: body.voice_agent_id,
        created_at,
    };
    state.store.put_expert(&expert).await?;

    tracing::info!(
        expert_id = %id,
        kind = expert.kind.as_str(),
        actor = %admin.actor,
        "Expert saved"
    );
    Ok(Json(expert))
}
