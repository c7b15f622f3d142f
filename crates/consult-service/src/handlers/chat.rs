//! Metered AI chat over server-sent events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use consult_core::ExpertId;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::provider::ChatTurn;
use crate::state::AppState;

/// Chat request.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// AI expert to talk to.
    pub expert_id: String,
    /// Conversation so far, ending with the seeker's turn.
    pub messages: Vec<ChatTurn>,
}

/// Stream a metered reply.
///
/// Emits one `message` event per delta (`{"content": ...}` or the final
/// `{"usage": ...}`), an `error` event if the provider fails mid-stream, and a
/// closing `done` event. The exchange is charged when the provider stream ends or
/// the client disconnects, whichever comes first.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if body.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".into()));
    }
    let expert_id: ExpertId = body
        .expert_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid expert_id: {}", body.expert_id)))?;
    let expert = state
        .store
        .get_expert(&expert_id)
        .await?
        .ok_or_else(|| ApiError::ExpertUnresolved(expert_id.to_string()))?;

    let replies = state
        .chat
        .start(&auth.user_id, &expert, body.messages)
        .await?;

    let events = replies
        .map(|item| {
            let event = match item {
                Ok(delta) => Event::default().json_data(&delta).unwrap_or_else(|e| {
                    tracing::error!(error = %e, "Failed to encode chat delta");
                    Event::default().event("error").data("encoding failed")
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Chat stream failed");
                    Event::default().event("error").data(e.to_string())
                }
            };
            Ok(event)
        })
        .chain(stream::once(async {
            Ok(Event::default().event("done").data("[DONE]"))
        }));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
