//! Consultation handlers: lifecycle, messages, read markers and the live feed.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use consult_core::{
    Consultation, ConsultationId, ConsultationStatus, ExpertId, Message, MessageKind, Party,
};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Longest accepted message body, in characters.
const MAX_MESSAGE_CHARS: usize = 4000;

fn parse_id(raw: &str) -> Result<ConsultationId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid consultation id: {raw}")))
}

// ============================================================================
// Response types
// ============================================================================

/// Consultation response.
#[derive(Debug, Serialize)]
pub struct ConsultationResponse {
    /// Consultation ID.
    pub id: String,
    /// The seeker.
    pub seeker: String,
    /// The expert profile.
    pub expert_id: String,
    /// The expert's account.
    pub expert_user: String,
    /// Current status.
    pub status: ConsultationStatus,
    /// What the seeker wants to discuss.
    pub concern: String,
    /// Created timestamp.
    pub created_at: String,
    /// When the first message was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// When the consultation was completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    /// The caller's side of the consultation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Party>,
    /// Messages the caller has not read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread: Option<usize>,
}

impl From<&Consultation> for ConsultationResponse {
    fn from(c: &Consultation) -> Self {
        Self {
            id: c.id.to_string(),
            seeker: c.seeker.to_string(),
            expert_id: c.expert.to_string(),
            expert_user: c.expert_user.to_string(),
            status: c.status,
            concern: c.concern.clone(),
            created_at: c.created_at.to_rfc3339(),
            started_at: c.started_at.map(|t| t.to_rfc3339()),
            ended_at: c.ended_at.map(|t| t.to_rfc3339()),
            role: None,
            unread: None,
        }
    }
}

impl ConsultationResponse {
    fn with_role(mut self, role: Party) -> Self {
        self.role = Some(role);
        self
    }

    fn with_unread(mut self, unread: usize) -> Self {
        self.unread = Some(unread);
        self
    }
}

/// Message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Message ID.
    pub id: String,
    /// Position in the consultation.
    pub seq: u64,
    /// Author.
    pub sender: String,
    /// Body.
    pub content: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Created timestamp.
    pub created_at: String,
}

impl From<&Message> for MessageResponse {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id.to_string(),
            seq: m.seq,
            sender: m.sender.to_string(),
            content: m.content.clone(),
            kind: m.kind,
            created_at: m.created_at.to_rfc3339(),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Open consultation request.
#[derive(Debug, Deserialize)]
pub struct OpenConsultationRequest {
    /// Human expert to consult.
    pub expert_id: String,
    /// What the seeker wants to discuss.
    #[serde(default)]
    pub concern: String,
}

/// Open a consultation with a human expert, or return the pair's open one.
pub async fn open_consultation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<OpenConsultationRequest>,
) -> Result<Json<ConsultationResponse>, ApiError> {
    let expert_id: ExpertId = body
        .expert_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid expert_id: {}", body.expert_id)))?;

    let consultation = state
        .lifecycle
        .open(&auth.user_id, &expert_id, &body.concern)
        .await?;

    Ok(Json(
        ConsultationResponse::from(&consultation).with_role(Party::Seeker),
    ))
}

/// Consultations list response.
#[derive(Debug, Serialize)]
pub struct ConsultationsResponse {
    /// Consultations, newest first.
    pub consultations: Vec<ConsultationResponse>,
}

/// List the caller's consultations with unread counts.
pub async fn list_consultations(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<ConsultationsResponse>, ApiError> {
    let consultations = state
        .bus
        .unread_counts(&auth.user_id)
        .await?
        .iter()
        .map(|(c, unread)| {
            let response = ConsultationResponse::from(c).with_unread(*unread);
            match c.party_of(&auth.user_id) {
                Some(role) => response.with_role(role),
                None => response,
            }
        })
        .collect();

    Ok(Json(ConsultationsResponse { consultations }))
}

/// Fetch one consultation.
pub async fn get_consultation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ConsultationResponse>, ApiError> {
    let id = parse_id(&id)?;
    let (consultation, role) = state.lifecycle.get(&id, &auth.user_id).await?;
    Ok(Json(ConsultationResponse::from(&consultation).with_role(role)))
}

/// Complete a consultation. Either participant may end it.
pub async fn end_consultation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ConsultationResponse>, ApiError> {
    let id = parse_id(&id)?;
    let consultation = state.bus.complete(&id, &auth.user_id).await?;

    let role = consultation.require_party(&auth.user_id)?;
    Ok(Json(ConsultationResponse::from(&consultation).with_role(role)))
}

// ============================================================================
// Messages
// ============================================================================

/// Message pull query.
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    /// Only messages with a greater sequence number.
    pub after_seq: Option<u64>,
}

/// Messages list response.
#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    /// Messages in send order.
    pub messages: Vec<MessageResponse>,
}

/// Pull messages in send order.
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let id = parse_id(&id)?;
    state.lifecycle.get(&id, &auth.user_id).await?;

    let messages = state
        .bus
        .messages(&id, query.after_seq)
        .await?
        .iter()
        .map(MessageResponse::from)
        .collect();

    Ok(Json(MessagesResponse { messages }))
}

/// Send message request.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Message body.
    pub content: String,
}

/// Send a message to the other participant.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_id(&id)?;
    let content = body.content.trim();
    if content.is_empty() {
        return Err(ApiError::BadRequest("Message content is empty".into()));
    }
    if content.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::BadRequest(format!(
            "Message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }

    let message = state
        .bus
        .send(&id, &auth.user_id, content, MessageKind::Text)
        .await?;
    Ok(Json(MessageResponse::from(&message)))
}

/// Unread count response.
#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    /// Consultation ID.
    pub consultation_id: String,
    /// Messages the caller has not read.
    pub unread: usize,
}

/// Mark everything read for the caller.
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<UnreadResponse>, ApiError> {
    let id = parse_id(&id)?;
    state.bus.mark_read(&id, &auth.user_id).await?;
    Ok(Json(UnreadResponse {
        consultation_id: id.to_string(),
        unread: 0,
    }))
}

/// Count the caller's unread messages.
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<UnreadResponse>, ApiError> {
    let id = parse_id(&id)?;
    let unread = state.bus.unread_count(&id, &auth.user_id).await?;
    Ok(Json(UnreadResponse {
        consultation_id: id.to_string(),
        unread,
    }))
}

// ============================================================================
// Live feed
// ============================================================================

/// Stream query.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Replay stored messages after this sequence number before going live.
    pub after_seq: Option<u64>,
}

/// Upgrade to a WebSocket that pushes new messages as JSON text frames.
pub async fn stream_messages(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    // Subscribe before the backfill so nothing falls between the two.
    let rx = state.bus.subscribe(&id, &auth.user_id).await?;

    tracing::debug!(consultation_id = %id, user_id = %auth.user_id, "Live feed opened");
    Ok(ws.on_upgrade(move |socket| feed(socket, state, id, rx, query.after_seq)))
}

async fn feed(
    mut socket: WebSocket,
    state: Arc<AppState>,
    id: ConsultationId,
    mut rx: broadcast::Receiver<Message>,
    after_seq: Option<u64>,
) {
    let mut last_seq = after_seq.unwrap_or(0);

    if !catch_up(&mut socket, &state, &id, &mut last_seq).await {
        return;
    }

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) => {
                    if message.seq <= last_seq {
                        continue;
                    }
                    last_seq = message.seq;
                    if !push(&mut socket, &message).await {
                        return;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(consultation_id = %id, skipped = skipped, "Live feed lagged, resyncing");
                    if !catch_up(&mut socket, &state, &id, &mut last_seq).await {
                        return;
                    }
                }
                Err(RecvError::Closed) => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    return;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Push stored messages after `last_seq`. Returns `false` once the socket is gone.
async fn catch_up(
    socket: &mut WebSocket,
    state: &AppState,
    id: &ConsultationId,
    last_seq: &mut u64,
) -> bool {
    let backlog = match state.bus.messages(id, Some(*last_seq)).await {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(consultation_id = %id, error = %e, "Live feed backfill failed");
            return true;
        }
    };
    for message in &backlog {
        if !push(socket, message).await {
            return false;
        }
        *last_seq = message.seq;
    }
    true
}

async fn push(socket: &mut WebSocket, message: &Message) -> bool {
    match serde_json::to_string(&MessageResponse::from(message)) {
        Ok(text) => socket.send(WsMessage::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode message");
            true
        }
    }
}
