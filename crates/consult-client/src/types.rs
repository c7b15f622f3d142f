//! Request and response types for the consultation client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use consult_core::{ConsultationStatus, MessageKind, Party, PlanTier, Rates, TransactionKind};

// ============================================================================
// Wallet
// ============================================================================

/// Wallet balance and tier.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    /// Spendable credits.
    pub balance: i64,
    /// Credits ever granted.
    pub lifetime_earned: i64,
    /// Credits ever spent.
    pub lifetime_used: i64,
    /// Tier used to price the wallet's activity.
    pub tier: PlanTier,
}

/// One wallet transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    /// Transaction ID.
    pub id: String,
    /// Signed amount; negative for charges.
    pub amount: i64,
    /// Part of a charge the wallet could not cover.
    #[serde(default)]
    pub shortfall: i64,
    /// Transaction kind.
    pub kind: TransactionKind,
    /// Balance after the transaction.
    pub balance_after: i64,
    /// Human-readable description.
    pub description: String,
    /// Related consultation, if any.
    #[serde(default)]
    pub consultation_id: Option<String>,
    /// Usage details.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Created timestamp.
    pub created_at: DateTime<Utc>,
}

/// A page of transactions.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionsResponse {
    /// Transactions, newest first.
    pub transactions: Vec<Transaction>,
    /// Whether another page exists.
    pub has_more: bool,
}

// ============================================================================
// Consultations
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct OpenConsultationRequest<'a> {
    pub expert_id: &'a str,
    pub concern: &'a str,
}

/// A consultation as seen by the caller.
#[derive(Debug, Clone, Deserialize)]
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
    pub created_at: DateTime<Utc>,
    /// When the first message was sent.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the consultation was completed.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// The caller's side.
    #[serde(default)]
    pub role: Option<Party>,
    /// Messages the caller has not read (list responses only).
    #[serde(default)]
    pub unread: Option<usize>,
}

/// The caller's consultations.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsultationsResponse {
    /// Consultations, newest first.
    pub consultations: Vec<ConsultationResponse>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SendMessageRequest<'a> {
    pub content: &'a str,
}

/// One consultation message.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageResponse {
    /// Message ID.
    pub id: String,
    /// Position in the consultation, starting at 1.
    pub seq: u64,
    /// Author.
    pub sender: String,
    /// Body.
    pub content: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Created timestamp.
    pub created_at: DateTime<Utc>,
}

/// Messages in send order.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    /// Messages.
    pub messages: Vec<MessageResponse>,
}

/// Unread counter for one consultation.
#[derive(Debug, Clone, Deserialize)]
pub struct UnreadResponse {
    /// Consultation ID.
    pub consultation_id: String,
    /// Messages the caller has not read.
    pub unread: usize,
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct StartCallRequest<'a> {
    pub expert_id: &'a str,
}

/// Realtime session credentials from the voice provider.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceSession {
    /// Short-lived token for the realtime connection.
    pub token: String,
    /// Provider-side conversation id, when assigned up front.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// An admitted call.
#[derive(Debug, Clone, Deserialize)]
pub struct CallTicket {
    /// Call ID.
    pub call_id: String,
    /// Rates the call is priced at.
    pub rates: Rates,
    /// Balance at admission.
    pub balance: i64,
    /// Voice session, when a provider is configured.
    #[serde(default)]
    pub voice: Option<VoiceSession>,
    /// Seconds the call may stay unconnected before it is dropped.
    pub connect_window_seconds: u64,
    /// Connected seconds after which the call is ended.
    #[serde(default)]
    pub max_duration_seconds: Option<u64>,
}

/// Acknowledgement that a call is accruing.
#[derive(Debug, Clone, Deserialize)]
pub struct CallConnectedResponse {
    /// Call ID.
    pub call_id: String,
    /// Whether the call is accruing.
    pub connected: bool,
}

/// Optional material for the relationship memory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndCallRequest {
    /// Transcript captured by the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    /// Provider conversation id to fetch the transcript with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Billing outcome of a finished call.
#[derive(Debug, Clone, Deserialize)]
pub struct EndCallResponse {
    /// Call ID.
    pub call_id: String,
    /// Called expert.
    pub expert_id: String,
    /// Whether the call ever connected.
    pub connected: bool,
    /// Connected seconds.
    pub elapsed_seconds: u64,
    /// Minutes billed in total.
    pub billed_minutes: u64,
    /// Credits charged in total.
    pub credits_charged: i64,
    /// Provider conversation id.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// What ended the call: `caller`, `provider`, `funds_exhausted` or
    /// `max_duration`.
    #[serde(default)]
    pub ended_by: Option<String>,
    /// Balance after final settlement.
    pub balance: i64,
    /// Whether the call was recorded in the relationship memory.
    pub memory_updated: bool,
}

// ============================================================================
// Errors
// ============================================================================

/// API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Error details.
    pub error: ApiErrorBody,
}

/// API error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Additional details.
    pub details: Option<serde_json::Value>,
}
