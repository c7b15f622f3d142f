//! Credit balance, history, rates and manual grants.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use consult_core::{PlanTier, Rates, TransactionKind, UserId, WalletTransaction};

use super::PaginationQuery;
use crate::auth::{AdminAuth, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Balance
// ============================================================================

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Spendable credits.
    pub balance: i64,
    /// Lifetime credits added.
    pub lifetime_earned: i64,
    /// Lifetime credits used.
    pub lifetime_used: i64,
    /// Tier the caller is billed at.
    pub tier: PlanTier,
}

/// Get the caller's balance and tier.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state.ledger.account(&auth.user_id).await?;
    let rates = state.rates.rate_for(&auth.user_id).await?;

    Ok(Json(BalanceResponse {
        balance: account.balance,
        lifetime_earned: account.lifetime_earned,
        lifetime_used: account.lifetime_used,
        tier: rates.tier,
    }))
}

// ============================================================================
// Transactions
// ============================================================================

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Signed amount applied.
    pub amount: i64,
    /// Part of a debit the balance could not cover.
    pub shortfall: i64,
    /// Transaction kind.
    pub kind: TransactionKind,
    /// Balance after this transaction.
    pub balance_after: i64,
    /// Description.
    pub description: String,
    /// Consultation the charge belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consultation_id: Option<String>,
    /// Usage details.
    pub metadata: serde_json::Value,
    /// Created timestamp.
    pub created_at: String,
}

impl From<&WalletTransaction> for TransactionResponse {
    fn from(tx: &WalletTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            amount: tx.amount,
            shortfall: tx.shortfall,
            kind: tx.kind,
            balance_after: tx.balance_after,
            description: tx.description.clone(),
            consultation_id: tx.consultation_id.map(|id| id.to_string()),
            metadata: tx.metadata.clone(),
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// Transactions list response.
#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    /// Transactions, newest first.
    pub transactions: Vec<TransactionResponse>,
    /// Whether more transactions exist.
    pub has_more: bool,
}

/// List the caller's transactions.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<PaginationQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let limit = query.capped_limit();

    // Fetch one extra to check if there are more
    let transactions = state
        .ledger
        .transactions(&auth.user_id, limit + 1, query.offset)
        .await?;

    let has_more = transactions.len() > limit;
    let transactions = transactions
        .iter()
        .take(limit)
        .map(TransactionResponse::from)
        .collect();

    Ok(Json(TransactionsResponse {
        transactions,
        has_more,
    }))
}

// ============================================================================
// Rates
// ============================================================================

/// Get the rates the caller is billed at.
pub async fn get_rates(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<Rates>, ApiError> {
    Ok(Json(state.rates.rate_for(&auth.user_id).await?))
}

// ============================================================================
// Manual grants
// ============================================================================

/// Manual grant request.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    /// Recipient.
    pub user_id: String,
    /// Credits to add.
    pub amount: i64,
    /// Grant kind (default: bonus).
    #[serde(default = "default_grant_kind")]
    pub kind: TransactionKind,
    /// Reason recorded on the transaction.
    pub reason: String,
}

const fn default_grant_kind() -> TransactionKind {
    TransactionKind::Bonus
}

/// Grant response.
#[derive(Debug, Serialize)]
pub struct GrantResponse {
    /// Transaction ID.
    pub transaction_id: String,
    /// Balance after the grant.
    pub balance: i64,
}

/// Grant credits to a user (operators and trusted services only).
pub async fn grant_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<GrantRequest>,
) -> Result<Json<GrantResponse>, ApiError> {
    let user_id: UserId = body
        .user_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid user_id: {}", body.user_id)))?;

    let reason = format!("{} (by {})", body.reason.trim(), admin.actor);
    let tx = state
        .ledger
        .grant(&user_id, body.amount, body.kind, &reason)
        .await?;

    Ok(Json(GrantResponse {
        transaction_id: tx.id.to_string(),
        balance: tx.balance_after,
    }))
}
