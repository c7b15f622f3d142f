//! Wallet transaction types.
//!
//! Every balance mutation produces exactly one [`WalletTransaction`]. Callers describe
//! the mutation they want with a [`LedgerEntry`]; storage backends apply it and return
//! the resulting audit row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AppliedDelta;
use crate::{ConsultationId, TransactionId, UserId};

/// An immutable record of one balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Signed change actually applied. Positive = credit, negative = debit.
    pub amount: i64,

    /// Debit credits that the balance could not cover.
    pub shortfall: i64,

    /// Type of transaction.
    pub kind: TransactionKind,

    /// Balance after this transaction.
    pub balance_after: i64,

    /// Human-readable description.
    pub description: String,

    /// Consultation this charge belongs to, if any.
    pub consultation_id: Option<ConsultationId>,

    /// Additional metadata (usage units, call seconds, product id, ...).
    pub metadata: serde_json::Value,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    /// Build the audit row for an entry that has been applied to a balance.
    #[must_use]
    pub fn record(
        entry: &LedgerEntry,
        outcome: AppliedDelta,
        balance_after: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id: entry.user_id,
            amount: outcome.applied,
            shortfall: outcome.shortfall,
            kind: entry.kind,
            balance_after,
            description: entry.description.clone(),
            consultation_id: entry.consultation_id,
            metadata: entry.metadata.clone(),
            created_at,
        }
    }

    /// The amount the entry asked for, before clamping.
    #[must_use]
    pub fn requested(&self) -> i64 {
        self.amount - self.shortfall
    }
}

/// A requested balance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The user to mutate.
    pub user_id: UserId,

    /// Signed delta. Debits are negative.
    pub delta: i64,

    /// Type of transaction.
    pub kind: TransactionKind,

    /// Human-readable description.
    pub description: String,

    /// Linked consultation, if any.
    pub consultation_id: Option<ConsultationId>,

    /// Free-form metadata stored on the audit row.
    pub metadata: serde_json::Value,
}

impl LedgerEntry {
    /// A debit for consumed usage. `amount` is taken as a magnitude.
    #[must_use]
    pub fn debit(
        user_id: UserId,
        amount: i64,
        kind: TransactionKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            delta: -amount.abs(),
            kind,
            description: description.into(),
            consultation_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// A credit (grant, purchase, refund). `amount` is taken as a magnitude.
    #[must_use]
    pub fn credit(
        user_id: UserId,
        amount: i64,
        kind: TransactionKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            delta: amount.abs(),
            kind,
            description: description.into(),
            consultation_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Link the entry to a consultation.
    #[must_use]
    pub fn with_consultation(mut self, consultation_id: Option<ConsultationId>) -> Self {
        self.consultation_id = consultation_id;
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Type of wallet transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// User purchased credits.
    Purchase,

    /// Monthly subscription credit grant.
    SubscriptionGrant,

    /// Promotional or manual credits.
    Bonus,

    /// Refund issued.
    Refund,

    /// AI chat usage.
    ChatUsage,

    /// Voice call minutes.
    CallUsage,
}

impl TransactionKind {
    /// Check if this transaction kind adds credits.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        matches!(
            self,
            Self::Purchase | Self::SubscriptionGrant | Self::Bonus | Self::Refund
        )
    }

    /// Check if this transaction kind removes credits.
    #[must_use]
    pub const fn is_debit(&self) -> bool {
        matches!(self, Self::ChatUsage | Self::CallUsage)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::SubscriptionGrant => "subscription_grant",
            Self::Bonus => "bonus",
            Self::Refund => "refund",
            Self::ChatUsage => "chat_usage",
            Self::CallUsage => "call_usage",
        }
    }

    /// Parse a stored kind name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "purchase" => Some(Self::Purchase),
            "subscription_grant" => Some(Self::SubscriptionGrant),
            "bonus" => Some(Self::Bonus),
            "refund" => Some(Self::Refund),
            "chat_usage" => Some(Self::ChatUsage),
            "call_usage" => Some(Self::CallUsage),
            _ => None,
        }
    }
}

/// Idempotency record for a confirmed store payment.
///
/// Stored together with the purchase credit; a second grant with the same
/// `transaction_id` is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentGrant {
    /// Payment provider transaction id.
    pub transaction_id: String,
    /// Purchased product.
    pub product_id: String,
    /// The buyer.
    pub user_id: UserId,
    /// Credits granted.
    pub credits: i64,
    /// When the grant was recorded.
    pub processed_at: DateTime<Utc>,
}

impl PaymentGrant {
    /// The ledger entry that credits this payment.
    #[must_use]
    pub fn ledger_entry(&self) -> LedgerEntry {
        LedgerEntry::credit(
            self.user_id,
            self.credits,
            TransactionKind::Purchase,
            format!("Purchased {}", self.product_id),
        )
        .with_metadata(serde_json::json!({
            "product_id": self.product_id,
            "transaction_id": self.transaction_id,
        }))
    }
}
