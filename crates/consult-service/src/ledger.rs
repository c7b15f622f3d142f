//! Credit ledger.
//!
//! Every balance mutation goes through [`CreditLedger`], which delegates the atomic
//! read-modify-write to the store and adds the admission and settlement policies
//! the meters rely on.

use std::sync::Arc;

use consult_core::{
    BillingError, CallId, CallUsage, ChatUsage, ConsultationId, CreditBalance, ExpertId, LedgerEntry,
    PaymentGrant, Result, TransactionKind, UserId, WalletTransaction,
};
use consult_store::Store;

/// What a debit pays for.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    /// Transaction kind recorded on the audit row.
    pub kind: TransactionKind,
    /// Human-readable description.
    pub description: String,
    /// Consultation the usage belongs to.
    pub consultation_id: Option<ConsultationId>,
    /// Usage details.
    pub metadata: serde_json::Value,
}

impl Charge {
    /// A metered AI chat exchange.
    #[must_use]
    pub fn chat(expert_id: ExpertId, usage: &ChatUsage) -> Self {
        Self {
            kind: TransactionKind::ChatUsage,
            description: "AI chat".to_string(),
            consultation_id: None,
            metadata: serde_json::json!({
                "expert_id": expert_id.to_string(),
                "prompt_units": usage.prompt_units,
                "completion_units": usage.completion_units,
                "total_units": usage.billable_units(),
            }),
        }
    }

    /// The minutes of a voice call `usage` has not paid for yet.
    #[must_use]
    pub fn call(call_id: CallId, expert_id: ExpertId, usage: &CallUsage) -> Self {
        let minutes = usage.due_minutes();
        Self {
            kind: TransactionKind::CallUsage,
            description: format!("Voice call ({minutes} min)"),
            consultation_id: None,
            metadata: serde_json::json!({
                "call_id": call_id.to_string(),
                "expert_id": expert_id.to_string(),
                "minutes": minutes,
                "elapsed_seconds": usage.elapsed_seconds,
            }),
        }
    }

    /// Attach the consultation the usage belongs to.
    #[must_use]
    pub fn with_consultation(mut self, consultation_id: ConsultationId) -> Self {
        self.consultation_id = Some(consultation_id);
        self
    }
}

/// Per-user credit ledger.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn Store>,
}

impl CreditLedger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The user's balance row, or a zero balance if they never had a mutation.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn account(&self, user_id: &UserId) -> Result<CreditBalance> {
        Ok(self
            .store
            .get_balance(user_id)
            .await?
            .unwrap_or_else(|| CreditBalance::new(*user_id)))
    }

    /// Current balance in credits.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn balance(&self, user_id: &UserId) -> Result<i64> {
        Ok(self.account(user_id).await?.balance)
    }

    /// Transaction history, newest first.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WalletTransaction>> {
        Ok(self
            .store
            .list_transactions(user_id, limit, offset)
            .await?)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Debit `amount` credits, flooring the balance at zero.
    ///
    /// The returned row carries the new balance and any shortfall the balance could
    /// not cover.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidAmount` for non-positive amounts or a
    /// storage error.
    pub async fn deduct(
        &self,
        user_id: &UserId,
        amount: i64,
        charge: Charge,
    ) -> Result<WalletTransaction> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "debit must be positive, got {amount}"
            )));
        }
        if !charge.kind.is_debit() {
            return Err(BillingError::InvalidAmount(format!(
                "{} is not a usage kind",
                charge.kind.as_str()
            )));
        }

        // The row's amount is what the balance covered; keep what was asked for.
        let mut metadata = match charge.metadata {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("details".to_string(), other);
                map
            }
        };
        metadata.insert("requested".to_string(), amount.into());

        let entry = LedgerEntry::debit(*user_id, amount, charge.kind, charge.description)
            .with_consultation(charge.consultation_id)
            .with_metadata(serde_json::Value::Object(metadata));

        let tx = self.store.apply_ledger(&entry).await?;
        if tx.shortfall > 0 {
            tracing::warn!(
                user_id = %user_id,
                requested = amount,
                shortfall = tx.shortfall,
                "Debit clamped at zero balance"
            );
        }
        Ok(tx)
    }

    /// Credit `amount` credits.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidAmount` for non-positive amounts or usage
    /// kinds, or a storage error.
    pub async fn grant(
        &self,
        user_id: &UserId,
        amount: i64,
        kind: TransactionKind,
        reason: &str,
    ) -> Result<WalletTransaction> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(format!(
                "grant must be positive, got {amount}"
            )));
        }
        if !kind.is_credit() {
            return Err(BillingError::InvalidAmount(format!(
                "{} cannot be granted",
                kind.as_str()
            )));
        }

        let tx = self
            .store
            .apply_ledger(&LedgerEntry::credit(*user_id, amount, kind, reason))
            .await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            kind = kind.as_str(),
            new_balance = tx.balance_after,
            "Credits granted"
        );
        Ok(tx)
    }

    /// Credit a confirmed payment exactly once per provider transaction id.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::DuplicateEvent` if the transaction was already
    /// processed.
    pub async fn record_payment(&self, grant: &PaymentGrant) -> Result<WalletTransaction> {
        let tx = self.store.record_payment(grant).await?;
        tracing::info!(
            user_id = %grant.user_id,
            product_id = %grant.product_id,
            transaction_id = %grant.transaction_id,
            credits = grant.credits,
            new_balance = tx.balance_after,
            "Payment credited"
        );
        Ok(tx)
    }

    // =========================================================================
    // Metering policies
    // =========================================================================

    /// Admission check run before a metered activity starts.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::AdmissionDenied` if the balance is below `required`.
    pub async fn admit(&self, user_id: &UserId, required: i64) -> Result<i64> {
        let balance = self.balance(user_id).await?;
        if balance < required {
            tracing::info!(
                user_id = %user_id,
                balance = balance,
                required = required,
                "Admission denied"
            );
            return Err(BillingError::AdmissionDenied { balance, required });
        }
        Ok(balance)
    }

    /// Charge for usage that was already rendered.
    ///
    /// Never fails: a ledger failure is logged as unrecorded billing and `None`
    /// is returned.
    pub async fn settle(&self, user_id: &UserId, amount: i64, charge: Charge) -> Option<i64> {
        let kind = charge.kind;
        match self.deduct(user_id, amount, charge).await {
            Ok(tx) => {
                tracing::info!(
                    user_id = %user_id,
                    amount = amount,
                    kind = kind.as_str(),
                    new_balance = tx.balance_after,
                    "Usage settled"
                );
                Some(tx.balance_after)
            }
            Err(e) => {
                let err = BillingError::BillingUnrecorded {
                    user_id: user_id.to_string(),
                    amount,
                    reason: e.to_string(),
                };
                tracing::error!(error = %err, kind = kind.as_str(), "Usage settlement failed");
                None
            }
        }
    }
}
