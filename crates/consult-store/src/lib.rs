//! Storage layer for the consultation engine.
//!
//! This crate persists wallets, the transaction log, consultations, messages,
//! experts, subscriptions and relationship memory behind one async [`Store`] trait.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local maps behind a single lock. Used by tests and
//!   local development.
//! - [`PgStore`]: PostgreSQL via `sqlx`, with embedded migrations. Ledger writes are a
//!   single `UPDATE ... RETURNING` inside a transaction; status changes are
//!   conditional updates.
//! - `RocksStore` (feature `rocksdb-backend`): column families with CBOR values and
//!   write batches; read-modify-write is serialized by striped locks.
//!
//! # Example
//!
//! ```no_run
//! use consult_core::{LedgerEntry, TransactionKind, UserId};
//! use consult_store::{MemoryStore, Store};
//!
//! # async fn demo() -> consult_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//!
//! let entry = LedgerEntry::credit(user_id, 100, TransactionKind::Bonus, "welcome");
//! let tx = store.apply_ledger(&entry).await?;
//! assert_eq!(tx.balance_after, 100);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use consult_core::{
    unread_count, Consultation, ConsultationId, ConsultationStatus, ConversationMemory,
    CreditBalance, Expert, ExpertId, LedgerEntry, MemoryUpdate, Message, NewMessage, Party,
    PaymentGrant, PlanTier, Subscription, SubscriptionPlan, UserId, WalletTransaction,
};

/// The storage trait defining all database operations.
///
/// Every method that mutates more than one record does so atomically.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Apply a balance mutation and append its audit row, atomically per user.
    ///
    /// The balance row is created lazily. Debits larger than the balance floor it at
    /// zero; the uncovered part is returned as `shortfall`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn apply_ledger(&self, entry: &LedgerEntry) -> Result<WalletTransaction>;

    /// Get the balance row of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>>;

    /// List transactions for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WalletTransaction>>;

    /// Record a confirmed payment and credit it in one step.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateEvent` if the payment transaction id was already
    /// processed; nothing is written in that case.
    async fn record_payment(&self, grant: &PaymentGrant) -> Result<WalletTransaction>;

    // =========================================================================
    // Plans and Subscriptions
    // =========================================================================

    /// Get the subscription of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_subscription(&self, user_id: &UserId) -> Result<Option<Subscription>>;

    /// Insert or replace a subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Get the stored plan for a tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_plan(&self, tier: PlanTier) -> Result<Option<SubscriptionPlan>>;

    /// Insert or replace a plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_plan(&self, plan: &SubscriptionPlan) -> Result<()>;

    // =========================================================================
    // Experts
    // =========================================================================

    /// Get an expert profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_expert(&self, expert_id: &ExpertId) -> Result<Option<Expert>>;

    /// Insert or replace an expert profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_expert(&self, expert: &Expert) -> Result<()>;

    // =========================================================================
    // Consultations
    // =========================================================================

    /// Insert a new consultation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_consultation(&self, consultation: &Consultation) -> Result<()>;

    /// Get a consultation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_consultation(&self, id: &ConsultationId) -> Result<Option<Consultation>>;

    /// The non-completed consultation between a seeker and an expert, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_open_consultation(
        &self,
        seeker: &UserId,
        expert: &ExpertId,
    ) -> Result<Option<Consultation>>;

    /// Consultations where `user_id` is the seeker or the expert, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_consultations_for(&self, user_id: &UserId) -> Result<Vec<Consultation>>;

    /// Move a consultation to `to` if its current status allows it.
    ///
    /// Returns the updated consultation, or `None` when the current status does not
    /// permit the move (the row is left untouched).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the consultation does not exist.
    async fn transition_consultation(
        &self,
        id: &ConsultationId,
        to: ConsultationStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Consultation>>;

    /// Advance a party's read marker to `at`. Markers never move backwards.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the consultation does not exist.
    async fn mark_read(
        &self,
        id: &ConsultationId,
        party: Party,
        at: DateTime<Utc>,
    ) -> Result<Consultation>;

    // =========================================================================
    // Messages
    // =========================================================================

    /// Append a message, assigning the next sequence number and the insertion time.
    ///
    /// Insertion times never decrease within a consultation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn insert_message(&self, message: NewMessage) -> Result<Message>;

    /// Messages of a consultation in insertion order, optionally after a sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_messages(
        &self,
        id: &ConsultationId,
        after_seq: Option<u64>,
    ) -> Result<Vec<Message>>;

    /// Messages in a consultation not sent by `reader` and newer than `since`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn count_unread(
        &self,
        id: &ConsultationId,
        reader: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let messages = self.list_messages(id, None).await?;
        Ok(unread_count(&messages, reader, since))
    }

    // =========================================================================
    // Relationship Memory
    // =========================================================================

    /// Get the memory of a (seeker, expert) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_memory(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
    ) -> Result<Option<ConversationMemory>>;

    /// Fold a call into the pair's memory, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn upsert_memory(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
        update: MemoryUpdate,
        at: DateTime<Utc>,
    ) -> Result<ConversationMemory>;
}

/// Statuses from which a move to `to` is permitted.
pub(crate) fn sources_for(to: ConsultationStatus) -> Vec<ConsultationStatus> {
    ConsultationStatus::ALL
        .into_iter()
        .filter(|from| from.can_transition_to(to))
        .collect()
}
