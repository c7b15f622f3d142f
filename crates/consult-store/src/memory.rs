//! In-memory storage implementation.
//!
//! All state sits behind one mutex, so every operation is trivially atomic. Used by
//! the test suites and by the service when no database is configured.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use consult_core::{
    Consultation, ConsultationId, ConsultationStatus, ConversationMemory, CreditBalance, Expert,
    ExpertId, LedgerEntry, MemoryUpdate, Message, NewMessage, Party, PaymentGrant, PlanTier,
    Subscription, SubscriptionPlan, UserId, WalletTransaction,
};

use crate::error::{Result, StoreError};
use crate::Store;

#[derive(Default)]
struct Inner {
    balances: HashMap<UserId, CreditBalance>,
    transactions: Vec<WalletTransaction>,
    payments: HashMap<String, PaymentGrant>,
    subscriptions: HashMap<UserId, Subscription>,
    plans: HashMap<PlanTier, SubscriptionPlan>,
    experts: HashMap<ExpertId, Expert>,
    consultations: HashMap<ConsultationId, Consultation>,
    messages: HashMap<ConsultationId, Vec<Message>>,
    memories: HashMap<(UserId, ExpertId), ConversationMemory>,
}

impl Inner {
    fn apply(&mut self, entry: &LedgerEntry) -> WalletTransaction {
        let now = Utc::now();
        let balance = self
            .balances
            .entry(entry.user_id)
            .or_insert_with(|| CreditBalance::new(entry.user_id));
        let outcome = balance.apply_delta(entry.delta, now);
        let tx = WalletTransaction::record(entry, outcome, balance.balance, now);
        self.transactions.push(tx.clone());
        tx
    }

    fn consultation_mut(&mut self, id: &ConsultationId) -> Result<&mut Consultation> {
        self.consultations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("consultation", id))
    }
}

/// Process-local storage.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    async fn apply_ledger(&self, entry: &LedgerEntry) -> Result<WalletTransaction> {
        Ok(self.lock()?.apply(entry))
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>> {
        Ok(self.lock()?.balances.get(user_id).cloned())
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WalletTransaction>> {
        Ok(self
            .lock()?
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == *user_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_payment(&self, grant: &PaymentGrant) -> Result<WalletTransaction> {
        let mut inner = self.lock()?;
        if inner.payments.contains_key(&grant.transaction_id) {
            return Err(StoreError::DuplicateEvent {
                event_id: grant.transaction_id.clone(),
            });
        }
        inner
            .payments
            .insert(grant.transaction_id.clone(), grant.clone());
        Ok(inner.apply(&grant.ledger_entry()))
    }

    // =========================================================================
    // Plans and Subscriptions
    // =========================================================================

    async fn get_subscription(&self, user_id: &UserId) -> Result<Option<Subscription>> {
        Ok(self.lock()?.subscriptions.get(user_id).cloned())
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.lock()?
            .subscriptions
            .insert(subscription.user_id, subscription.clone());
        Ok(())
    }

    async fn get_plan(&self, tier: PlanTier) -> Result<Option<SubscriptionPlan>> {
        Ok(self.lock()?.plans.get(&tier).cloned())
    }

    async fn put_plan(&self, plan: &SubscriptionPlan) -> Result<()> {
        self.lock()?.plans.insert(plan.tier, plan.clone());
        Ok(())
    }

    // =========================================================================
    // Experts
    // =========================================================================

    async fn get_expert(&self, expert_id: &ExpertId) -> Result<Option<Expert>> {
        Ok(self.lock()?.experts.get(expert_id).cloned())
    }

    async fn put_expert(&self, expert: &Expert) -> Result<()> {
        self.lock()?.experts.insert(expert.id, expert.clone());
        Ok(())
    }

    // =========================================================================
    // Consultations
    // =========================================================================

    async fn insert_consultation(&self, consultation: &Consultation) -> Result<()> {
        self.lock()?
            .consultations
            .insert(consultation.id, consultation.clone());
        Ok(())
    }

    async fn get_consultation(&self, id: &ConsultationId) -> Result<Option<Consultation>> {
        Ok(self.lock()?.consultations.get(id).cloned())
    }

    async fn find_open_consultation(
        &self,
        seeker: &UserId,
        expert: &ExpertId,
    ) -> Result<Option<Consultation>> {
        Ok(self
            .lock()?
            .consultations
            .values()
            .filter(|c| c.seeker == *seeker && c.expert == *expert && !c.status.is_terminal())
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn list_consultations_for(&self, user_id: &UserId) -> Result<Vec<Consultation>> {
        let mut found: Vec<Consultation> = self
            .lock()?
            .consultations
            .values()
            .filter(|c| c.party_of(user_id).is_some())
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn transition_consultation(
        &self,
        id: &ConsultationId,
        to: ConsultationStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Consultation>> {
        let mut inner = self.lock()?;
        let consultation = inner.consultation_mut(id)?;
        Ok(consultation
            .transition(to, at)
            .ok()
            .map(|()| consultation.clone()))
    }

    async fn mark_read(
        &self,
        id: &ConsultationId,
        party: Party,
        at: DateTime<Utc>,
    ) -> Result<Consultation> {
        let mut inner = self.lock()?;
        let consultation = inner.consultation_mut(id)?;
        consultation.mark_read(party, at);
        Ok(consultation.clone())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let mut inner = self.lock()?;
        match inner.consultations.get(&message.consultation_id) {
            None => {
                return Err(StoreError::not_found(
                    "consultation",
                    message.consultation_id,
                ))
            }
            Some(c) if c.status == ConsultationStatus::Completed => {
                return Err(StoreError::ConsultationClosed {
                    id: message.consultation_id.to_string(),
                })
            }
            Some(_) => {}
        }

        let stream = inner.messages.entry(message.consultation_id).or_default();
        let now = Utc::now();
        let (seq, created_at) = match stream.last() {
            Some(last) => (last.seq + 1, now.max(last.created_at)),
            None => (1, now),
        };
        let stored = message.into_message(seq, created_at);
        stream.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(
        &self,
        id: &ConsultationId,
        after_seq: Option<u64>,
    ) -> Result<Vec<Message>> {
        let after = after_seq.unwrap_or(0);
        Ok(self
            .lock()?
            .messages
            .get(id)
            .map(|stream| stream.iter().filter(|m| m.seq > after).cloned().collect())
            .unwrap_or_default())
    }

    // =========================================================================
    // Relationship Memory
    // =========================================================================

    async fn get_memory(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
    ) -> Result<Option<ConversationMemory>> {
        Ok(self.lock()?.memories.get(&(*user_id, *expert_id)).cloned())
    }

    async fn upsert_memory(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
        update: MemoryUpdate,
        at: DateTime<Utc>,
    ) -> Result<ConversationMemory> {
        let mut inner = self.lock()?;
        let memory = inner
            .memories
            .entry((*user_id, *expert_id))
            .or_insert_with(|| ConversationMemory::new(*user_id, *expert_id));
        memory.absorb(update, at);
        Ok(memory.clone())
    }
}
