//! `RocksDB` storage implementation.
//!
//! Values are CBOR-encoded. Every read-modify-write runs under a striped mutex keyed by
//! the record it touches, and multi-record writes go through one `WriteBatch`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use consult_core::{
    Consultation, ConsultationId, ConsultationStatus, ConversationMemory, CreditBalance, Expert,
    ExpertId, LedgerEntry, MemoryUpdate, Message, NewMessage, Party, PaymentGrant, PlanTier,
    Subscription, SubscriptionPlan, UserId, WalletTransaction,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::Store;

const LOCK_STRIPES: usize = 64;

/// A fixed set of mutexes; a key always maps to the same one.
struct Stripes(Vec<Mutex<()>>);

impl Stripes {
    fn new() -> Self {
        Self((0..LOCK_STRIPES).map(|_| Mutex::new(())).collect())
    }

    fn lock(&self, key: &[u8]) -> Result<MutexGuard<'_, ()>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = usize::try_from(hasher.finish() % LOCK_STRIPES as u64).unwrap_or(0);
        self.0[index]
            .lock()
            .map_err(|_| StoreError::Database("stripe lock poisoned".into()))
    }
}

fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    ledger_locks: Stripes,
    payment_lock: Mutex<()>,
    consultation_locks: Stripes,
    memory_locks: Stripes,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(db_err)?;

        Ok(Self {
            db: Arc::new(db),
            ledger_locks: Stripes::new(),
            payment_lock: Mutex::new(()),
            consultation_locks: Stripes::new(),
            memory_locks: Stripes::new(),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn put<T: serde::Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db
            .put_cf(&cf, key, Self::serialize(value)?)
            .map_err(db_err)
    }

    /// Keys under `prefix` in a column family, in key order.
    fn prefixed_keys(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        let mut found = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item.map_err(db_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            found.push(key.to_vec());
        }
        Ok(found)
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Compute a ledger entry and add its writes to `batch`.
    ///
    /// The caller must hold the user's ledger stripe until the batch is written.
    fn stage_ledger(&self, entry: &LedgerEntry, batch: &mut WriteBatch) -> Result<WalletTransaction> {
        let now = Utc::now();
        let balance_key = keys::balance_key(&entry.user_id);
        let mut balance: CreditBalance = self
            .get(cf::BALANCES, &balance_key)?
            .unwrap_or_else(|| CreditBalance::new(entry.user_id));

        let outcome = balance.apply_delta(entry.delta, now);
        let tx = WalletTransaction::record(entry, outcome, balance.balance, now);

        batch.put_cf(&self.cf(cf::BALANCES)?, &balance_key, Self::serialize(&balance)?);
        batch.put_cf(
            &self.cf(cf::TRANSACTIONS)?,
            keys::transaction_key(&tx.id),
            Self::serialize(&tx)?,
        );
        batch.put_cf(
            &self.cf(cf::TRANSACTIONS_BY_USER)?,
            keys::user_transaction_key(&entry.user_id, &tx.id),
            [],
        );
        Ok(tx)
    }

    fn apply_ledger_sync(&self, entry: &LedgerEntry) -> Result<WalletTransaction> {
        let _guard = self.ledger_locks.lock(entry.user_id.as_bytes())?;
        let mut batch = WriteBatch::default();
        let tx = self.stage_ledger(entry, &mut batch)?;
        self.db.write(batch).map_err(db_err)?;
        Ok(tx)
    }

    fn record_payment_sync(&self, grant: &PaymentGrant) -> Result<WalletTransaction> {
        let _payments = self
            .payment_lock
            .lock()
            .map_err(|_| StoreError::Database("payment lock poisoned".into()))?;

        let payment_key = keys::payment_key(&grant.transaction_id);
        if self.get::<PaymentGrant>(cf::PAYMENT_GRANTS, &payment_key)?.is_some() {
            return Err(StoreError::DuplicateEvent {
                event_id: grant.transaction_id.clone(),
            });
        }

        let _ledger = self.ledger_locks.lock(grant.user_id.as_bytes())?;
        let mut batch = WriteBatch::default();
        let tx = self.stage_ledger(&grant.ledger_entry(), &mut batch)?;
        batch.put_cf(
            &self.cf(cf::PAYMENT_GRANTS)?,
            &payment_key,
            Self::serialize(grant)?,
        );
        self.db.write(batch).map_err(db_err)?;
        Ok(tx)
    }

    fn list_transactions_sync(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WalletTransaction>> {
        let mut index = self.prefixed_keys(cf::TRANSACTIONS_BY_USER, &keys::user_prefix(user_id))?;
        index.reverse();

        let mut transactions = Vec::new();
        for key in index.iter().skip(offset).take(limit) {
            let Some(tx_id) = keys::transaction_id_from_user_key(key) else {
                continue;
            };
            if let Some(tx) = self.get(cf::TRANSACTIONS, &keys::transaction_key(&tx_id))? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    // =========================================================================
    // Consultations and Messages
    // =========================================================================

    fn insert_consultation_sync(&self, consultation: &Consultation) -> Result<()> {
        let by_user = self.cf(cf::CONSULTATIONS_BY_USER)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &self.cf(cf::CONSULTATIONS)?,
            keys::consultation_key(&consultation.id),
            Self::serialize(consultation)?,
        );
        batch.put_cf(
            &by_user,
            keys::user_consultation_key(&consultation.seeker, &consultation.id),
            [],
        );
        batch.put_cf(
            &by_user,
            keys::user_consultation_key(&consultation.expert_user, &consultation.id),
            [],
        );
        self.db.write(batch).map_err(db_err)
    }

    fn list_consultations_sync(&self, user_id: &UserId) -> Result<Vec<Consultation>> {
        let index = self.prefixed_keys(cf::CONSULTATIONS_BY_USER, &keys::user_prefix(user_id))?;
        let mut found = Vec::with_capacity(index.len());
        for key in &index {
            let Some(id) = keys::consultation_id_from_user_key(key) else {
                continue;
            };
            if let Some(c) = self.get(cf::CONSULTATIONS, &keys::consultation_key(&id))? {
                found.push(c);
            }
        }
        found.sort_by(|a: &Consultation, b: &Consultation| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    /// Load, mutate and store a consultation under its stripe.
    fn update_consultation<R>(
        &self,
        id: &ConsultationId,
        f: impl FnOnce(&mut Consultation) -> Option<R>,
    ) -> Result<Option<R>> {
        let _guard = self.consultation_locks.lock(id.as_bytes())?;
        let key = keys::consultation_key(id);
        let mut consultation: Consultation = self
            .get(cf::CONSULTATIONS, &key)?
            .ok_or_else(|| StoreError::not_found("consultation", id))?;

        let outcome = f(&mut consultation);
        if outcome.is_some() {
            self.put(cf::CONSULTATIONS, &key, &consultation)?;
        }
        Ok(outcome)
    }

    fn last_message(&self, id: &ConsultationId) -> Result<Option<Message>> {
        let cf = self.cf(cf::MESSAGES)?;
        let prefix = keys::messages_prefix(id);
        let upper = keys::message_key(id, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));

        match iter.next() {
            Some(item) => {
                let (key, value) = item.map_err(db_err)?;
                if key.starts_with(&prefix) {
                    Self::deserialize(&value).map(Some)
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn insert_message_sync(&self, message: NewMessage) -> Result<Message> {
        let id = message.consultation_id;
        let _guard = self.consultation_locks.lock(id.as_bytes())?;
        let consultation: Consultation = self
            .get(cf::CONSULTATIONS, &keys::consultation_key(&id))?
            .ok_or_else(|| StoreError::not_found("consultation", id))?;
        if consultation.status == ConsultationStatus::Completed {
            return Err(StoreError::ConsultationClosed { id: id.to_string() });
        }

        let now = Utc::now();
        let (seq, created_at) = match self.last_message(&id)? {
            Some(last) => (last.seq + 1, now.max(last.created_at)),
            None => (1, now),
        };
        let stored = message.into_message(seq, created_at);
        self.put(cf::MESSAGES, &keys::message_key(&id, seq), &stored)?;
        Ok(stored)
    }

    fn list_messages_sync(&self, id: &ConsultationId, after_seq: Option<u64>) -> Result<Vec<Message>> {
        let cf = self.cf(cf::MESSAGES)?;
        let prefix = keys::messages_prefix(id);
        let start = keys::message_key(id, after_seq.unwrap_or(0).saturating_add(1));

        let mut messages = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item.map_err(db_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            messages.push(Self::deserialize(&value)?);
        }
        Ok(messages)
    }

    fn upsert_memory_sync(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
        update: MemoryUpdate,
        at: DateTime<Utc>,
    ) -> Result<ConversationMemory> {
        let key = keys::memory_key(user_id, expert_id);
        let _guard = self.memory_locks.lock(&key)?;
        let mut memory = self
            .get(cf::MEMORIES, &key)?
            .unwrap_or_else(|| ConversationMemory::new(*user_id, *expert_id));
        memory.absorb(update, at);
        self.put(cf::MEMORIES, &key, &memory)?;
        Ok(memory)
    }
}

#[async_trait]
impl Store for RocksStore {
    async fn apply_ledger(&self, entry: &LedgerEntry) -> Result<WalletTransaction> {
        self.apply_ledger_sync(entry)
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>> {
        self.get(cf::BALANCES, &keys::balance_key(user_id))
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WalletTransaction>> {
        self.list_transactions_sync(user_id, limit, offset)
    }

    async fn record_payment(&self, grant: &PaymentGrant) -> Result<WalletTransaction> {
        self.record_payment_sync(grant)
    }

    async fn get_subscription(&self, user_id: &UserId) -> Result<Option<Subscription>> {
        self.get(cf::SUBSCRIPTIONS, user_id.as_bytes())
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.put(cf::SUBSCRIPTIONS, subscription.user_id.as_bytes(), subscription)
    }

    async fn get_plan(&self, tier: PlanTier) -> Result<Option<SubscriptionPlan>> {
        self.get(cf::PLANS, tier.as_str().as_bytes())
    }

    async fn put_plan(&self, plan: &SubscriptionPlan) -> Result<()> {
        self.put(cf::PLANS, plan.tier.as_str().as_bytes(), plan)
    }

    async fn get_expert(&self, expert_id: &ExpertId) -> Result<Option<Expert>> {
        self.get(cf::EXPERTS, expert_id.as_bytes())
    }

    async fn put_expert(&self, expert: &Expert) -> Result<()> {
        self.put(cf::EXPERTS, expert.id.as_bytes(), expert)
    }

    async fn insert_consultation(&self, consultation: &Consultation) -> Result<()> {
        self.insert_consultation_sync(consultation)
    }

    async fn get_consultation(&self, id: &ConsultationId) -> Result<Option<Consultation>> {
        self.get(cf::CONSULTATIONS, &keys::consultation_key(id))
    }

    async fn find_open_consultation(
        &self,
        seeker: &UserId,
        expert: &ExpertId,
    ) -> Result<Option<Consultation>> {
        Ok(self
            .list_consultations_sync(seeker)?
            .into_iter()
            .find(|c| c.seeker == *seeker && c.expert == *expert && !c.status.is_terminal()))
    }

    async fn list_consultations_for(&self, user_id: &UserId) -> Result<Vec<Consultation>> {
        self.list_consultations_sync(user_id)
    }

    async fn transition_consultation(
        &self,
        id: &ConsultationId,
        to: ConsultationStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Consultation>> {
        self.update_consultation(id, |c| c.transition(to, at).ok().map(|()| c.clone()))
    }

    async fn mark_read(
        &self,
        id: &ConsultationId,
        party: Party,
        at: DateTime<Utc>,
    ) -> Result<Consultation> {
        self.update_consultation(id, |c| {
            c.mark_read(party, at);
            Some(c.clone())
        })?
        .ok_or_else(|| StoreError::not_found("consultation", id))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        self.insert_message_sync(message)
    }

    async fn list_messages(
        &self,
        id: &ConsultationId,
        after_seq: Option<u64>,
    ) -> Result<Vec<Message>> {
        self.list_messages_sync(id, after_seq)
    }

    async fn get_memory(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
    ) -> Result<Option<ConversationMemory>> {
        self.get(cf::MEMORIES, &keys::memory_key(user_id, expert_id))
    }

    async fn upsert_memory(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
        update: MemoryUpdate,
        at: DateTime<Utc>,
    ) -> Result<ConversationMemory> {
        self.upsert_memory_sync(user_id, expert_id, update, at)
    }
}
