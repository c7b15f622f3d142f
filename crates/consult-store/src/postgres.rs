//! PostgreSQL storage implementation.
//!
//! Queries are built at runtime (no compile-time database access). Ledger mutations
//! run as one conditional `UPDATE ... RETURNING` inside a transaction, so concurrent
//! writers for the same user are serialized by the row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use consult_core::{
    AppliedDelta, Consultation, ConsultationId, ConsultationStatus, ConversationMemory,
    CreditBalance, Expert, ExpertId, ExpertKind, LedgerEntry, MemoryUpdate, Message, MessageKind,
    NewMessage, Party, PaymentGrant, PlanTier, Subscription, SubscriptionPlan,
    SubscriptionStatus, TransactionKind, UserId, WalletTransaction,
};

use crate::error::{Result, StoreError};
use crate::{sources_for, Store};

const CONSULTATION_COLUMNS: &str = "id, seeker, expert, expert_user, status, concern, \
     created_at, started_at, ended_at, last_read_at_seeker, last_read_at_expert";

const TRANSACTION_COLUMNS: &str = "id, user_id, amount, shortfall, kind, balance_after, \
     description, consultation_id, metadata, created_at";

/// PostgreSQL-backed storage.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }
}

/// Apply one ledger entry on an open transaction.
async fn apply_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> Result<WalletTransaction> {
    let now = Utc::now();
    let user = *entry.user_id.as_uuid();

    sqlx::query(
        "INSERT INTO credit_balances (user_id, created_at, updated_at) VALUES ($1, $2, $2) \
         ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query(
        "WITH prev AS (SELECT balance FROM credit_balances WHERE user_id = $1 FOR UPDATE) \
         UPDATE credit_balances c SET \
             balance = GREATEST(c.balance + $2, 0), \
             lifetime_earned = c.lifetime_earned + GREATEST($2, 0), \
             lifetime_used = c.lifetime_used + LEAST(c.balance, GREATEST(-$2, 0)), \
             updated_at = $3 \
         FROM prev WHERE c.user_id = $1 \
         RETURNING prev.balance AS previous, c.balance AS balance",
    )
    .bind(user)
    .bind(entry.delta)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    let previous: i64 = row.try_get("previous")?;
    let balance: i64 = row.try_get("balance")?;
    let applied = balance - previous;
    let outcome = AppliedDelta {
        applied,
        shortfall: if entry.delta < 0 {
            applied - entry.delta
        } else {
            0
        },
    };

    let tx = WalletTransaction::record(entry, outcome, balance, now);
    sqlx::query(
        "INSERT INTO wallet_transactions \
         (id, user_id, amount, shortfall, kind, balance_after, description, consultation_id, metadata, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(tx.id.to_string())
    .bind(user)
    .bind(tx.amount)
    .bind(tx.shortfall)
    .bind(tx.kind.as_str())
    .bind(tx.balance_after)
    .bind(&tx.description)
    .bind(tx.consultation_id.map(|id| *id.as_uuid()))
    .bind(&tx.metadata)
    .bind(tx.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(tx)
}

// ============================================================================
// Row Mapping
// ============================================================================

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Serialization(format!("invalid {what}: {value}"))
}

fn transaction_from_row(row: &PgRow) -> Result<WalletTransaction> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    Ok(WalletTransaction {
        id: id.parse().map_err(|_| corrupt("transaction id", &id))?,
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        amount: row.try_get("amount")?,
        shortfall: row.try_get("shortfall")?,
        kind: TransactionKind::from_name(&kind).ok_or_else(|| corrupt("transaction kind", &kind))?,
        balance_after: row.try_get("balance_after")?,
        description: row.try_get("description")?,
        consultation_id: row
            .try_get::<Option<Uuid>, _>("consultation_id")?
            .map(ConsultationId::from_uuid),
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn balance_from_row(row: &PgRow) -> Result<CreditBalance> {
    Ok(CreditBalance {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        balance: row.try_get("balance")?,
        lifetime_earned: row.try_get("lifetime_earned")?,
        lifetime_used: row.try_get("lifetime_used")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tier_from(name: &str) -> Result<PlanTier> {
    PlanTier::from_name(name).ok_or_else(|| corrupt("tier", name))
}

fn consultation_from_row(row: &PgRow) -> Result<Consultation> {
    let status: String = row.try_get("status")?;
    Ok(Consultation {
        id: ConsultationId::from_uuid(row.try_get("id")?),
        seeker: UserId::from_uuid(row.try_get("seeker")?),
        expert: ExpertId::from_uuid(row.try_get("expert")?),
        expert_user: UserId::from_uuid(row.try_get("expert_user")?),
        status: ConsultationStatus::from_name(&status)
            .ok_or_else(|| corrupt("consultation status", &status))?,
        concern: row.try_get("concern")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        last_read_at_seeker: row.try_get("last_read_at_seeker")?,
        last_read_at_expert: row.try_get("last_read_at_expert")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let seq: i64 = row.try_get("seq")?;
    Ok(Message {
        id: id.parse().map_err(|_| corrupt("message id", &id))?,
        consultation_id: ConsultationId::from_uuid(row.try_get("consultation_id")?),
        seq: u64::try_from(seq).map_err(|_| corrupt("message seq", &seq.to_string()))?,
        sender: UserId::from_uuid(row.try_get("sender")?),
        content: row.try_get("content")?,
        kind: MessageKind::from_name(&kind).ok_or_else(|| corrupt("message kind", &kind))?,
        created_at: row.try_get("created_at")?,
    })
}

fn memory_from_row(row: &PgRow) -> Result<ConversationMemory> {
    let total_calls: i32 = row.try_get("total_calls")?;
    Ok(ConversationMemory {
        user_id: UserId::from_uuid(row.try_get("user_id")?),
        expert_id: ExpertId::from_uuid(row.try_get("expert_id")?),
        key_points: row.try_get("key_points")?,
        summary: row.try_get("summary")?,
        total_calls: u32::try_from(total_calls)
            .map_err(|_| corrupt("total_calls", &total_calls.to_string()))?,
        last_call_at: row.try_get("last_call_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| corrupt(what, &value.to_string()))
}

#[async_trait]
impl Store for PgStore {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    async fn apply_ledger(&self, entry: &LedgerEntry) -> Result<WalletTransaction> {
        let mut tx = self.pool.begin().await?;
        let recorded = apply_entry(&mut *tx, entry).await?;
        tx.commit().await?;
        Ok(recorded)
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>> {
        sqlx::query(
            "SELECT user_id, balance, lifetime_earned, lifetime_used, created_at, updated_at \
             FROM credit_balances WHERE user_id = $1",
        )
        .bind(*user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(balance_from_row)
        .transpose()
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WalletTransaction>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions \
             WHERE user_id = $1 ORDER BY id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(*user_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn record_payment(&self, grant: &PaymentGrant) -> Result<WalletTransaction> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO payment_grants (transaction_id, product_id, user_id, credits, processed_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (transaction_id) DO NOTHING",
        )
        .bind(&grant.transaction_id)
        .bind(&grant.product_id)
        .bind(*grant.user_id.as_uuid())
        .bind(grant.credits)
        .bind(grant.processed_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::DuplicateEvent {
                event_id: grant.transaction_id.clone(),
            });
        }

        let recorded = apply_entry(&mut *tx, &grant.ledger_entry()).await?;
        tx.commit().await?;
        Ok(recorded)
    }

    // =========================================================================
    // Plans and Subscriptions
    // =========================================================================

    async fn get_subscription(&self, user_id: &UserId) -> Result<Option<Subscription>> {
        let Some(row) = sqlx::query(
            "SELECT user_id, tier, status, current_period_end, updated_at \
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(*user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let tier: String = row.try_get("tier")?;
        let status: String = row.try_get("status")?;
        Ok(Some(Subscription {
            user_id: UserId::from_uuid(row.try_get("user_id")?),
            tier: tier_from(&tier)?,
            status: SubscriptionStatus::from_name(&status)
                .ok_or_else(|| corrupt("subscription status", &status))?,
            current_period_end: row.try_get("current_period_end")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions (user_id, tier, status, current_period_end, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id) DO UPDATE SET tier = EXCLUDED.tier, status = EXCLUDED.status, \
             current_period_end = EXCLUDED.current_period_end, updated_at = EXCLUDED.updated_at",
        )
        .bind(*subscription.user_id.as_uuid())
        .bind(subscription.tier.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_end)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan(&self, tier: PlanTier) -> Result<Option<SubscriptionPlan>> {
        let Some(row) = sqlx::query(
            "SELECT tier, chat_credit_per_1k_units, call_credit_per_minute, monthly_grant \
             FROM subscription_plans WHERE tier = $1",
        )
        .bind(tier.as_str())
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let tier: String = row.try_get("tier")?;
        Ok(Some(SubscriptionPlan {
            tier: tier_from(&tier)?,
            chat_credit_per_1k_units: row.try_get("chat_credit_per_1k_units")?,
            call_credit_per_minute: row.try_get("call_credit_per_minute")?,
            monthly_grant: row.try_get("monthly_grant")?,
        }))
    }

    async fn put_plan(&self, plan: &SubscriptionPlan) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscription_plans \
             (tier, chat_credit_per_1k_units, call_credit_per_minute, monthly_grant) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (tier) DO UPDATE SET \
             chat_credit_per_1k_units = EXCLUDED.chat_credit_per_1k_units, \
             call_credit_per_minute = EXCLUDED.call_credit_per_minute, \
             monthly_grant = EXCLUDED.monthly_grant",
        )
        .bind(plan.tier.as_str())
        .bind(plan.chat_credit_per_1k_units)
        .bind(plan.call_credit_per_minute)
        .bind(plan.monthly_grant)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Experts
    // =========================================================================

    async fn get_expert(&self, expert_id: &ExpertId) -> Result<Option<Expert>> {
        let Some(row) = sqlx::query(
            "SELECT id, display_name, kind, linked_user, persona, voice_agent_id, created_at \
             FROM experts WHERE id = $1",
        )
        .bind(*expert_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let kind: String = row.try_get("kind")?;
        Ok(Some(Expert {
            id: ExpertId::from_uuid(row.try_get("id")?),
            display_name: row.try_get("display_name")?,
            kind: ExpertKind::from_name(&kind).ok_or_else(|| corrupt("expert kind", &kind))?,
            linked_user: row
                .try_get::<Option<Uuid>, _>("linked_user")?
                .map(UserId::from_uuid),
            persona: row.try_get("persona")?,
            voice_agent_id: row.try_get("voice_agent_id")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn put_expert(&self, expert: &Expert) -> Result<()> {
        sqlx::query(
            "INSERT INTO experts (id, display_name, kind, linked_user, persona, voice_agent_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET display_name = EXCLUDED.display_name, \
             kind = EXCLUDED.kind, linked_user = EXCLUDED.linked_user, \
             persona = EXCLUDED.persona, voice_agent_id = EXCLUDED.voice_agent_id",
        )
        .bind(*expert.id.as_uuid())
        .bind(&expert.display_name)
        .bind(expert.kind.as_str())
        .bind(expert.linked_user.map(|u| *u.as_uuid()))
        .bind(&expert.persona)
        .bind(&expert.voice_agent_id)
        .bind(expert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Consultations
    // =========================================================================

    async fn insert_consultation(&self, consultation: &Consultation) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO consultations ({CONSULTATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(*consultation.id.as_uuid())
        .bind(*consultation.seeker.as_uuid())
        .bind(*consultation.expert.as_uuid())
        .bind(*consultation.expert_user.as_uuid())
        .bind(consultation.status.as_str())
        .bind(&consultation.concern)
        .bind(consultation.created_at)
        .bind(consultation.started_at)
        .bind(consultation.ended_at)
        .bind(consultation.last_read_at_seeker)
        .bind(consultation.last_read_at_expert)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_consultation(&self, id: &ConsultationId) -> Result<Option<Consultation>> {
        sqlx::query(&format!(
            "SELECT {CONSULTATION_COLUMNS} FROM consultations WHERE id = $1"
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(consultation_from_row)
        .transpose()
    }

    async fn find_open_consultation(
        &self,
        seeker: &UserId,
        expert: &ExpertId,
    ) -> Result<Option<Consultation>> {
        sqlx::query(&format!(
            "SELECT {CONSULTATION_COLUMNS} FROM consultations \
             WHERE seeker = $1 AND expert = $2 AND status <> 'completed' \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(*seeker.as_uuid())
        .bind(*expert.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(consultation_from_row)
        .transpose()
    }

    async fn list_consultations_for(&self, user_id: &UserId) -> Result<Vec<Consultation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONSULTATION_COLUMNS} FROM consultations \
             WHERE seeker = $1 OR expert_user = $1 ORDER BY created_at DESC"
        ))
        .bind(*user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(consultation_from_row).collect()
    }

    async fn transition_consultation(
        &self,
        id: &ConsultationId,
        to: ConsultationStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Consultation>> {
        let sources: Vec<String> = sources_for(to)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let updated = sqlx::query(&format!(
            "UPDATE consultations SET status = $2, \
             started_at = CASE WHEN $2 = 'active' THEN $3 ELSE started_at END, \
             ended_at = CASE WHEN $2 = 'completed' THEN $3 ELSE ended_at END \
             WHERE id = $1 AND status = ANY($4) \
             RETURNING {CONSULTATION_COLUMNS}"
        ))
        .bind(*id.as_uuid())
        .bind(to.as_str())
        .bind(at)
        .bind(&sources)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return consultation_from_row(&row).map(Some);
        }
        if self.get_consultation(id).await?.is_none() {
            return Err(StoreError::not_found("consultation", id));
        }
        Ok(None)
    }

    async fn mark_read(
        &self,
        id: &ConsultationId,
        party: Party,
        at: DateTime<Utc>,
    ) -> Result<Consultation> {
        let column = match party {
            Party::Seeker => "last_read_at_seeker",
            Party::Expert => "last_read_at_expert",
        };
        sqlx::query(&format!(
            "UPDATE consultations SET {column} = GREATEST(COALESCE({column}, $2), $2) \
             WHERE id = $1 RETURNING {CONSULTATION_COLUMNS}"
        ))
        .bind(*id.as_uuid())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(consultation_from_row)
        .transpose()?
        .ok_or_else(|| StoreError::not_found("consultation", id))
    }

    // =========================================================================
    // Messages
    // =========================================================================

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let mut tx = self.pool.begin().await?;
        let id = message.consultation_id;

        let status: String =
            sqlx::query("SELECT status FROM consultations WHERE id = $1 FOR UPDATE")
                .bind(*id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("consultation", id))?
                .try_get("status")?;
        if status == ConsultationStatus::Completed.as_str() {
            return Err(StoreError::ConsultationClosed { id: id.to_string() });
        }

        let last = sqlx::query(
            "SELECT seq, created_at FROM messages WHERE consultation_id = $1 \
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(*id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let now = Utc::now();
        let (seq, created_at) = match last {
            Some(row) => {
                let seq: i64 = row.try_get("seq")?;
                let at: DateTime<Utc> = row.try_get("created_at")?;
                (seq + 1, now.max(at))
            }
            None => (1, now),
        };

        let stored = message.into_message(
            u64::try_from(seq).map_err(|_| corrupt("message seq", &seq.to_string()))?,
            created_at,
        );
        sqlx::query(
            "INSERT INTO messages (id, consultation_id, seq, sender, content, kind, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(stored.id.to_string())
        .bind(*id.as_uuid())
        .bind(seq)
        .bind(*stored.sender.as_uuid())
        .bind(&stored.content)
        .bind(stored.kind.as_str())
        .bind(stored.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn list_messages(
        &self,
        id: &ConsultationId,
        after_seq: Option<u64>,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, consultation_id, seq, sender, content, kind, created_at FROM messages \
             WHERE consultation_id = $1 AND seq > $2 ORDER BY seq ASC",
        )
        .bind(*id.as_uuid())
        .bind(to_i64(after_seq.unwrap_or(0), "after_seq")?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn count_unread(
        &self,
        id: &ConsultationId,
        reader: &UserId,
        since: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE consultation_id = $1 AND sender <> $2 \
             AND ($3::timestamptz IS NULL OR created_at > $3)",
        )
        .bind(*id.as_uuid())
        .bind(*reader.as_uuid())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        usize::try_from(count).map_err(|_| corrupt("unread count", &count.to_string()))
    }

    // =========================================================================
    // Relationship Memory
    // =========================================================================

    async fn get_memory(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
    ) -> Result<Option<ConversationMemory>> {
        sqlx::query(
            "SELECT user_id, expert_id, key_points, summary, total_calls, last_call_at, updated_at \
             FROM conversation_memories WHERE user_id = $1 AND expert_id = $2",
        )
        .bind(*user_id.as_uuid())
        .bind(*expert_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(memory_from_row)
        .transpose()
    }

    async fn upsert_memory(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
        update: MemoryUpdate,
        at: DateTime<Utc>,
    ) -> Result<ConversationMemory> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversation_memories (user_id, expert_id, updated_at) \
             VALUES ($1, $2, $3) ON CONFLICT (user_id, expert_id) DO NOTHING",
        )
        .bind(*user_id.as_uuid())
        .bind(*expert_id.as_uuid())
        .bind(at)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT user_id, expert_id, key_points, summary, total_calls, last_call_at, updated_at \
             FROM conversation_memories WHERE user_id = $1 AND expert_id = $2 FOR UPDATE",
        )
        .bind(*user_id.as_uuid())
        .bind(*expert_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;

        let mut memory = memory_from_row(&row)?;
        memory.absorb(update, at);

        sqlx::query(
            "UPDATE conversation_memories SET key_points = $3, summary = $4, total_calls = $5, \
             last_call_at = $6, updated_at = $7 WHERE user_id = $1 AND expert_id = $2",
        )
        .bind(*user_id.as_uuid())
        .bind(*expert_id.as_uuid())
        .bind(&memory.key_points)
        .bind(&memory.summary)
        .bind(i32::try_from(memory.total_calls).unwrap_or(i32::MAX))
        .bind(memory.last_call_at)
        .bind(memory.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(memory)
    }
}
