//! Consultation lifecycle: `waiting -> active -> completed`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use consult_core::{
    BillingError, Consultation, ConsultationId, ConsultationStatus, ExpertId, Party, Result,
    UserId,
};
use consult_store::Store;

/// Opens consultations with human experts and moves them forward.
#[derive(Clone)]
pub struct ConsultationLifecycle {
    store: Arc<dyn Store>,
    open_gate: Arc<Mutex<()>>,
}

impl ConsultationLifecycle {
    /// Create a lifecycle over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            open_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Open a consultation between `seeker` and a human expert.
    ///
    /// Returns the pair's existing open consultation when there is one.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::ExpertUnresolved` for unknown experts, AI personas,
    /// human experts without a linked account and self-consultation. Nothing is
    /// written in those cases.
    pub async fn open(
        &self,
        seeker: &UserId,
        expert_id: &ExpertId,
        concern: &str,
    ) -> Result<Consultation> {
        let unresolved = || BillingError::ExpertUnresolved {
            expert_id: expert_id.to_string(),
        };

        let expert = self
            .store
            .get_expert(expert_id)
            .await?
            .ok_or_else(unresolved)?;
        let expert_user = expert.consultable_user()?;
        if expert_user == *seeker {
            return Err(unresolved());
        }

        // Serializes the lookup and the insert so concurrent opens for one pair
        // converge on a single consultation.
        let _guard = self.open_gate.lock().await;

        if let Some(existing) = self.store.find_open_consultation(seeker, expert_id).await? {
            tracing::debug!(
                consultation_id = %existing.id,
                seeker = %seeker,
                "Reusing open consultation"
            );
            return Ok(existing);
        }

        let consultation = Consultation::new(*seeker, *expert_id, expert_user, concern.trim());
        self.store.insert_consultation(&consultation).await?;

        tracing::info!(
            consultation_id = %consultation.id,
            seeker = %seeker,
            expert_id = %expert_id,
            "Consultation opened"
        );
        Ok(consultation)
    }

    /// Fetch a consultation on behalf of `actor`.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotFound` or `BillingError::NotParticipant`.
    pub async fn get(&self, id: &ConsultationId, actor: &UserId) -> Result<(Consultation, Party)> {
        let consultation = self.load(id).await?;
        let party = consultation.require_party(actor)?;
        Ok((consultation, party))
    }

    /// Conditionally move `waiting -> active`.
    ///
    /// Returns `None` when the consultation was not waiting (a racing activation
    /// already won, or it is completed).
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotFound` if the consultation does not exist.
    pub async fn activate(&self, id: &ConsultationId) -> Result<Option<Consultation>> {
        let activated = self
            .store
            .transition_consultation(id, ConsultationStatus::Active, Utc::now())
            .await?;
        if activated.is_some() {
            tracing::info!(consultation_id = %id, "Consultation active");
        }
        Ok(activated)
    }

    /// Complete a consultation. Completing an already completed consultation is a
    /// no-op that returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotFound` or `BillingError::NotParticipant`.
    pub async fn complete(&self, id: &ConsultationId, actor: &UserId) -> Result<Consultation> {
        let (consultation, party) = self.get(id, actor).await?;
        if consultation.status.is_terminal() {
            return Ok(consultation);
        }

        match self
            .store
            .transition_consultation(id, ConsultationStatus::Completed, Utc::now())
            .await?
        {
            Some(completed) => {
                tracing::info!(
                    consultation_id = %id,
                    ended_by = ?party,
                    "Consultation completed"
                );
                Ok(completed)
            }
            None => self.load(id).await,
        }
    }

    /// Consultations `user_id` takes part in, newest first.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn list_for(&self, user_id: &UserId) -> Result<Vec<Consultation>> {
        Ok(self.store.list_consultations_for(user_id).await?)
    }

    async fn load(&self, id: &ConsultationId) -> Result<Consultation> {
        self.store
            .get_consultation(id)
            .await?
            .ok_or_else(|| BillingError::NotFound {
                entity: "consultation",
                id: id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_core::{Expert, ExpertKind};
    use consult_store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        lifecycle: ConsultationLifecycle,
        seeker: UserId,
        astrologer: UserId,
        expert_id: ExpertId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let astrologer = UserId::generate();
        let expert = Expert {
            id: ExpertId::generate(),
            display_name: "Mira".into(),
            kind: ExpertKind::Human,
            linked_user: Some(astrologer),
            persona: None,
            voice_agent_id: None,
            created_at: Utc::now(),
        };
        store.put_expert(&expert).await.unwrap();

        Fixture {
            lifecycle: ConsultationLifecycle::new(store.clone()),
            store,
            seeker: UserId::generate(),
            astrologer,
            expert_id: expert.id,
        }
    }

    #[tokio::test]
    async fn open_reuses_pending_consultation() {
        let f = fixture().await;
        let first = f
            .lifecycle
            .open(&f.seeker, &f.expert_id, "career")
            .await
            .unwrap();
        let second = f
            .lifecycle
            .open(&f.seeker, &f.expert_id, "love")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ConsultationStatus::Waiting);
        assert_eq!(first.expert_user, f.astrologer);
    }

    #[tokio::test]
    async fn ai_and_unlinked_experts_are_rejected() {
        let f = fixture().await;
        for (kind, linked) in [(ExpertKind::Ai, None), (ExpertKind::Human, None)] {
            let expert = Expert {
                id: ExpertId::generate(),
                display_name: "Orion".into(),
                kind,
                linked_user: linked,
                persona: None,
                voice_agent_id: None,
                created_at: Utc::now(),
            };
            f.store.put_expert(&expert).await.unwrap();

            assert!(matches!(
                f.lifecycle.open(&f.seeker, &expert.id, "x").await,
                Err(BillingError::ExpertUnresolved { .. })
            ));
        }
        assert!(matches!(
            f.lifecycle.open(&f.seeker, &ExpertId::generate(), "x").await,
            Err(BillingError::ExpertUnresolved { .. })
        ));
        assert!(f.lifecycle.list_for(&f.seeker).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expert_cannot_consult_themselves() {
        let f = fixture().await;
        assert!(matches!(
            f.lifecycle.open(&f.astrologer, &f.expert_id, "x").await,
            Err(BillingError::ExpertUnresolved { .. })
        ));
    }

    #[tokio::test]
    async fn activation_is_conditional() {
        let f = fixture().await;
        let c = f
            .lifecycle
            .open(&f.seeker, &f.expert_id, "career")
            .await
            .unwrap();

        let active = f.lifecycle.activate(&c.id).await.unwrap().unwrap();
        assert_eq!(active.status, ConsultationStatus::Active);
        assert!(active.started_at.is_some());
        assert!(f.lifecycle.activate(&c.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_is_terminal_and_idempotent() {
        let f = fixture().await;
        let c = f
            .lifecycle
            .open(&f.seeker, &f.expert_id, "career")
            .await
            .unwrap();

        let done = f.lifecycle.complete(&c.id, &f.astrologer).await.unwrap();
        assert_eq!(done.status, ConsultationStatus::Completed);
        let ended_at = done.ended_at;

        let again = f.lifecycle.complete(&c.id, &f.seeker).await.unwrap();
        assert_eq!(again.ended_at, ended_at);
        assert!(f.lifecycle.activate(&c.id).await.unwrap().is_none());

        // A completed pair gets a fresh consultation.
        let next = f
            .lifecycle
            .open(&f.seeker, &f.expert_id, "again")
            .await
            .unwrap();
        assert_ne!(next.id, c.id);
    }

    #[tokio::test]
    async fn outsiders_cannot_complete() {
        let f = fixture().await;
        let c = f
            .lifecycle
            .open(&f.seeker, &f.expert_id, "career")
            .await
            .unwrap();

        assert!(matches!(
            f.lifecycle.complete(&c.id, &UserId::generate()).await,
            Err(BillingError::NotParticipant { .. })
        ));
        assert!(matches!(
            f.lifecycle.get(&ConsultationId::generate(), &f.seeker).await,
            Err(BillingError::NotFound { .. })
        ));
    }
}
