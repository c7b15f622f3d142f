//! Relationship memory distillation.
//!
//! After a call ends the transcript is reduced to a handful of durable facts about
//! the seeker. The call is counted first; extraction runs in the background and is
//! best effort, so a slow or unavailable model never loses the call.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use consult_core::{ConversationMemory, ExpertId, MemoryUpdate, Result, UserId};
use consult_store::Store;

use crate::provider::{ChatProvider, ChatTurn};
use crate::voice::VoiceProvider;

/// Attempts made to get a well-formed extraction from the model.
const EXTRACTION_ATTEMPTS: usize = 3;

/// Transcripts shorter than this carry nothing worth remembering.
const MIN_TRANSCRIPT_CHARS: usize = 20;

const EXTRACTION_PROMPT: &str = "You maintain an astrologer's private notes about a client. \
Read the call transcript and reply with a JSON object of the form \
{\"key_points\": [string], \"summary\": string}. \
key_points holds 3 to 8 short, durable facts about the client (life events, concerns, \
birth details, preferences) that are not already in the known facts. \
summary is at most two sentences describing the relationship so far.";

#[derive(Debug, Deserialize)]
struct Extraction {
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// Turns call transcripts into [`ConversationMemory`] updates.
#[derive(Clone)]
pub struct MemoryDistiller {
    store: Arc<dyn Store>,
    provider: Option<Arc<dyn ChatProvider>>,
    voice: Option<Arc<dyn VoiceProvider>>,
}

impl MemoryDistiller {
    /// Create a distiller. Without a provider only call counts are kept.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Option<Arc<dyn ChatProvider>>,
        voice: Option<Arc<dyn VoiceProvider>>,
    ) -> Self {
        Self {
            store,
            provider,
            voice,
        }
    }

    /// The pair's memory, if any call has been recorded.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn get(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
    ) -> Result<Option<ConversationMemory>> {
        Ok(self.store.get_memory(user_id, expert_id).await?)
    }

    /// Fold one finished call into the pair's memory.
    ///
    /// The call is counted before this returns. Key points are extracted from
    /// `transcript`, or from the provider transcript behind `conversation_id`, by
    /// a background task that merges them when the model answers.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the call cannot be recorded.
    pub async fn distill(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
        transcript: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<ConversationMemory> {
        let now = Utc::now();
        let memory = self
            .store
            .upsert_memory(user_id, expert_id, MemoryUpdate::call_only(now), now)
            .await?;
        tracing::info!(
            user_id = %user_id,
            expert_id = %expert_id,
            total_calls = memory.total_calls,
            "Call recorded in memory"
        );

        let has_source =
            transcript.is_some() || (self.voice.is_some() && conversation_id.is_some());
        if self.provider.is_some() && has_source {
            let distiller = self.clone();
            let (user_id, expert_id) = (*user_id, *expert_id);
            let transcript = transcript.map(str::to_string);
            let conversation_id = conversation_id.map(str::to_string);
            tokio::spawn(async move {
                if let Err(e) = distiller
                    .enrich(
                        &user_id,
                        &expert_id,
                        transcript.as_deref(),
                        conversation_id.as_deref(),
                    )
                    .await
                {
                    tracing::warn!(
                        user_id = %user_id,
                        expert_id = %expert_id,
                        error = %e,
                        "Memory enrichment failed"
                    );
                }
            });
        }
        Ok(memory)
    }

    /// Extract key points from a counted call and merge them into the memory.
    ///
    /// `transcript` wins over `conversation_id`. Returns `None` when there was
    /// nothing to extract or the model never produced a usable answer.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the memory cannot be read or written.
    pub async fn enrich(
        &self,
        user_id: &UserId,
        expert_id: &ExpertId,
        transcript: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<Option<ConversationMemory>> {
        let transcript = match transcript {
            Some(text) => Some(text.to_string()),
            None => self.fetch_transcript(conversation_id).await,
        };
        let Some(text) = transcript
            .as_deref()
            .map(str::trim)
            .filter(|t| t.len() >= MIN_TRANSCRIPT_CHARS)
        else {
            return Ok(None);
        };

        let known = self
            .store
            .get_memory(user_id, expert_id)
            .await?
            .map(|m| m.key_points)
            .unwrap_or_default();
        let Some(extraction) = self.extract(text, &known).await else {
            return Ok(None);
        };

        let offered = extraction.key_points.len();
        let memory = self
            .store
            .upsert_memory(
                user_id,
                expert_id,
                MemoryUpdate::follow_up(extraction.key_points, extraction.summary),
                Utc::now(),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            expert_id = %expert_id,
            offered_points = offered,
            key_points = memory.key_points.len(),
            "Memory enriched"
        );
        Ok(Some(memory))
    }

    async fn fetch_transcript(&self, conversation_id: Option<&str>) -> Option<String> {
        let (voice, id) = (self.voice.as_ref()?, conversation_id?);
        match voice.transcript(id).await {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(conversation_id = id, error = %e, "Transcript fetch failed");
                None
            }
        }
    }

    async fn extract(&self, transcript: &str, known: &[String]) -> Option<Extraction> {
        let provider = self.provider.as_ref()?;

        let mut user = String::new();
        if !known.is_empty() {
            user.push_str("Known facts:\n");
            for point in known {
                user.push_str("- ");
                user.push_str(point);
                user.push('\n');
            }
            user.push('\n');
        }
        user.push_str("Transcript:\n");
        user.push_str(transcript);
        let turns = vec![ChatTurn::system(EXTRACTION_PROMPT), ChatTurn::user(user)];

        for attempt in 1..=EXTRACTION_ATTEMPTS {
            let value = match provider.complete_json(turns.clone()).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "Memory extraction failed");
                    continue;
                }
            };
            match serde_json::from_value::<Extraction>(value) {
                Ok(extraction) => return Some(extraction),
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "Memory extraction malformed");
                }
            }
        }
        None
    }
}
