//! Expert profiles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::{ExpertId, UserId};

/// An expert a seeker can talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expert {
    /// Unique id.
    pub id: ExpertId,
    /// Name shown to seekers.
    pub display_name: String,
    /// AI persona or human astrologer.
    pub kind: ExpertKind,
    /// The user account a human expert signs in with.
    pub linked_user: Option<UserId>,
    /// System prompt for AI personas.
    pub persona: Option<String>,
    /// Voice provider agent used for calls.
    pub voice_agent_id: Option<String>,
    /// When the profile was created.
    pub created_at: DateTime<Utc>,
}

/// Expert kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertKind {
    /// Model-backed persona; no persisted consultation.
    Ai,
    /// Human astrologer reached through a consultation.
    Human,
}

impl ExpertKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Human => "human",
        }
    }

    /// Parse a stored kind name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ai" => Some(Self::Ai),
            "human" => Some(Self::Human),
            _ => None,
        }
    }
}

impl Expert {
    /// The account a consultation with this expert is routed to.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::ExpertUnresolved` for AI personas and for human experts
    /// without a linked account.
    pub fn consultable_user(&self) -> Result<UserId> {
        match (self.kind, self.linked_user) {
            (ExpertKind::Human, Some(user)) => Ok(user),
            _ => Err(BillingError::ExpertUnresolved {
                expert_id: self.id.to_string(),
            }),
        }
    }

    /// The system prompt used when this expert answers through the model.
    #[must_use]
    pub fn system_prompt(&self) -> String {
        self.persona.clone().unwrap_or_else(|| {
            format!(
                "You are {}, a warm and insightful astrologer. Answer the seeker's questions \
                 with care and keep replies concise.",
                self.display_name
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expert(kind: ExpertKind, linked_user: Option<UserId>) -> Expert {
        Expert {
            id: ExpertId::generate(),
            display_name: "Mira".into(),
            kind,
            linked_user,
            persona: None,
            voice_agent_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn human_with_account_is_consultable() {
        let user = UserId::generate();
        assert_eq!(
            expert(ExpertKind::Human, Some(user)).consultable_user().unwrap(),
            user
        );
    }

    #[test]
    fn unlinked_or_ai_experts_are_unresolved() {
        assert!(matches!(
            expert(ExpertKind::Human, None).consultable_user(),
            Err(BillingError::ExpertUnresolved { .. })
        ));
        assert!(matches!(
            expert(ExpertKind::Ai, Some(UserId::generate())).consultable_user(),
            Err(BillingError::ExpertUnresolved { .. })
        ));
    }

    #[test]
    fn default_prompt_uses_name() {
        assert!(expert(ExpertKind::Ai, None).system_prompt().contains("Mira"));
    }
}
