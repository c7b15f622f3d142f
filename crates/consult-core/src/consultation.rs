//! Consultation lifecycle types.
//!
//! A consultation is a persisted engagement between a seeker and a human expert. Its
//! status only ever moves forward: `waiting -> active -> completed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BillingError, Result};
use crate::{ConsultationId, ExpertId, UserId};

/// Lifecycle state of a consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    /// Created, no message exchanged yet.
    Waiting,
    /// At least one message was sent.
    Active,
    /// Ended by either party. Terminal.
    Completed,
}

impl ConsultationStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 3] = [Self::Waiting, Self::Active, Self::Completed];

    /// Whether `self -> next` is a legal forward transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Waiting, Self::Active | Self::Completed) | (Self::Active, Self::Completed) => {
                true
            }
            (Self::Waiting, Self::Waiting)
            | (Self::Active, Self::Waiting | Self::Active)
            | (Self::Completed, _) => false,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    /// Parse a stored status name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for ConsultationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a consultation a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// The paying user who asked for the consultation.
    Seeker,
    /// The human expert (through their linked account).
    Expert,
}

impl Party {
    /// The other side.
    #[must_use]
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Seeker => Self::Expert,
            Self::Expert => Self::Seeker,
        }
    }
}

/// A seeker/expert engagement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consultation {
    /// Unique id.
    pub id: ConsultationId,
    /// The seeker.
    pub seeker: UserId,
    /// The expert profile.
    pub expert: ExpertId,
    /// The expert's linked user account, resolved when the row was created.
    pub expert_user: UserId,
    /// Current lifecycle state.
    pub status: ConsultationStatus,
    /// What the seeker wants to talk about.
    pub concern: String,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the first message flipped it to active.
    pub started_at: Option<DateTime<Utc>>,
    /// When it was completed.
    pub ended_at: Option<DateTime<Utc>>,
    /// Seeker's read marker.
    pub last_read_at_seeker: Option<DateTime<Utc>>,
    /// Expert's read marker.
    pub last_read_at_expert: Option<DateTime<Utc>>,
}

impl Consultation {
    /// Create a consultation in the `waiting` state.
    #[must_use]
    pub fn new(
        seeker: UserId,
        expert: ExpertId,
        expert_user: UserId,
        concern: impl Into<String>,
    ) -> Self {
        Self {
            id: ConsultationId::generate(),
            seeker,
            expert,
            expert_user,
            status: ConsultationStatus::Waiting,
            concern: concern.into(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            last_read_at_seeker: None,
            last_read_at_expert: None,
        }
    }

    /// The party `user` plays in this consultation, if any.
    #[must_use]
    pub fn party_of(&self, user: &UserId) -> Option<Party> {
        if *user == self.seeker {
            Some(Party::Seeker)
        } else if *user == self.expert_user {
            Some(Party::Expert)
        } else {
            None
        }
    }

    /// Like [`Self::party_of`] but failing with `NotParticipant`.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::NotParticipant` for outsiders.
    pub fn require_party(&self, user: &UserId) -> Result<Party> {
        self.party_of(user)
            .ok_or_else(|| BillingError::NotParticipant {
                user_id: user.to_string(),
            })
    }

    /// The user account behind a party.
    #[must_use]
    pub const fn user_of(&self, party: Party) -> UserId {
        match party {
            Party::Seeker => self.seeker,
            Party::Expert => self.expert_user,
        }
    }

    /// The read marker of a party.
    #[must_use]
    pub const fn read_marker(&self, party: Party) -> Option<DateTime<Utc>> {
        match party {
            Party::Seeker => self.last_read_at_seeker,
            Party::Expert => self.last_read_at_expert,
        }
    }

    /// Move a party's read marker forward to `at`. Never moves it backwards.
    pub fn mark_read(&mut self, party: Party, at: DateTime<Utc>) {
        let marker = match party {
            Party::Seeker => &mut self.last_read_at_seeker,
            Party::Expert => &mut self.last_read_at_expert,
        };
        *marker = Some(marker.map_or(at, |current| current.max(at)));
    }

    /// Apply a forward transition, stamping the matching timestamp.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::TransitionRejected` when the move is not forward.
    pub fn transition(&mut self, next: ConsultationStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BillingError::TransitionRejected {
                from: self.status,
                to: next,
            });
        }

        match next {
            ConsultationStatus::Active => self.started_at = Some(at),
            ConsultationStatus::Completed => self.ended_at = Some(at),
            ConsultationStatus::Waiting => {}
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Consultation {
        Consultation::new(
            UserId::generate(),
            ExpertId::generate(),
            UserId::generate(),
            "career",
        )
    }

    #[test]
    fn forward_transitions_only() {
        use ConsultationStatus::{Active, Completed, Waiting};
        assert!(Waiting.can_transition_to(Active));
        assert!(Waiting.can_transition_to(Completed));
        assert!(Active.can_transition_to(Completed));

        assert!(!Active.can_transition_to(Waiting));
        assert!(!Active.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Waiting));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut c = sample();
        let started = Utc::now();
        c.transition(ConsultationStatus::Active, started).unwrap();
        assert_eq!(c.started_at, Some(started));

        let ended = Utc::now();
        c.transition(ConsultationStatus::Completed, ended).unwrap();
        assert_eq!(c.ended_at, Some(ended));
        assert!(c.status.is_terminal());
    }

    #[test]
    fn completed_is_terminal() {
        let mut c = sample();
        c.transition(ConsultationStatus::Completed, Utc::now()).unwrap();

        let err = c
            .transition(ConsultationStatus::Active, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::TransitionRejected {
                from: ConsultationStatus::Completed,
                to: ConsultationStatus::Active
            }
        ));
        assert!(c.started_at.is_none());
    }

    #[test]
    fn parties_resolve() {
        let c = sample();
        assert_eq!(c.party_of(&c.seeker), Some(Party::Seeker));
        assert_eq!(c.party_of(&c.expert_user), Some(Party::Expert));
        assert!(c.party_of(&UserId::generate()).is_none());
        assert!(c.require_party(&UserId::generate()).is_err());
        assert_eq!(c.user_of(Party::Seeker.counterpart()), c.expert_user);
    }

    #[test]
    fn read_marker_never_moves_back() {
        let mut c = sample();
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(30);

        c.mark_read(Party::Expert, later);
        c.mark_read(Party::Expert, earlier);
        assert_eq!(c.read_marker(Party::Expert), Some(later));
        assert!(c.read_marker(Party::Seeker).is_none());
    }
}
