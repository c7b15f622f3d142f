//! Chat message types and unread arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConsultationId, MessageId, UserId};

/// A chat turn inside a consultation. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id.
    pub id: MessageId,
    /// Owning consultation.
    pub consultation_id: ConsultationId,
    /// Per-consultation insertion counter, starting at 1.
    pub seq: u64,
    /// Author.
    pub sender: UserId,
    /// Body.
    pub content: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Insertion time (assigned by storage).
    pub created_at: DateTime<Utc>,
}

/// A message before storage has assigned its sequence and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Owning consultation.
    pub consultation_id: ConsultationId,
    /// Author.
    pub sender: UserId,
    /// Body.
    pub content: String,
    /// Message kind.
    pub kind: MessageKind,
}

impl NewMessage {
    /// Stamp the message with its position in the stream.
    #[must_use]
    pub fn into_message(self, seq: u64, created_at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::generate(),
            consultation_id: self.consultation_id,
            seq,
            sender: self.sender,
            content: self.content,
            kind: self.kind,
            created_at,
        }
    }
}

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text from a participant.
    #[default]
    Text,
    /// Generated notice (session started, ended, ...).
    System,
}

impl MessageKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
        }
    }

    /// Parse a stored kind name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "text" => Some(Self::Text),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Count messages `reader` has not seen.
///
/// A message is unread when it was sent by someone else after the reader's marker.
/// Without a marker every message from the other party counts.
#[must_use]
pub fn unread_count<'a>(
    messages: impl IntoIterator<Item = &'a Message>,
    reader: &UserId,
    last_read_at: Option<DateTime<Utc>>,
) -> usize {
    messages
        .into_iter()
        .filter(|m| m.sender != *reader)
        .filter(|m| last_read_at.map_or(true, |marker| m.created_at > marker))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(consultation: ConsultationId, sender: UserId, seq: u64, at: DateTime<Utc>) -> Message {
        NewMessage {
            consultation_id: consultation,
            sender,
            content: format!("m{seq}"),
            kind: MessageKind::Text,
        }
        .into_message(seq, at)
    }

    #[test]
    fn no_marker_counts_all_from_other_party() {
        let consultation = ConsultationId::generate();
        let seeker = UserId::generate();
        let expert = UserId::generate();
        let now = Utc::now();
        let messages = vec![
            message(consultation, seeker, 1, now),
            message(consultation, seeker, 2, now),
            message(consultation, seeker, 3, now),
            message(consultation, expert, 4, now),
        ];

        assert_eq!(unread_count(&messages, &expert, None), 3);
        assert_eq!(unread_count(&messages, &seeker, None), 1);
    }

    #[test]
    fn marker_excludes_older_messages() {
        let consultation = ConsultationId::generate();
        let seeker = UserId::generate();
        let expert = UserId::generate();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        let messages = vec![
            message(consultation, seeker, 1, t0),
            message(consultation, seeker, 2, t1),
        ];

        assert_eq!(unread_count(&messages, &expert, Some(t0)), 1);
        assert_eq!(unread_count(&messages, &expert, Some(t1)), 0);
    }

    #[test]
    fn kind_defaults_to_text() {
        assert_eq!(MessageKind::default(), MessageKind::Text);
        assert_eq!(MessageKind::from_name("system"), Some(MessageKind::System));
    }
}
