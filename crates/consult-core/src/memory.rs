//! Cross-session relationship memory.
//!
//! One [`ConversationMemory`] exists per (seeker, expert) pair. Each completed call
//! folds a [`MemoryUpdate`] into it: new key points are appended, the list is cut from
//! the oldest end, and the call counter increments. Follow-up updates carry what
//! was extracted after the call was already counted and never touch the counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ExpertId, UserId};

/// Maximum key points retained per relationship.
pub const MAX_KEY_POINTS: usize = 30;

/// Maximum new key points accepted from one call.
pub const MAX_NEW_POINTS_PER_CALL: usize = 8;

/// Maximum characters kept per key point.
pub const MAX_KEY_POINT_CHARS: usize = 200;

/// Durable facts about a seeker, scoped to one expert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMemory {
    /// The seeker.
    pub user_id: UserId,
    /// The expert.
    pub expert_id: ExpertId,
    /// Short facts, oldest first.
    pub key_points: Vec<String>,
    /// Latest short summary of the relationship.
    pub summary: String,
    /// Number of completed calls. Never decreases.
    pub total_calls: u32,
    /// When the most recent call ended.
    pub last_call_at: Option<DateTime<Utc>>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

/// What one finished call contributes to a memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUpdate {
    /// Candidate key points extracted from the transcript (may be empty).
    pub new_points: Vec<String>,
    /// Refreshed summary, if extraction produced one.
    pub summary: Option<String>,
    /// When the call ended.
    pub called_at: Option<DateTime<Utc>>,
    /// Enriches a call that was already counted.
    #[serde(default)]
    pub follow_up: bool,
}

impl MemoryUpdate {
    /// An update that only records that a call happened.
    #[must_use]
    pub fn call_only(called_at: DateTime<Utc>) -> Self {
        Self {
            new_points: Vec::new(),
            summary: None,
            called_at: Some(called_at),
            follow_up: false,
        }
    }

    /// Points and summary extracted after the call was recorded.
    #[must_use]
    pub fn follow_up(new_points: Vec<String>, summary: Option<String>) -> Self {
        Self {
            new_points,
            summary,
            called_at: None,
            follow_up: true,
        }
    }
}

impl ConversationMemory {
    /// An empty memory for a pair.
    #[must_use]
    pub fn new(user_id: UserId, expert_id: ExpertId) -> Self {
        Self {
            user_id,
            expert_id,
            key_points: Vec::new(),
            summary: String::new(),
            total_calls: 0,
            last_call_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Fold one call into the memory.
    ///
    /// Returns how many new key points were kept.
    pub fn absorb(&mut self, update: MemoryUpdate, at: DateTime<Utc>) -> usize {
        let fresh = self.fresh_points(update.new_points);
        let added = fresh.len();
        self.key_points.extend(fresh);
        if self.key_points.len() > MAX_KEY_POINTS {
            let overflow = self.key_points.len() - MAX_KEY_POINTS;
            self.key_points.drain(..overflow);
        }

        if let Some(summary) = update.summary.map(|s| s.trim().to_string()) {
            if !summary.is_empty() {
                self.summary = summary;
            }
        }

        if !update.follow_up {
            self.total_calls = self.total_calls.saturating_add(1);
            self.last_call_at = Some(update.called_at.unwrap_or(at));
        }
        self.updated_at = at;
        added
    }

    /// Render the memory as context for a persona prompt.
    ///
    /// Returns `None` for a relationship with no history yet.
    #[must_use]
    pub fn context_prompt(&self) -> Option<String> {
        if self.total_calls == 0 && self.key_points.is_empty() && self.summary.is_empty() {
            return None;
        }

        let mut out = format!(
            "You have spoken with this person {} time{} before.",
            self.total_calls,
            if self.total_calls == 1 { "" } else { "s" }
        );
        if !self.summary.is_empty() {
            out.push_str("\nSummary: ");
            out.push_str(&self.summary);
        }
        if !self.key_points.is_empty() {
            out.push_str("\nWhat you remember about them:");
            for point in &self.key_points {
                out.push_str("\n- ");
                out.push_str(point);
            }
        }
        Some(out)
    }

    fn fresh_points(&self, candidates: Vec<String>) -> Vec<String> {
        let mut seen: Vec<String> = self.key_points.iter().map(|p| normalize(p)).collect();
        let mut fresh = Vec::new();

        for candidate in candidates {
            if fresh.len() == MAX_NEW_POINTS_PER_CALL {
                break;
            }
            let point: String = candidate.trim().chars().take(MAX_KEY_POINT_CHARS).collect();
            if point.is_empty() {
                continue;
            }
            let key = normalize(&point);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            fresh.push(point);
        }
        fresh
    }
}

fn normalize(point: &str) -> String {
    point
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches('.')
        .to_lowercase()
}
