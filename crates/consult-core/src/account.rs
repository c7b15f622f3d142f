//! Balance and subscription types.
//!
//! A [`CreditBalance`] is the spendable wallet of a user. A [`Subscription`] records the
//! tier the user pays for, which the rate table resolves per-unit prices from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::UserId;

// ============================================================================
// Constants
// ============================================================================

/// Standard plan monthly credit grant.
pub const STANDARD_PLAN_CREDITS: i64 = 500;

/// Premium plan monthly credit grant.
pub const PREMIUM_PLAN_CREDITS: i64 = 1500;

/// The spendable credit balance of a user.
///
/// The balance is never negative: debits that exceed it are clamped to zero and the
/// uncovered part is reported as a shortfall on the audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// The owner.
    pub user_id: UserId,

    /// Current spendable credits.
    pub balance: i64,

    /// Lifetime credits added (grants, purchases, refunds). Never decreases.
    pub lifetime_earned: i64,

    /// Lifetime credits actually deducted. Never decreases.
    pub lifetime_used: i64,

    /// When the balance row was created.
    pub created_at: DateTime<Utc>,

    /// When the balance was last mutated.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of applying a signed delta to a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedDelta {
    /// The signed change that actually hit the balance.
    pub applied: i64,
    /// Debit credits that could not be covered (always `>= 0`).
    pub shortfall: i64,
}

impl CreditBalance {
    /// Create an empty balance.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            balance: 0,
            lifetime_earned: 0,
            lifetime_used: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the balance covers `amount`.
    #[must_use]
    pub fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    /// Apply a signed delta, flooring the balance at zero.
    pub fn apply_delta(&mut self, delta: i64, at: DateTime<Utc>) -> AppliedDelta {
        let outcome = if delta >= 0 {
            self.balance = self.balance.saturating_add(delta);
            self.lifetime_earned = self.lifetime_earned.saturating_add(delta);
            AppliedDelta {
                applied: delta,
                shortfall: 0,
            }
        } else {
            let requested = delta.saturating_neg();
            let covered = requested.min(self.balance.max(0));
            self.balance -= covered;
            self.lifetime_used = self.lifetime_used.saturating_add(covered);
            AppliedDelta {
                applied: -covered,
                shortfall: requested - covered,
            }
        };
        self.updated_at = at;
        outcome
    }
}

/// A subscription to a paid tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// The subscriber.
    pub user_id: UserId,

    /// The subscribed tier.
    pub tier: PlanTier,

    /// Current status of the subscription.
    pub status: SubscriptionStatus,

    /// End of the current billing period.
    pub current_period_end: DateTime<Utc>,

    /// When the subscription row was last written.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether this subscription currently grants its tier's rates.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

/// Subscription tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// No subscription: pay-as-you-go at list rates.
    Free,

    /// Standard plan: monthly grant and reduced rates.
    Standard,

    /// Premium plan: largest grant and lowest rates.
    Premium,
}

impl PlanTier {
    /// All tiers, cheapest first.
    pub const ALL: [Self; 3] = [Self::Free, Self::Standard, Self::Premium];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }

    /// Parse a tier name, as sent by the payment collaborator.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "standard" | "basic" => Some(Self::Standard),
            "premium" | "pro" => Some(Self::Premium),
            _ => None,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active.
    Active,

    /// Subscription was cancelled.
    Cancelled,

    /// Payment failed, subscription is past due.
    PastDue,
}

impl SubscriptionStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::PastDue => "past_due",
        }
    }

    /// Parse a status name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "active" => Some(Self::Active),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "past_due" => Some(Self::PastDue),
            _ => None,
        }
    }
}
