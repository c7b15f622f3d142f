//! Pricing configuration and charge arithmetic.
//!
//! This module defines the per-tier rate table and the two charge formulas the meters
//! use: chat usage units and call minutes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::account::{PlanTier, PREMIUM_PLAN_CREDITS, STANDARD_PLAN_CREDITS};

/// Markup applied on top of the raw provider cost for chat usage.
pub const DEFAULT_CHAT_MARKUP: f64 = 2.5;

/// Minimum charge for any metered chat exchange that reported usage.
pub const MIN_CHAT_CHARGE: i64 = 1;

/// Usage units per chat pricing unit.
pub const CHAT_UNITS_PER_PRICE_UNIT: f64 = 1000.0;

/// Free tier chat rate (credits per 1000 usage units).
pub const FREE_CHAT_CREDIT_PER_1K: f64 = 1.0;

/// Free tier call rate (credits per minute).
pub const FREE_CALL_CREDIT_PER_MINUTE: i64 = 12;

/// Tolerance absorbed before rounding up, so `3.0000000000000004` bills as 3.
const CEIL_EPSILON: f64 = 1e-9;

/// A row of the rate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    /// The tier this plan prices.
    pub tier: PlanTier,
    /// Credits per 1000 chat usage units (before markup).
    pub chat_credit_per_1k_units: f64,
    /// Credits per call minute.
    pub call_credit_per_minute: i64,
    /// Credits granted at each renewal.
    pub monthly_grant: i64,
}

impl SubscriptionPlan {
    /// The built-in plan for a tier.
    #[must_use]
    pub fn default_for(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Free => Self {
                tier,
                chat_credit_per_1k_units: FREE_CHAT_CREDIT_PER_1K,
                call_credit_per_minute: FREE_CALL_CREDIT_PER_MINUTE,
                monthly_grant: 0,
            },
            PlanTier::Standard => Self {
                tier,
                chat_credit_per_1k_units: 0.8,
                call_credit_per_minute: 10,
                monthly_grant: STANDARD_PLAN_CREDITS,
            },
            PlanTier::Premium => Self {
                tier,
                chat_credit_per_1k_units: 0.6,
                call_credit_per_minute: 8,
                monthly_grant: PREMIUM_PLAN_CREDITS,
            },
        }
    }

    /// The rates this plan charges.
    #[must_use]
    pub fn rates(&self) -> Rates {
        Rates {
            tier: self.tier,
            chat_per_1k: self.chat_credit_per_1k_units,
            call_per_minute: self.call_credit_per_minute,
        }
    }
}

/// Resolved unit prices for a payer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    /// The tier the rates came from.
    pub tier: PlanTier,
    /// Credits per 1000 chat usage units.
    pub chat_per_1k: f64,
    /// Credits per call minute.
    pub call_per_minute: i64,
}

impl Rates {
    /// Free-tier fallback rates.
    #[must_use]
    pub fn free() -> Self {
        SubscriptionPlan::default_for(PlanTier::Free).rates()
    }
}

/// Pricing configuration for all billable activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Multiplier applied to raw chat cost.
    pub chat_markup: f64,

    /// Plan rows seeded into storage when missing.
    pub plans: Vec<SubscriptionPlan>,

    /// Credit packs sold through the store, keyed by product id.
    pub products: HashMap<String, i64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let products = [
            ("credits_100", 100),
            ("credits_500", 550),
            ("credits_1200", 1400),
        ]
        .into_iter()
        .map(|(id, credits)| (id.to_string(), credits))
        .collect();

        Self {
            chat_markup: DEFAULT_CHAT_MARKUP,
            plans: PlanTier::ALL
                .into_iter()
                .map(SubscriptionPlan::default_for)
                .collect(),
            products,
        }
    }
}

impl PricingConfig {
    /// Credits granted for a purchased product.
    #[must_use]
    pub fn product_credits(&self, product_id: &str) -> Option<i64> {
        self.products.get(product_id).copied()
    }

    /// The configured plan for a tier, or the built-in one.
    #[must_use]
    pub fn plan(&self, tier: PlanTier) -> SubscriptionPlan {
        self.plans
            .iter()
            .find(|p| p.tier == tier)
            .cloned()
            .unwrap_or_else(|| SubscriptionPlan::default_for(tier))
    }
}

/// Credits for a chat exchange: `ceil(max(1, units / 1000 * rate * markup))`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn chat_charge(units: u64, chat_per_1k: f64, markup: f64) -> i64 {
    let raw = units as f64 * chat_per_1k * markup / CHAT_UNITS_PER_PRICE_UNIT;
    let credits = (raw - CEIL_EPSILON).ceil();
    if credits.is_finite() && credits > 0.0 {
        (credits as i64).max(MIN_CHAT_CHARGE)
    } else {
        MIN_CHAT_CHARGE
    }
}

/// Minutes billed for a connected call: partial minutes round up.
#[must_use]
pub const fn billable_minutes(elapsed_seconds: u64) -> u64 {
    elapsed_seconds.div_ceil(60)
}

/// Credits for a connected call of `elapsed_seconds`.
#[must_use]
pub fn call_charge(elapsed_seconds: u64, call_per_minute: i64) -> i64 {
    i64::try_from(billable_minutes(elapsed_seconds))
        .unwrap_or(i64::MAX)
        .saturating_mul(call_per_minute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_charge_free_tier_example() {
        // 2300 units * 1/1k * 2.5 = 5.75 -> 6
        assert_eq!(chat_charge(2300, 1.0, DEFAULT_CHAT_MARKUP), 6);
    }

    #[test]
    fn chat_charge_has_floor_of_one() {
        assert_eq!(chat_charge(10, 1.0, DEFAULT_CHAT_MARKUP), 1);
        assert_eq!(chat_charge(0, 1.0, DEFAULT_CHAT_MARKUP), 1);
    }

    #[test]
    fn chat_charge_exact_multiples_do_not_round_up() {
        // 1200 * 2.5 / 1000 = 3 exactly, float noise must not bill 4
        assert_eq!(chat_charge(1200, 1.0, DEFAULT_CHAT_MARKUP), 3);
        assert_eq!(chat_charge(4000, 1.0, DEFAULT_CHAT_MARKUP), 10);
    }

    #[test]
    fn call_charge_rounds_partial_minutes_up() {
        assert_eq!(call_charge(90, 8), 16);
        assert_eq!(call_charge(60, 8), 8);
        assert_eq!(call_charge(61, 8), 16);
        assert_eq!(call_charge(1, 12), 12);
        assert_eq!(call_charge(0, 12), 0);
    }

    #[test]
    fn default_plans_cover_every_tier() {
        let config = PricingConfig::default();
        for tier in PlanTier::ALL {
            assert_eq!(config.plan(tier).tier, tier);
        }
        assert_eq!(config.plan(PlanTier::Free).rates(), Rates::free());
        assert!((config.chat_markup - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn paid_tiers_are_cheaper_per_minute() {
        let free = SubscriptionPlan::default_for(PlanTier::Free);
        let standard = SubscriptionPlan::default_for(PlanTier::Standard);
        let premium = SubscriptionPlan::default_for(PlanTier::Premium);
        assert!(free.call_credit_per_minute > standard.call_credit_per_minute);
        assert!(standard.call_credit_per_minute > premium.call_credit_per_minute);
    }

    #[test]
    fn product_catalogue_lookup() {
        let config = PricingConfig::default();
        assert_eq!(config.product_credits("credits_500"), Some(550));
        assert_eq!(config.product_credits("unknown"), None);
    }
}
