//! Rate table lookups.

use std::sync::Arc;

use consult_core::{PlanTier, Rates, Result, Subscription, SubscriptionPlan, UserId};
use consult_store::Store;

/// Resolves what a payer is charged per chat unit and per call minute.
#[derive(Clone)]
pub struct RateTable {
    store: Arc<dyn Store>,
}

impl RateTable {
    /// Create a rate table over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Rates for `user_id`: the stored plan of an active subscription, otherwise
    /// the free tier.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn rate_for(&self, user_id: &UserId) -> Result<Rates> {
        match self.active_subscription(user_id).await? {
            Some(subscription) => Ok(self.plan(subscription.tier).await?.rates()),
            None => Ok(Rates::free()),
        }
    }

    /// The user's subscription if it is currently active.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn active_subscription(&self, user_id: &UserId) -> Result<Option<Subscription>> {
        Ok(self
            .store
            .get_subscription(user_id)
            .await?
            .filter(Subscription::is_active))
    }

    /// The stored plan for `tier`, falling back to the built-in one.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn plan(&self, tier: PlanTier) -> Result<SubscriptionPlan> {
        Ok(self
            .store
            .get_plan(tier)
            .await?
            .unwrap_or_else(|| SubscriptionPlan::default_for(tier)))
    }

    /// Store each plan whose tier has no row yet. Returns how many were written.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Storage` if the store fails.
    pub async fn seed_plans(&self, plans: &[SubscriptionPlan]) -> Result<usize> {
        let mut written = 0;
        for plan in plans {
            if self.store.get_plan(plan.tier).await?.is_none() {
                self.store.put_plan(plan).await?;
                written += 1;
            }
        }
        if written > 0 {
            tracing::info!(plans = written, "Seeded rate table");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use consult_core::SubscriptionStatus;
    use consult_store::MemoryStore;

    fn subscription(user_id: UserId, tier: PlanTier, status: SubscriptionStatus) -> Subscription {
        Subscription {
            user_id,
            tier,
            status,
            current_period_end: Utc::now() + Duration::days(30),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn no_subscription_is_free_tier() {
        let rates = RateTable::new(Arc::new(MemoryStore::new()));
        let resolved = rates.rate_for(&UserId::generate()).await.unwrap();
        assert_eq!(resolved, Rates::free());
        assert_eq!(resolved.call_per_minute, 12);
    }

    #[tokio::test]
    async fn active_subscription_uses_stored_plan() {
        let store = Arc::new(MemoryStore::new());
        let rates = RateTable::new(store.clone());
        let user = UserId::generate();

        let mut premium = SubscriptionPlan::default_for(PlanTier::Premium);
        premium.call_credit_per_minute = 7;
        store.put_plan(&premium).await.unwrap();
        store
            .put_subscription(&subscription(
                user,
                PlanTier::Premium,
                SubscriptionStatus::Active,
            ))
            .await
            .unwrap();

        let resolved = rates.rate_for(&user).await.unwrap();
        assert_eq!(resolved.tier, PlanTier::Premium);
        assert_eq!(resolved.call_per_minute, 7);
    }

    #[tokio::test]
    async fn missing_plan_row_falls_back_to_default() {
        let store = Arc::new(MemoryStore::new());
        let rates = RateTable::new(store.clone());
        let user = UserId::generate();
        store
            .put_subscription(&subscription(
                user,
                PlanTier::Standard,
                SubscriptionStatus::Active,
            ))
            .await
            .unwrap();

        let resolved = rates.rate_for(&user).await.unwrap();
        assert_eq!(resolved.call_per_minute, 10);
        assert!((resolved.chat_per_1k - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn lapsed_subscription_is_free_tier() {
        let store = Arc::new(MemoryStore::new());
        let rates = RateTable::new(store.clone());
        let user = UserId::generate();
        store
            .put_subscription(&subscription(
                user,
                PlanTier::Premium,
                SubscriptionStatus::PastDue,
            ))
            .await
            .unwrap();

        assert_eq!(rates.rate_for(&user).await.unwrap(), Rates::free());
    }

    #[tokio::test]
    async fn seeding_keeps_existing_rows() {
        let store = Arc::new(MemoryStore::new());
        let rates = RateTable::new(store.clone());

        let mut custom = SubscriptionPlan::default_for(PlanTier::Standard);
        custom.monthly_grant = 999;
        store.put_plan(&custom).await.unwrap();

        let defaults: Vec<_> = PlanTier::ALL
            .into_iter()
            .map(SubscriptionPlan::default_for)
            .collect();
        assert_eq!(rates.seed_plans(&defaults).await.unwrap(), 2);
        assert_eq!(
            rates.plan(PlanTier::Standard).await.unwrap().monthly_grant,
            999
        );
    }
}
