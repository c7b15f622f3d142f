//! Column families used by the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Credit balances, keyed by `user_id`.
    pub const BALANCES: &str = "balances";

    /// Wallet transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Processed payments, keyed by the provider transaction id.
    pub const PAYMENT_GRANTS: &str = "payment_grants";

    /// Subscriptions, keyed by `user_id`.
    pub const SUBSCRIPTIONS: &str = "subscriptions";

    /// Rate table rows, keyed by tier name.
    pub const PLANS: &str = "plans";

    /// Expert profiles, keyed by `expert_id`.
    pub const EXPERTS: &str = "experts";

    /// Consultations, keyed by `consultation_id`.
    pub const CONSULTATIONS: &str = "consultations";

    /// Index: consultations by participant, keyed by `user_id || consultation_id`.
    pub const CONSULTATIONS_BY_USER: &str = "consultations_by_user";

    /// Messages, keyed by `consultation_id || seq` (big-endian).
    pub const MESSAGES: &str = "messages";

    /// Relationship memory, keyed by `user_id || expert_id`.
    pub const MEMORIES: &str = "memories";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BALANCES,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::PAYMENT_GRANTS,
        cf::SUBSCRIPTIONS,
        cf::PLANS,
        cf::EXPERTS,
        cf::CONSULTATIONS,
        cf::CONSULTATIONS_BY_USER,
        cf::MESSAGES,
        cf::MEMORIES,
    ]
}
