//! HTTP request handlers.

// Allow precision loss for f64 rates in response bodies
#![allow(clippy::cast_precision_loss)]

pub mod calls;
pub mod chat;
pub mod consultations;
pub mod credits;
pub mod experts;
pub mod health;
pub mod memory;
pub mod webhooks;

use serde::Deserialize;

/// Default page size for list endpoints.
const fn default_limit() -> usize {
    50
}

/// Largest page a client may request.
const MAX_LIMIT: usize = 100;

/// Pagination query parameters.
#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    /// Maximum number of items to return (default: 50, max: 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Number of items to skip.
    #[serde(default)]
    pub offset: usize,
}

impl PaginationQuery {
    /// The requested limit, capped.
    #[must_use]
    pub fn capped_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIMIT)
    }
}
