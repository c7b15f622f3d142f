//! Metered consultation HTTP API service.
//!
//! This crate wires the consultation engine behind an Axum router:
//!
//! - Credit balance, history and manual grants
//! - Consultations with human experts, with ordered live message fan-out
//! - Metered AI chat (SSE) and metered voice calls
//! - Relationship memory distilled from call transcripts
//! - Signed payment and subscription webhooks
//!
//! # Authentication
//!
//! 1. **User JWTs** (HS256, `AUTH_JWT_SECRET`) - for seekers and human experts
//! 2. **Admin / service API keys** - for operator endpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers are async for a uniform router signature

pub mod auth;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod lifecycle;
pub mod memory;
pub mod meter;
pub mod notify;
pub mod provider;
pub mod rates;
pub mod routes;
pub mod state;
pub mod voice;

pub use bus::MessageBus;
pub use config::ServiceConfig;
pub use error::ApiError;
pub use ledger::{Charge, CreditLedger};
pub use lifecycle::ConsultationLifecycle;
pub use memory::MemoryDistiller;
pub use meter::{CallMeter, ChatMeter};
pub use rates::RateTable;
pub use routes::create_router;
pub use state::{AppState, Providers};
