//! Core types for the metered consultation engine.
//!
//! This crate provides the foundational types shared by storage and the service:
//!
//! - **Identifiers**: `UserId`, `ExpertId`, `ConsultationId`, `TransactionId`, `MessageId`, `CallId`
//! - **Wallet**: `CreditBalance`, `WalletTransaction`, `LedgerEntry`, `TransactionKind`
//! - **Pricing**: `PricingConfig`, `SubscriptionPlan`, `Rates`, `chat_charge`, `call_charge`
//! - **Consultations**: `Consultation`, `ConsultationStatus`, `Party`, `Message`
//! - **Memory**: `ConversationMemory`, `MemoryUpdate`
//!
//! # Credits
//!
//! Credits are whole `i64` units. Balances never go below zero: usage already
//! rendered is reconciled by clamping, and admission checks happen up front.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod consultation;
pub mod credits;
pub mod error;
pub mod expert;
pub mod ids;
pub mod memory;
pub mod message;
pub mod pricing;
pub mod usage;

pub use account::{
    AppliedDelta, CreditBalance, PlanTier, Subscription, SubscriptionStatus,
    PREMIUM_PLAN_CREDITS, STANDARD_PLAN_CREDITS,
};
pub use consultation::{Consultation, ConsultationStatus, Party};
pub use credits::{LedgerEntry, PaymentGrant, TransactionKind, WalletTransaction};
pub use error::{BillingError, Result};
pub use expert::{Expert, ExpertKind};
pub use ids::{CallId, ConsultationId, ExpertId, IdError, MessageId, TransactionId, UserId};
pub use memory::{ConversationMemory, MemoryUpdate, MAX_KEY_POINTS};
pub use message::{unread_count, Message, MessageKind, NewMessage};
pub use pricing::{
    billable_minutes, call_charge, chat_charge, PricingConfig, Rates, SubscriptionPlan,
    DEFAULT_CHAT_MARKUP, MIN_CHAT_CHARGE,
};
pub use usage::{CallUsage, ChatUsage};
