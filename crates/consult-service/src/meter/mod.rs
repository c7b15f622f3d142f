//! Usage meters.
//!
//! Meters turn provider usage into ledger debits. Both admit the payer up front
//! and settle in detached tasks, so a client that disconnects mid-stream or
//! mid-call is still charged for what it consumed.

pub mod call;
pub mod chat;

pub use call::{CallMeter, CallNotes, CallSummary, CallTicket, EndReason};
pub use chat::{ChatMeter, MeteredStream};
