//! Consultation service client SDK.
//!
//! A typed wrapper over the user-facing HTTP API: wallet, consultations,
//! messages, metered calls and relationship memory. Every request carries the
//! seeker's bearer token.
//!
//! # Example
//!
//! ```no_run
//! use consult_client::ConsultClient;
//!
//! # async fn example() -> Result<(), consult_client::ClientError> {
//! let client = ConsultClient::new("http://consult.internal:8080", "user-jwt")?;
//!
//! let wallet = client.balance().await?;
//! println!("{} credits on the {:?} tier", wallet.balance, wallet.tier);
//!
//! let consultation = client
//!     .open_consultation("01J9Z6Q5V8X3Y2W1T0S9R8Q7P6", "Career change")
//!     .await?;
//! client.send_message(&consultation.id, "Hello!").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, ConsultClient};
pub use error::ClientError;
pub use types::*;
