//! Chat model provider.
//!
//! The provider speaks the OpenAI-compatible chat completions protocol: a streaming
//! mode that emits SSE chunks with a trailing `usage` object, and a non-streaming
//! JSON mode used for memory extraction.

mod client;
mod sse;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use consult_core::BillingError;

pub use client::OpenAiClient;
pub use sse::{ChatEvent, SseDecoder};

/// Errors from the chat provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response or an error payload inside the stream.
    #[error("upstream error ({status}): {message}")]
    Upstream {
        /// HTTP status (0 when reported mid-stream).
        status: u16,
        /// Upstream message.
        message: String,
    },

    /// A chunk could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Client construction failed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<ProviderError> for BillingError {
    fn from(err: ProviderError) -> Self {
        Self::ExternalUnavailable {
            service: "chat".to_string(),
            message: err.to_string(),
        }
    }
}

/// Role of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// The seeker.
    User,
    /// The model.
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who spoke.
    pub role: Role,
    /// What was said.
    pub content: String,
}

impl ChatTurn {
    /// A system turn.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// A user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Stream of decoded chat events.
///
/// Backed by a channel fed from a task reading the HTTP body; dropping the stream
/// stops that task and releases the connection.
pub struct ChatStream {
    rx: mpsc::Receiver<Result<ChatEvent, ProviderError>>,
}

impl ChatStream {
    /// Wrap a receiver.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Result<ChatEvent, ProviderError>>) -> Self {
        Self { rx }
    }
}

impl Stream for ChatStream {
    type Item = Result<ChatEvent, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A chat completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Start a streamed completion.
    ///
    /// # Errors
    ///
    /// Fails if the request cannot be sent or is rejected before streaming starts.
    async fn stream_chat(&self, messages: Vec<ChatTurn>) -> Result<ChatStream, ProviderError>;

    /// Request a single completion whose content is a JSON object.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or when the content is not JSON.
    async fn complete_json(
        &self,
        messages: Vec<ChatTurn>,
    ) -> Result<serde_json::Value, ProviderError>;
}
