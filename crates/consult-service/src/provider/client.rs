//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::sse::{ChatEvent, SseDecoder};
use super::{ChatProvider, ChatStream, ChatTurn, ProviderError};

/// Buffered events between the body reader and the consumer.
const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    /// Create a client for `base_url` (for example `https://api.openai.com/v1`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        tracing::warn!(status = %status, body = %message, "Chat provider request failed");
        Err(ProviderError::Upstream {
            status: status.as_u16(),
            message,
        })
    }

    /// Read the body, decode SSE events and forward them until the consumer goes away.
    async fn process_stream(
        mut body: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
        tx: mpsc::Sender<Result<ChatEvent, ProviderError>>,
    ) {
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = body.next().await {
            let decoded = chunk.map_err(ProviderError::from).and_then(|c| decoder.push(&c));
            match decoded {
                Ok(events) => {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            // Receiver dropped, stop reading
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
            if decoder.is_done() {
                return;
            }
        }

        match decoder.finish() {
            Ok(events) => {
                for event in events {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
            }
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn stream_chat(&self, messages: Vec<ChatTurn>) -> Result<ChatStream, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(Self::process_stream(response.bytes_stream(), tx));

        Ok(ChatStream::new(rx))
    }

    async fn complete_json(&self, messages: Vec<ChatTurn>) -> Result<Value, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(60))
            .json(&body)
            .send()
            .await?;
        let json: Value = Self::check_status(response).await?.json().await?;

        parse_completion_json(&json)
    }
}

/// Pull the JSON object out of `choices[0].message.content`.
fn parse_completion_json(json: &Value) -> Result<Value, ProviderError> {
    let content = json
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::Decode("completion is missing message content".into()))?;

    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(trimmed)
        .map_err(|e| ProviderError::Decode(format!("completion content is not JSON: {e}")))
}
