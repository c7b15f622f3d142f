//! HTTP client for the voice provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{VoiceError, VoiceProvider, VoiceSession};

/// Voice provider client.
#[derive(Debug, Clone)]
pub struct VoiceClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ConversationResponse {
    #[serde(default)]
    transcript: Vec<TranscriptTurn>,
}

#[derive(Debug, Deserialize)]
struct TranscriptTurn {
    role: String,
    #[serde(default)]
    message: Option<String>,
}

impl VoiceClient {
    /// Create a new voice client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, VoiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, VoiceError> {
        let status = response.status();

        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %message, "Voice API error");
            Err(VoiceError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl VoiceProvider for VoiceClient {
    async fn session_token(&self, agent_id: &str) -> Result<VoiceSession, VoiceError> {
        let url = format!("{}/v1/convai/conversation/token", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&serde_json::json!({ "agent_id": agent_id }))
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn transcript(&self, conversation_id: &str) -> Result<String, VoiceError> {
        let url = format!("{}/v1/convai/conversations/{conversation_id}", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("xi-api-key", &self.api_key)
            .send()
            .await?;

        let conversation: ConversationResponse = self.handle_response(response).await?;
        Ok(render_transcript(&conversation.transcript))
    }
}

fn render_transcript(turns: &[TranscriptTurn]) -> String {
    turns
        .iter()
        .filter_map(|turn| {
            let text = turn.message.as_deref()?.trim();
            (!text.is_empty()).then(|| format!("{}: {text}", turn.role))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn session_token_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/convai/conversation/token"))
            .and(header("xi-api-key", "voice-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token": "tok_123",
                "conversation_id": "conv_1"
            })))
            .mount(&server)
            .await;

        let client = VoiceClient::new(&server.uri(), "voice-key").unwrap();
        let session = client.session_token("agent_1").await.unwrap();
        assert_eq!(session.token, "tok_123");
        assert_eq!(session.conversation_id.as_deref(), Some("conv_1"));
    }

    #[tokio::test]
    async fn transcript_is_rendered_as_lines() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/convai/conversations/conv_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transcript": [
                    { "role": "user", "message": "Will I move abroad?" },
                    { "role": "agent", "message": null },
                    { "role": "agent", "message": "Jupiter favours travel this year." }
                ]
            })))
            .mount(&server)
            .await;

        let client = VoiceClient::new(&server.uri(), "voice-key").unwrap();
        let transcript = client.transcript("conv_1").await.unwrap();
        assert_eq!(
            transcript,
            "user: Will I move abroad?\nagent: Jupiter favours travel this year."
        );
    }

    #[tokio::test]
    async fn api_errors_carry_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such conversation"))
            .mount(&server)
            .await;

        let client = VoiceClient::new(&server.uri(), "voice-key").unwrap();
        assert!(matches!(
            client.transcript("missing").await,
            Err(VoiceError::Api { status: 404, .. })
        ));
    }
}
