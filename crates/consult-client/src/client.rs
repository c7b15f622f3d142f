//! Consultation service HTTP client.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

use consult_core::{ConversationMemory, Rates};

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, BalanceResponse, CallConnectedResponse, CallTicket, ConsultationResponse,
    ConsultationsResponse, EndCallRequest, EndCallResponse, MessageResponse, MessagesResponse,
    OpenConsultationRequest, SendMessageRequest, StartCallRequest, TransactionsResponse,
    UnreadResponse,
};

/// Consultation API client acting for one signed-in user.
#[derive(Debug, Clone)]
pub struct ConsultClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ConsultClient {
    /// Create a client for `base_url` authenticating with a user JWT.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, token, &ClientOptions::default())
    }

    /// Create a client with custom options.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] if the HTTP client cannot be built.
    pub fn with_options(
        base_url: impl Into<String>,
        token: impl Into<String>,
        options: &ClientOptions,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{path}", self.base_url)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(&self.token)
    }

    // ========================================================================
    // Wallet
    // ========================================================================

    /// Current balance and tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn balance(&self) -> Result<BalanceResponse, ClientError> {
        self.send(self.get("/credits/balance")).await
    }

    /// A page of wallet transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn transactions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<TransactionsResponse, ClientError> {
        let request = self
            .get("/credits/transactions")
            .query(&[("limit", limit), ("offset", offset)]);
        self.send(request).await
    }

    /// Rates the caller is currently priced at.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn rates(&self) -> Result<Rates, ClientError> {
        self.send(self.get("/rates")).await
    }

    // ========================================================================
    // Consultations
    // ========================================================================

    /// Open a consultation with a human expert, or get the open one.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn open_consultation(
        &self,
        expert_id: &str,
        concern: &str,
    ) -> Result<ConsultationResponse, ClientError> {
        let request = self.post("/consultations").json(&OpenConsultationRequest {
            expert_id,
            concern,
        });
        self.send(request).await
    }

    /// The caller's consultations with unread counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn consultations(&self) -> Result<ConsultationsResponse, ClientError> {
        self.send(self.get("/consultations")).await
    }

    /// Complete a consultation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn end_consultation(&self, id: &str) -> Result<ConsultationResponse, ClientError> {
        self.send(self.post(&format!("/consultations/{id}/end")))
            .await
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn send_message(
        &self,
        id: &str,
        content: &str,
    ) -> Result<MessageResponse, ClientError> {
        let request = self
            .post(&format!("/consultations/{id}/messages"))
            .json(&SendMessageRequest { content });
        self.send(request).await
    }

    /// Messages in send order, optionally only those after `after_seq`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn messages(
        &self,
        id: &str,
        after_seq: Option<u64>,
    ) -> Result<MessagesResponse, ClientError> {
        let mut request = self.get(&format!("/consultations/{id}/messages"));
        if let Some(seq) = after_seq {
            request = request.query(&[("after_seq", seq)]);
        }
        self.send(request).await
    }

    /// Mark everything read for the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn mark_read(&self, id: &str) -> Result<UnreadResponse, ClientError> {
        self.send(self.post(&format!("/consultations/{id}/read")))
            .await
    }

    /// The caller's unread count.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn unread(&self, id: &str) -> Result<UnreadResponse, ClientError> {
        self.send(self.get(&format!("/consultations/{id}/unread")))
            .await
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Start a metered call with an expert.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AdmissionDenied`] when the wallet cannot cover the
    /// first minute, or another error if the request fails.
    pub async fn start_call(&self, expert_id: &str) -> Result<CallTicket, ClientError> {
        let request = self.post("/calls").json(&StartCallRequest { expert_id });
        self.send(request).await
    }

    /// Report that the voice session connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn call_connected(&self, call_id: &str) -> Result<CallConnectedResponse, ClientError> {
        self.send(self.post(&format!("/calls/{call_id}/connected")))
            .await
    }

    /// End a call and settle it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn end_call(
        &self,
        call_id: &str,
        request: &EndCallRequest,
    ) -> Result<EndCallResponse, ClientError> {
        let request = self.post(&format!("/calls/{call_id}/end")).json(request);
        self.send(request).await
    }

    /// Relationship memory with an expert.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn memory(&self, expert_id: &str) -> Result<ConversationMemory, ClientError> {
        self.send(self.get(&format!("/memory/{expert_id}"))).await
    }

    // ========================================================================
    // Response handling
    // ========================================================================

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    /// Decode a success body or map the service's error body to a typed error.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            let bytes = response.bytes().await?;
            return Ok(serde_json::from_slice(&bytes)?);
        }

        let Ok(api_error) = response.json::<ApiErrorResponse>().await else {
            return Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
            });
        };

        let code = api_error.error.code.as_str();
        let message = api_error.error.message;
        tracing::debug!(status = status.as_u16(), code = code, "Consultation API error");

        let detail = |key: &str| {
            api_error
                .error
                .details
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0)
        };

        match code {
            "admission_denied" => Err(ClientError::AdmissionDenied {
                balance: detail("balance"),
                required: detail("required"),
            }),
            "forbidden" => Err(ClientError::Forbidden { message }),
            "not_found" => Err(ClientError::NotFound { message }),
            "conflict" => Err(ClientError::Conflict { message }),
            "external_unavailable" => Err(ClientError::Unavailable { message }),
            _ => Err(ClientError::Api {
                code: code.to_string(),
                message,
                status: status.as_u16(),
            }),
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
        }
    }
}
