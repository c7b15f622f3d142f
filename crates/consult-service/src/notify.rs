//! Recipient notifications.
//!
//! Delivery is best effort: callers log failures and carry on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use consult_core::UserId;

/// Notification failures.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The push endpoint rejected the notification.
    #[error("push rejected ({status})")]
    Rejected {
        /// HTTP status.
        status: u16,
    },

    /// Client construction failed.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// A notification for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Who should be alerted.
    pub recipient: UserId,
    /// Short title.
    pub title: String,
    /// Body text.
    pub body: String,
}

/// Delivers notifications to users who are not watching the conversation.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one notification.
    ///
    /// # Errors
    ///
    /// Returns the delivery failure; callers treat it as non-fatal.
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Notifier used when no push endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        tracing::debug!(recipient = %notification.recipient, "Push not configured, dropping notification");
        Ok(())
    }
}

/// Posts notifications to an HTTP push collaborator.
#[derive(Debug, Clone)]
pub struct PushNotifier {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl PushNotifier {
    /// Create a notifier posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(url: &str, api_key: Option<String>) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            url: url.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Notifier for PushNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(&notification);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn push_posts_payload() {
        let server = MockServer::start().await;
        let recipient = UserId::generate();
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer push-key"))
            .and(body_partial_json(serde_json::json!({
                "recipient": recipient.to_string(),
                "title": "New message"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = PushNotifier::new(&server.uri(), Some("push-key".into())).unwrap();
        notifier
            .notify(Notification {
                recipient,
                title: "New message".into(),
                body: "Mira: hello".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_push_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = PushNotifier::new(&server.uri(), None).unwrap();
        let result = notifier
            .notify(Notification {
                recipient: UserId::generate(),
                title: "t".into(),
                body: "b".into(),
            })
            .await;
        assert!(matches!(result, Err(NotifyError::Rejected { status: 500 })));
    }
}
