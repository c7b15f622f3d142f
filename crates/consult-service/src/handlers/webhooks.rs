//! Webhook handlers for the payment collaborator and the voice provider.
//!
//! Every endpoint takes the raw body so the `x-signature` header
//! (`t=<unix>,v1=<hex hmac-sha256 of "{t}.{body}">`) can be checked before parsing.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use consult_core::{
    BillingError, CallId, PaymentGrant, PlanTier, Subscription, SubscriptionStatus,
    TransactionKind,
};

use crate::crypto::verify_signature;
use crate::error::ApiError;
use crate::meter::{CallNotes, CallSummary};
use crate::state::AppState;

/// Signature header name.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was processed.
    pub received: bool,
    /// Credits granted by this delivery.
    pub credits_granted: i64,
}

fn verify(
    secret: Option<&str>,
    source: &'static str,
    headers: &HeaderMap,
    body: &str,
) -> Result<(), ApiError> {
    let Some(secret) = secret else {
        tracing::warn!(
            source = source,
            "Webhook secret not configured - skipping signature verification"
        );
        return Ok(());
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing webhook signature".into()))?;

    verify_signature(secret, signature, body, Utc::now().timestamp()).map_err(|e| {
        tracing::warn!(source = source, error = %e, "Invalid webhook signature");
        ApiError::BadRequest("Invalid webhook signature".into())
    })
}

fn verify_payment(state: &AppState, headers: &HeaderMap, body: &str) -> Result<(), ApiError> {
    verify(
        state.config.payment_webhook_secret.as_deref(),
        "payments",
        headers,
        body,
    )
}

// ============================================================================
// Payments
// ============================================================================

/// Confirmed purchase of a credit product.
#[derive(Debug, Deserialize)]
pub struct PaymentWebhook {
    /// Purchased product.
    pub product_id: String,
    /// Provider transaction id, unique per purchase.
    pub transaction_id: String,
    /// The buyer.
    pub user_id: String,
}

/// Credit a confirmed purchase exactly once.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    verify_payment(&state, &headers, &body)?;

    let webhook: PaymentWebhook =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        product_id = %webhook.product_id,
        transaction_id = %webhook.transaction_id,
        user_id = %webhook.user_id,
        "Received payment webhook"
    );

    let user_id = webhook
        .user_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid user_id: {}", webhook.user_id)))?;
    let credits = state
        .config
        .pricing
        .product_credits(&webhook.product_id)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown product: {}", webhook.product_id)))?;
    if webhook.transaction_id.trim().is_empty() {
        return Err(ApiError::BadRequest("transaction_id must not be empty".into()));
    }

    state
        .ledger
        .record_payment(&PaymentGrant {
            transaction_id: webhook.transaction_id,
            product_id: webhook.product_id,
            user_id,
            credits,
            processed_at: Utc::now(),
        })
        .await?;

    Ok(Json(WebhookResponse {
        received: true,
        credits_granted: credits,
    }))
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Subscription state change.
#[derive(Debug, Deserialize)]
pub struct SubscriptionWebhook {
    /// The subscriber.
    pub user_id: String,
    /// Subscribed tier.
    pub tier: PlanTier,
    /// New status.
    pub status: SubscriptionStatus,
    /// End of the current billing period.
    pub current_period_end: DateTime<Utc>,
}

/// Update the subscription row and grant the plan's monthly credits when a
/// period starts.
///
/// A period starts when the subscription becomes active or its period end moves
/// forward; redelivering the same state grants nothing.
pub async fn subscription_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    verify_payment(&state, &headers, &body)?;

    let webhook: SubscriptionWebhook =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let user_id = webhook
        .user_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid user_id: {}", webhook.user_id)))?;

    tracing::info!(
        user_id = %user_id,
        tier = webhook.tier.as_str(),
        status = webhook.status.as_str(),
        "Received subscription webhook"
    );

    let previous = state.store.get_subscription(&user_id).await?;
    let new_period = webhook.status == SubscriptionStatus::Active
        && previous.as_ref().map_or(true, |prev| {
            !prev.is_active()
                || prev.tier != webhook.tier
                || webhook.current_period_end > prev.current_period_end
        });

    state
        .store
        .put_subscription(&Subscription {
            user_id,
            tier: webhook.tier,
            status: webhook.status,
            current_period_end: webhook.current_period_end,
            updated_at: Utc::now(),
        })
        .await?;

    let mut credits_granted = 0;
    if new_period {
        let plan = state.rates.plan(webhook.tier).await?;
        if plan.monthly_grant > 0 {
            state
                .ledger
                .grant(
                    &user_id,
                    plan.monthly_grant,
                    TransactionKind::SubscriptionGrant,
                    &format!("{} plan monthly credits", webhook.tier.as_str()),
                )
                .await?;
            credits_granted = plan.monthly_grant;
        }
    }

    Ok(Json(WebhookResponse {
        received: true,
        credits_granted,
    }))
}

// ============================================================================
// Voice
// ============================================================================

/// Call lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceEvent {
    /// The conversation ended on the provider side.
    Disconnected,
    /// The conversation failed and will not resume.
    Failed,
    /// Anything else; acknowledged and ignored.
    #[serde(other)]
    Other,
}

/// Call event from the voice provider.
#[derive(Debug, Deserialize)]
pub struct VoiceWebhook {
    /// What happened.
    pub event: VoiceEvent,
    /// Call id, when the client passed it to the provider.
    #[serde(default)]
    pub call_id: Option<String>,
    /// Provider conversation id.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Transcript, when the provider includes it.
    #[serde(default)]
    pub transcript: Option<String>,
}

/// Voice webhook response.
#[derive(Debug, Serialize)]
pub struct VoiceWebhookResponse {
    /// Whether the webhook was processed.
    pub received: bool,
    /// The call this delivery ended, if it was still live.
    pub ended: Option<CallSummary>,
}

/// End a live call the voice provider reports as over.
///
/// Deliveries for calls that already ended are acknowledged without effect, so
/// redelivery never bills twice.
pub async fn voice_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<VoiceWebhookResponse>, ApiError> {
    verify(
        state.config.voice_webhook_secret.as_deref(),
        "voice",
        &headers,
        &body,
    )?;

    let webhook: VoiceWebhook =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        event = ?webhook.event,
        call_id = ?webhook.call_id,
        conversation_id = ?webhook.conversation_id,
        "Received voice webhook"
    );

    if webhook.event == VoiceEvent::Other {
        return Ok(Json(VoiceWebhookResponse {
            received: true,
            ended: None,
        }));
    }

    let call_id: Option<CallId> = webhook
        .call_id
        .as_deref()
        .map(|raw| {
            raw.parse()
                .map_err(|_| ApiError::BadRequest(format!("Invalid call_id: {raw}")))
        })
        .transpose()?;
    if call_id.is_none() && webhook.conversation_id.is_none() {
        return Err(ApiError::BadRequest(
            "call_id or conversation_id is required".into(),
        ));
    }

    let notes = CallNotes {
        transcript: webhook.transcript,
        conversation_id: webhook.conversation_id.clone(),
    };
    let ended = match state
        .calls
        .disconnected(call_id.as_ref(), webhook.conversation_id.as_deref(), notes)
        .await
    {
        Ok(summary) => Some(summary),
        Err(BillingError::NotFound { .. }) => {
            tracing::debug!("Voice webhook for a call that is no longer live");
            None
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(VoiceWebhookResponse {
        received: true,
        ended,
    }))
}
