//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{calls, chat, consultations, credits, experts, health, memory, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Maximum concurrent long-lived connections (chat streams and live feeds).
const STREAM_MAX_CONCURRENT_REQUESTS: usize = 200;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Credits (user JWT)
/// - `GET /v1/credits/balance` - Balance and tier
/// - `GET /v1/credits/transactions` - Transaction history
/// - `GET /v1/rates` - Resolved rates
///
/// ## Consultations (participants)
/// - `POST /v1/consultations`, `GET /v1/consultations`
/// - `GET /v1/consultations/{id}`, `POST /v1/consultations/{id}/end`
/// - `GET|POST /v1/consultations/{id}/messages`
/// - `POST /v1/consultations/{id}/read`, `GET /v1/consultations/{id}/unread`
/// - `GET /v1/consultations/{id}/stream` - WebSocket live feed
///
/// ## Metered usage (user JWT)
/// - `POST /v1/chat` - AI chat, SSE response
/// - `POST /v1/calls`, `POST /v1/calls/{id}/connected`, `POST /v1/calls/{id}/end`
/// - `GET /v1/memory/{expert_id}`
///
/// ## Operators (admin or service API key)
/// - `POST /v1/credits/grant`
/// - `PUT /v1/experts/{id}`
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/payments`
/// - `POST /webhooks/subscriptions`
/// - `POST /webhooks/voice` - provider-side call end
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // Long-lived responses are kept out of the request timeout.
    let stream_routes = Router::new()
        .route("/chat", post(chat::chat))
        .route(
            "/consultations/:id/stream",
            get(consultations::stream_messages),
        )
        .layer(ConcurrencyLimitLayer::new(STREAM_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/credits/grant", post(credits::grant_credits))
        .route("/rates", get(credits::get_rates))
        // Consultations
        .route(
            "/consultations",
            post(consultations::open_consultation).get(consultations::list_consultations),
        )
        .route("/consultations/:id", get(consultations::get_consultation))
        .route(
            "/consultations/:id/end",
            post(consultations::end_consultation),
        )
        .route(
            "/consultations/:id/messages",
            get(consultations::list_messages).post(consultations::send_message),
        )
        .route("/consultations/:id/read", post(consultations::mark_read))
        .route("/consultations/:id/unread", get(consultations::unread_count))
        // Calls
        .route("/calls", post(calls::start_call))
        .route("/calls/:id/connected", post(calls::call_connected))
        .route("/calls/:id/end", post(calls::end_call))
        // Memory
        .route("/memory/:expert_id", get(memory::get_memory))
        // Experts
        .route("/experts/:id", put(experts::put_expert))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes.merge(stream_routes))
        // Webhooks (no rate limit - controlled by the collaborators)
        .route("/webhooks/payments", post(webhooks::payment_webhook))
        .route(
            "/webhooks/subscriptions",
            post(webhooks::subscription_webhook),
        )
        .route("/webhooks/voice", post(webhooks::voice_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
