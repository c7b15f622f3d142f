//! Common test utilities for consult-service integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::TestServer;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};

use consult_core::{Expert, ExpertId, ExpertKind, TransactionKind, UserId};
use consult_service::auth::JwtClaims;
use consult_service::crypto::sign_payload;
use consult_service::provider::{ChatProvider, OpenAiClient};
use consult_service::{create_router, AppState, Providers, ServiceConfig};
use consult_store::{MemoryStore, Store};

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const AUDIENCE: &str = "consult";
pub const ADMIN_KEY: &str = "test-admin-key";
pub const SERVICE_KEY: &str = "test-service-key";
pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The shared state, for seeding data behind the API.
    pub state: AppState,
    /// The backing store.
    pub store: Arc<MemoryStore>,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
}

impl TestHarness {
    /// Create a new test harness with a fresh in-memory store and no providers.
    pub fn new() -> Self {
        Self::with_providers(Providers::none())
    }

    /// Create a harness whose chat provider points at `ai_base_url`.
    pub fn with_ai(ai_base_url: &str) -> Self {
        let client = OpenAiClient::new(ai_base_url, "test-ai-key", "test-model")
            .expect("Failed to create chat client");
        let mut providers = Providers::none();
        providers.chat = Some(Arc::new(client) as Arc<dyn ChatProvider>);
        Self::with_providers(providers)
    }

    /// Create a harness around explicit collaborators.
    pub fn with_providers(providers: Providers) -> Self {
        Self::with_config(providers, |_| {})
    }

    /// Create a harness around explicit collaborators and adjusted settings.
    pub fn with_config(providers: Providers, adjust: impl FnOnce(&mut ServiceConfig)) -> Self {
        let store = Arc::new(MemoryStore::new());

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            auth_jwt_secret: Some(JWT_SECRET.into()),
            auth_audience: AUDIENCE.into(),
            service_api_key: Some(SERVICE_KEY.into()),
            admin_api_key: Some(ADMIN_KEY.into()),
            payment_webhook_secret: Some(WEBHOOK_SECRET.into()),
            voice_webhook_secret: Some(WEBHOOK_SECRET.into()),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            call_connect_timeout_seconds: 30,
            ..ServiceConfig::default()
        };
        adjust(&mut config);

        let state = AppState::with_providers(store.clone(), config, providers);
        let router: Router = create_router(state.clone());

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            state,
            store,
            test_user_id: UserId::generate(),
        }
    }

    /// Authorization header name.
    pub fn auth_name() -> HeaderName {
        axum::http::header::AUTHORIZATION
    }

    /// Bearer header value for `user`.
    pub fn bearer(user: &UserId) -> HeaderValue {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            sub: user.to_string(),
            aud: AUDIENCE.into(),
            exp: now + 3600,
            iat: now,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("Failed to mint token");
        HeaderValue::from_str(&format!("Bearer {token}")).expect("Invalid header value")
    }

    /// Bearer header value for the default test user.
    pub fn user_auth_header(&self) -> HeaderValue {
        Self::bearer(&self.test_user_id)
    }

    /// Admin key header.
    pub fn admin_key_header() -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static("x-admin-key"),
            HeaderValue::from_static(ADMIN_KEY),
        )
    }

    /// Signature header for a webhook body.
    pub fn signature_header(body: &str) -> (HeaderName, HeaderValue) {
        let header = sign_payload(WEBHOOK_SECRET, Utc::now().timestamp(), body)
            .expect("Failed to sign payload");
        (
            HeaderName::from_static("x-signature"),
            HeaderValue::from_str(&header).expect("Invalid header value"),
        )
    }

    /// Give `user` credits directly through the ledger.
    pub async fn fund(&self, user: &UserId, amount: i64) {
        self.state
            .ledger
            .grant(user, amount, TransactionKind::Bonus, "test funding")
            .await
            .expect("Failed to fund user");
    }

    /// Balance of `user`.
    pub async fn balance(&self, user: &UserId) -> i64 {
        self.state.ledger.balance(user).await.expect("balance")
    }

    /// Register a human expert linked to a fresh account.
    pub async fn human_expert(&self) -> (Expert, UserId) {
        let account = UserId::generate();
        let expert = self
            .put_expert(ExpertKind::Human, Some(account), "Mira")
            .await;
        (expert, account)
    }

    /// Register an AI expert.
    pub async fn ai_expert(&self) -> Expert {
        self.put_expert(ExpertKind::Ai, None, "Luna").await
    }

    async fn put_expert(&self, kind: ExpertKind, linked_user: Option<UserId>, name: &str) -> Expert {
        let expert = Expert {
            id: ExpertId::generate(),
            display_name: name.into(),
            kind,
            linked_user,
            persona: None,
            voice_agent_id: None,
            created_at: Utc::now(),
        };
        self.store.put_expert(&expert).await.expect("put expert");
        expert
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
