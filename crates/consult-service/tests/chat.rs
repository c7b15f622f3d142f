//! Metered AI chat integration tests.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::TestHarness;
use consult_core::UserId;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Saturn is \"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"moving on.\"}}]}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":1500,\"completion_tokens\":800,\"total_tokens\":2300}}\n\n",
    "data: [DONE]\n\n",
);

async fn mock_provider(body: &'static str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;
    server
}

/// Settlement runs detached from the response, so poll for it.
async fn wait_for_balance(harness: &TestHarness, user: &UserId, expected: i64) -> i64 {
    let mut balance = harness.balance(user).await;
    for _ in 0..100 {
        if balance == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        balance = harness.balance(user).await;
    }
    balance
}

#[tokio::test]
async fn chat_streams_deltas_and_charges_usage() {
    let provider = mock_provider(SSE_BODY).await;
    let harness = TestHarness::with_ai(&format!("{}/v1", provider.uri()));
    let expert = harness.ai_expert().await;
    harness.fund(&harness.test_user_id, 100).await;

    let response = harness
        .server
        .post("/v1/chat")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .json(&json!({
            "expert_id": expert.id.to_string(),
            "messages": [{"role": "user", "content": "What does Saturn mean for me?"}]
        }))
        .await;

    response.assert_status_ok();
    let text = response.text();
    assert!(text.contains("Saturn is "));
    assert!(text.contains("moving on."));
    assert!(text.contains("\"total_units\":2300"));
    assert!(text.contains("event: done"));

    // 2300 units at 1.0/1k with the 2.5 markup is 5.75, billed as 6.
    assert_eq!(wait_for_balance(&harness, &harness.test_user_id, 94).await, 94);

    let body: Value = harness
        .server
        .get("/v1/credits/transactions")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .await
        .json();
    let latest = &body["transactions"][0];
    assert_eq!(latest["kind"], "chat_usage");
    assert_eq!(latest["amount"], -6);
    assert_eq!(latest["metadata"]["total_units"], 2300);
}

#[tokio::test]
async fn chat_without_usage_is_free() {
    let provider = mock_provider(concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: [DONE]\n\n",
    ))
    .await;
    let harness = TestHarness::with_ai(&format!("{}/v1", provider.uri()));
    let expert = harness.ai_expert().await;
    harness.fund(&harness.test_user_id, 10).await;

    harness
        .server
        .post("/v1/chat")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .json(&json!({
            "expert_id": expert.id.to_string(),
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .await
        .assert_status_ok();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.balance(&harness.test_user_id).await, 10);
}

#[tokio::test]
async fn empty_wallet_is_denied_before_the_provider_is_called() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .expect(0)
        .mount(&provider)
        .await;
    let harness = TestHarness::with_ai(&format!("{}/v1", provider.uri()));
    let expert = harness.ai_expert().await;

    let response = harness
        .server
        .post("/v1/chat")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .json(&json!({
            "expert_id": expert.id.to_string(),
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .await;

    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "admission_denied");
    assert_eq!(body["error"]["details"]["balance"], 0);
    assert_eq!(body["error"]["details"]["required"], 1);
}

#[tokio::test]
async fn provider_failure_is_retryable_and_free() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
        .mount(&provider)
        .await;
    let harness = TestHarness::with_ai(&format!("{}/v1", provider.uri()));
    let expert = harness.ai_expert().await;
    harness.fund(&harness.test_user_id, 10).await;

    let response = harness
        .server
        .post("/v1/chat")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .json(&json!({
            "expert_id": expert.id.to_string(),
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"]["details"]["retryable"], true);
    assert_eq!(harness.balance(&harness.test_user_id).await, 10);
}

#[tokio::test]
async fn chat_is_unavailable_without_a_provider() {
    let harness = TestHarness::new();
    let expert = harness.ai_expert().await;
    harness.fund(&harness.test_user_id, 10).await;

    harness
        .server
        .post("/v1/chat")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .json(&json!({
            "expert_id": expert.id.to_string(),
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn human_experts_cannot_be_chatted_with() {
    let harness = TestHarness::new();
    let (expert, _) = harness.human_expert().await;
    harness.fund(&harness.test_user_id, 10).await;

    harness
        .server
        .post("/v1/chat")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .json(&json!({
            "expert_id": expert.id.to_string(),
            "messages": [{"role": "user", "content": "hello"}]
        }))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}
