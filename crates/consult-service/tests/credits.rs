//! Credit balance, transactions, rates and grants integration tests.

mod common;

use axum::http::StatusCode;
use common::TestHarness;
use consult_core::UserId;
use serde_json::json;

// ============================================================================
// Balance
// ============================================================================

#[tokio::test]
async fn new_user_has_zero_balance_on_free_tier() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .get("/v1/credits/balance")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["balance"], 0);
    assert_eq!(body["tier"], "free");
}

#[tokio::test]
async fn get_balance_without_auth_fails() {
    let harness = TestHarness::new();

    let response = harness.server.get("/v1/credits/balance").await;

    response.assert_status_unauthorized();
}

#[tokio::test]
async fn get_balance_with_forged_token_fails() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .get("/v1/credits/balance")
        .add_header(
            TestHarness::auth_name(),
            axum::http::HeaderValue::from_static("Bearer not-a-jwt"),
        )
        .await;

    response.assert_status_unauthorized();
}

// ============================================================================
// Grants and transactions
// ============================================================================

#[tokio::test]
async fn admin_grant_credits_and_lists_transaction() {
    let harness = TestHarness::new();
    let (name, value) = TestHarness::admin_key_header();

    let response = harness
        .server
        .post("/v1/credits/grant")
        .add_header(name, value)
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 250,
            "reason": "Welcome bonus"
        }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["balance"], 250);

    let response = harness
        .server
        .get("/v1/credits/transactions")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let transactions = body["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["kind"], "bonus");
    assert_eq!(transactions[0]["amount"], 250);
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn grant_requires_admin_key() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/credits/grant")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 250,
            "reason": "self-service"
        }))
        .await;

    response.assert_status_unauthorized();
    assert_eq!(harness.balance(&harness.test_user_id).await, 0);
}

#[tokio::test]
async fn grant_rejects_usage_kinds_and_bad_amounts() {
    let harness = TestHarness::new();

    for body in [
        json!({"user_id": harness.test_user_id.to_string(), "amount": 10, "kind": "chat_usage", "reason": "x"}),
        json!({"user_id": harness.test_user_id.to_string(), "amount": 0, "reason": "x"}),
        json!({"user_id": "not-a-user", "amount": 10, "reason": "x"}),
    ] {
        let (name, value) = TestHarness::admin_key_header();
        harness
            .server
            .post("/v1/credits/grant")
            .add_header(name, value)
            .json(&body)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn transactions_paginate() {
    let harness = TestHarness::new();
    for _ in 0..3 {
        harness.fund(&harness.test_user_id, 10).await;
    }

    let response = harness
        .server
        .get("/v1/credits/transactions")
        .add_query_param("limit", 2)
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["transactions"].as_array().unwrap().len(), 2);
    assert_eq!(body["has_more"], true);

    let response = harness
        .server
        .get("/v1/credits/transactions")
        .add_query_param("limit", 2)
        .add_query_param("offset", 2)
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .await;
    let body: serde_json::Value = response.json();
    assert_eq!(body["transactions"].as_array().unwrap().len(), 1);
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn transactions_are_isolated_per_user() {
    let harness = TestHarness::new();
    harness.fund(&harness.test_user_id, 100).await;

    let response = harness
        .server
        .get("/v1/credits/transactions")
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&UserId::generate()))
        .await;
    let body: serde_json::Value = response.json();
    assert!(body["transactions"].as_array().unwrap().is_empty());
}

// ============================================================================
// Rates
// ============================================================================

#[tokio::test]
async fn free_tier_rates_by_default() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .get("/v1/rates")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["tier"], "free");
    assert_eq!(body["call_per_minute"], 12);
    assert_eq!(body["chat_per_1k"], 1.0);
}
