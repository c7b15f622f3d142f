//! Consultation lifecycle and messaging integration tests.

mod common;

use axum::http::StatusCode;
use common::TestHarness;
use consult_core::UserId;
use serde_json::{json, Value};

async fn open(harness: &TestHarness, seeker: &UserId, expert_id: &str) -> Value {
    let response = harness
        .server
        .post("/v1/consultations")
        .add_header(TestHarness::auth_name(), TestHarness::bearer(seeker))
        .json(&json!({"expert_id": expert_id, "concern": "career"}))
        .await;
    response.assert_status_ok();
    response.json()
}

async fn send(harness: &TestHarness, user: &UserId, id: &str, content: &str) -> axum_test::TestResponse {
    harness
        .server
        .post(&format!("/v1/consultations/{id}/messages"))
        .add_header(TestHarness::auth_name(), TestHarness::bearer(user))
        .json(&json!({"content": content}))
        .await
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn open_with_human_expert_is_waiting_and_reused() {
    let harness = TestHarness::new();
    let (expert, account) = harness.human_expert().await;
    let seeker = harness.test_user_id;

    let first = open(&harness, &seeker, &expert.id.to_string()).await;
    assert_eq!(first["status"], "waiting");
    assert_eq!(first["role"], "seeker");
    assert_eq!(first["expert_user"], account.to_string());

    let second = open(&harness, &seeker, &expert.id.to_string()).await;
    assert_eq!(first["id"], second["id"]);
}

#[tokio::test]
async fn open_with_ai_or_unknown_expert_is_unprocessable() {
    let harness = TestHarness::new();
    let ai = harness.ai_expert().await;

    for expert_id in [ai.id.to_string(), consult_core::ExpertId::generate().to_string()] {
        let response = harness
            .server
            .post("/v1/consultations")
            .add_header(TestHarness::auth_name(), harness.user_auth_header())
            .json(&json!({"expert_id": expert_id}))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "expert_unresolved");
    }

    let response = harness
        .server
        .get("/v1/consultations")
        .add_header(TestHarness::auth_name(), harness.user_auth_header())
        .await;
    let body: Value = response.json();
    assert!(body["consultations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn outsiders_cannot_read_or_write() {
    let harness = TestHarness::new();
    let (expert, _) = harness.human_expert().await;
    let consultation = open(&harness, &harness.test_user_id, &expert.id.to_string()).await;
    let id = consultation["id"].as_str().unwrap();
    let stranger = UserId::generate();

    harness
        .server
        .get(&format!("/v1/consultations/{id}"))
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&stranger))
        .await
        .assert_status(StatusCode::FORBIDDEN);

    send(&harness, &stranger, id, "hello")
        .await
        .assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn first_message_activates_and_end_completes() {
    let harness = TestHarness::new();
    let (expert, account) = harness.human_expert().await;
    let seeker = harness.test_user_id;
    let consultation = open(&harness, &seeker, &expert.id.to_string()).await;
    let id = consultation["id"].as_str().unwrap();

    let response = send(&harness, &seeker, id, "Will I change jobs?").await;
    response.assert_status_ok();
    let message: Value = response.json();
    assert_eq!(message["seq"], 1);

    let response = harness
        .server
        .get(&format!("/v1/consultations/{id}"))
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&account))
        .await;
    let body: Value = response.json();
    assert_eq!(body["status"], "active");
    assert_eq!(body["role"], "expert");

    let response = harness
        .server
        .post(&format!("/v1/consultations/{id}/end"))
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&account))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "completed");

    // Ending twice is a no-op.
    harness
        .server
        .post(&format!("/v1/consultations/{id}/end"))
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&seeker))
        .await
        .assert_status_ok();

    let response = send(&harness, &seeker, id, "One more thing").await;
    response.assert_status(StatusCode::CONFLICT);
}

// ============================================================================
// Messages
// ============================================================================

#[tokio::test]
async fn messages_are_ordered_and_pullable_after_seq() {
    let harness = TestHarness::new();
    let (expert, account) = harness.human_expert().await;
    let seeker = harness.test_user_id;
    let consultation = open(&harness, &seeker, &expert.id.to_string()).await;
    let id = consultation["id"].as_str().unwrap();

    send(&harness, &seeker, id, "one").await.assert_status_ok();
    send(&harness, &account, id, "two").await.assert_status_ok();
    send(&harness, &seeker, id, "three").await.assert_status_ok();

    let response = harness
        .server
        .get(&format!("/v1/consultations/{id}/messages"))
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&account))
        .await;
    let body: Value = response.json();
    let contents: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);

    let response = harness
        .server
        .get(&format!("/v1/consultations/{id}/messages"))
        .add_query_param("after_seq", 2)
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&account))
        .await;
    let body: Value = response.json();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["seq"], 3);
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let harness = TestHarness::new();
    let (expert, _) = harness.human_expert().await;
    let consultation = open(&harness, &harness.test_user_id, &expert.id.to_string()).await;
    let id = consultation["id"].as_str().unwrap();

    send(&harness, &harness.test_user_id, id, "   ")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unread_counts_only_the_other_party() {
    let harness = TestHarness::new();
    let (expert, account) = harness.human_expert().await;
    let seeker = harness.test_user_id;
    let consultation = open(&harness, &seeker, &expert.id.to_string()).await;
    let id = consultation["id"].as_str().unwrap();

    send(&harness, &seeker, id, "hello").await.assert_status_ok();
    send(&harness, &seeker, id, "are you there?").await.assert_status_ok();

    let unread = |user: UserId| {
        let server = &harness.server;
        let path = format!("/v1/consultations/{id}/unread");
        async move {
            let body: Value = server
                .get(&path)
                .add_header(TestHarness::auth_name(), TestHarness::bearer(&user))
                .await
                .json();
            body["unread"].as_u64().unwrap()
        }
    };

    assert_eq!(unread(account).await, 2);
    assert_eq!(unread(seeker).await, 0);

    // The expert's inbox lists the consultation with its unread count.
    let response = harness
        .server
        .get("/v1/consultations")
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&account))
        .await;
    let body: Value = response.json();
    let listed = &body["consultations"][0];
    assert_eq!(listed["id"], id);
    assert_eq!(listed["unread"], 2);
    assert_eq!(listed["role"], "expert");

    harness
        .server
        .post(&format!("/v1/consultations/{id}/read"))
        .add_header(TestHarness::auth_name(), TestHarness::bearer(&account))
        .await
        .assert_status_ok();
    assert_eq!(unread(account).await, 0);
}
