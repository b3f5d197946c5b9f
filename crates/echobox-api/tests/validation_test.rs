//! Request validation tests for the job CRUD surface.
//!
//! Exercises the rejection paths that must fail synchronously, before
//! anything reaches the job store: a lazily-connected pool that never
//! dials the database proves no query was attempted.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use echobox_api::{create_router, AppState};
use echobox_core::{events::NoOpAuditSink, storage::Storage};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

fn test_state() -> AppState {
    // connect_lazy never opens a connection until a query runs; these
    // tests must be rejected before that happens.
    let pool = sqlx::PgPool::connect_lazy("postgresql://validation-only").unwrap();
    AppState { storage: Arc::new(Storage::new(pool)), audit: Arc::new(NoOpAuditSink::new()) }
}

async fn response_code(response: axum::response::Response) -> (StatusCode, String) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or_default();
    let code = body
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    (status, code)
}

fn create_request(account: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/jobs")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(account) = account {
        builder = builder.header("x-account-id", account);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn valid_body() -> serde_json::Value {
    serde_json::json!({
        "content_ref": "note-9000",
        "recipient": { "email": "a@example.com", "phone": null },
        "channels": "email",
        "scheduled_for": "2026-08-08T12:00:00Z",
    })
}

#[tokio::test]
async fn create_without_account_header_is_rejected() {
    let app = create_router(test_state());

    let response = app.oneshot(create_request(None, valid_body())).await.unwrap();

    let (status, code) = response_code(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(code, "missing_account");
}

#[tokio::test]
async fn create_with_malformed_account_header_is_rejected() {
    let app = create_router(test_state());

    let response =
        app.oneshot(create_request(Some("not-a-uuid"), valid_body())).await.unwrap();

    let (status, code) = response_code(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(code, "missing_account");
}

#[tokio::test]
async fn sms_channel_without_phone_is_rejected() {
    let app = create_router(test_state());
    let account = Uuid::new_v4().to_string();

    let body = serde_json::json!({
        "content_ref": "note-9000",
        "recipient": { "email": "a@example.com", "phone": null },
        "channels": "sms",
        "scheduled_for": "2026-08-08T12:00:00Z",
    });

    let response = app.oneshot(create_request(Some(&account), body)).await.unwrap();

    let (status, code) = response_code(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(code, "missing_destination");
}

#[tokio::test]
async fn both_channels_require_both_destinations() {
    let app = create_router(test_state());
    let account = Uuid::new_v4().to_string();

    let body = serde_json::json!({
        "content_ref": "note-9000",
        "recipient": { "email": null, "phone": "+15551230000" },
        "channels": "both",
        "scheduled_for": "2026-08-08T12:00:00Z",
    });

    let response = app.oneshot(create_request(Some(&account), body)).await.unwrap();

    let (status, code) = response_code(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(code, "missing_destination");
}

#[tokio::test]
async fn empty_content_ref_is_rejected() {
    let app = create_router(test_state());
    let account = Uuid::new_v4().to_string();

    let body = serde_json::json!({
        "content_ref": "  ",
        "recipient": { "email": "a@example.com", "phone": null },
        "channels": "email",
        "scheduled_for": "2026-08-08T12:00:00Z",
    });

    let response = app.oneshot(create_request(Some(&account), body)).await.unwrap();

    let (status, code) = response_code(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(code, "invalid_input");
}

#[tokio::test]
async fn unknown_channel_value_is_rejected_by_deserialization() {
    let app = create_router(test_state());
    let account = Uuid::new_v4().to_string();

    let body = serde_json::json!({
        "content_ref": "note-9000",
        "recipient": { "email": "a@example.com", "phone": null },
        "channels": "carrier-pigeon",
        "scheduled_for": "2026-08-08T12:00:00Z",
    });

    let response = app.oneshot(create_request(Some(&account), body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn health_endpoint_responds() {
    let app = create_router(test_state());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = create_router(test_state());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.headers().contains_key("x-request-id"));
}
