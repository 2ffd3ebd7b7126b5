//! Tests for API error response shapes.
//!
//! Verifies that every failure classification maps to its transport status
//! and that all error responses carry:
//! - `error`: the caller-safe message, never internal diagnostics
//! - `correlation_id`: for joining logs and audit records
//!
//! A minimal router drives the real error boundary for each kind.

use axum::body::Body;
use axum::extract::Extension;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{middleware, Json, Router};
use procgate_api::app::request_context_middleware;
use procgate_api::error_boundary::{ApiError, CORRELATION_ID_HEADER};
use procgate_core::{CorrelationId, FieldErrors, GateError, SecurityErrorKind};
use serde_json::Value;
use tower::ServiceExt;

async fn extract_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    serde_json::from_slice(&body).expect("failed to parse JSON")
}

async fn handler_validation(
    Extension(cid): Extension<CorrelationId>,
) -> Result<Json<Value>, ApiError> {
    let mut errors = FieldErrors::new();
    errors.add("region", "required parameter missing");
    Err(GateError::validation(errors).with_correlation_id(cid).into())
}

async fn handler_not_found(
    Extension(cid): Extension<CorrelationId>,
) -> Result<Json<Value>, ApiError> {
    Err(GateError::not_found("procedure", "quarterly_payroll_export")
        .with_correlation_id(cid)
        .into())
}

async fn handler_forbidden(
    Extension(cid): Extension<CorrelationId>,
) -> Result<Json<Value>, ApiError> {
    Err(GateError::security(
        SecurityErrorKind::AuthorizationFailure,
        "user eve@example.com from 203.0.113.9 lacks role dba",
    )
    .with_correlation_id(cid)
    .into())
}

async fn handler_database(
    Extension(cid): Extension<CorrelationId>,
) -> Result<Json<Value>, ApiError> {
    Err(
        GateError::database(Some(19), "UNIQUE constraint failed: customers.email")
            .with_correlation_id(cid)
            .into(),
    )
}

async fn handler_cancelled(
    Extension(cid): Extension<CorrelationId>,
) -> Result<Json<Value>, ApiError> {
    Err(GateError::cancelled().with_correlation_id(cid).into())
}

async fn handler_internal(
    Extension(cid): Extension<CorrelationId>,
) -> Result<Json<Value>, ApiError> {
    Err(GateError::internal("stack trace: thread panicked at src/lib.rs:42")
        .with_correlation_id(cid)
        .into())
}

async fn handler_success() -> Json<Value> {
    Json(serde_json::json!({"status": "ok"}))
}

fn create_test_app() -> Router {
    Router::new()
        .route("/validation", get(handler_validation))
        .route("/not_found", get(handler_not_found))
        .route("/forbidden", get(handler_forbidden))
        .route("/database", get(handler_database))
        .route("/cancelled", get(handler_cancelled))
        .route("/internal", get(handler_internal))
        .route("/success", get(handler_success))
        .layer(middleware::from_fn(request_context_middleware))
}

async fn send(path: &str) -> Response {
    create_test_app()
        .oneshot(
            Request::builder()
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn validation_is_bad_request_with_field_errors() {
    let response = send("/validation").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = extract_json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("region"));
    assert!(body["correlation_id"].is_string());
    assert_eq!(
        body["field_errors"]["region"][0],
        "required parameter missing"
    );
}

#[tokio::test]
async fn not_found_omits_the_identifier() {
    let response = send("/not_found").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = extract_json_body(response).await;
    assert_eq!(body["error"], "procedure not found");
    assert!(!body["error"]
        .as_str()
        .unwrap()
        .contains("quarterly_payroll_export"));
}

#[tokio::test]
async fn authorization_failure_is_fixed_template() {
    let response = send("/forbidden").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = extract_json_body(response).await;
    let message = body["error"].as_str().unwrap();
    assert_eq!(
        message,
        "You do not have permission to perform this operation."
    );
    // The diagnostic email and IP never reach the caller
    assert!(!message.contains("eve@example.com"));
    assert!(!message.contains("203.0.113.9"));
}

#[tokio::test]
async fn database_failure_is_service_unavailable_and_generic() {
    let response = send("/database").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = extract_json_body(response).await;
    let message = body["error"].as_str().unwrap();
    assert!(!message.contains("UNIQUE"));
    assert!(!message.contains("customers"));
}

#[tokio::test]
async fn cancellation_is_request_timeout() {
    let response = send("/cancelled").await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
}

#[tokio::test]
async fn internal_error_hides_diagnostics() {
    let response = send("/internal").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = extract_json_body(response).await;
    assert!(!body["error"].as_str().unwrap().contains("panicked"));
    assert!(body["correlation_id"].is_string());
}

#[tokio::test]
async fn every_error_response_echoes_correlation_header() {
    for path in [
        "/validation",
        "/not_found",
        "/forbidden",
        "/database",
        "/cancelled",
        "/internal",
    ] {
        let response = send(path).await;
        assert!(
            response.headers().contains_key(CORRELATION_ID_HEADER),
            "{path} response missing correlation header"
        );
    }
}

#[tokio::test]
async fn caller_supplied_correlation_id_round_trips() {
    let supplied = "3b2f9c1e-5a7d-4f10-9b6e-2f8a4c0d1e23";
    let response = create_test_app()
        .oneshot(
            Request::builder()
                .uri("/not_found")
                .header("x-correlation-id", supplied)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap(),
        supplied
    );
    let body = extract_json_body(response).await;
    assert_eq!(body["correlation_id"], supplied);
}

#[tokio::test]
async fn success_passes_through_with_correlation_header() {
    let response = send("/success").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(CORRELATION_ID_HEADER));

    let body = extract_json_body(response).await;
    assert_eq!(body["status"], "ok");
}
