//! The error boundary: failure taxonomy → transport response.
//!
//! Every response body carries the safe message and the correlation id;
//! validation failures additionally carry the field-level error map, and
//! rate-limit failures advertise `Retry-After`. Full diagnostics are
//! logged at error severity, except caller cancellation, which is not an
//! error condition of ours.

use std::collections::BTreeMap;

use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use procgate_core::{ErrorKind, GateError, SecurityErrorKind};
use serde::Serialize;
use tracing::{debug, error};

/// Response header echoing the operation's correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<BTreeMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Newtype making [`GateError`] an axum response.
#[derive(Debug)]
pub struct ApiError(pub GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        Self(err)
    }
}

/// Transport status for each failure classification.
pub fn status_for(kind: &ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation(_) => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound { .. } => StatusCode::NOT_FOUND,
        ErrorKind::Security { kind, .. } => match kind {
            SecurityErrorKind::AuthenticationFailure => StatusCode::UNAUTHORIZED,
            SecurityErrorKind::AuthorizationFailure => StatusCode::FORBIDDEN,
            SecurityErrorKind::SuspiciousActivity => StatusCode::FORBIDDEN,
        },
        ErrorKind::BusinessRule { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ExternalService { .. } => StatusCode::BAD_GATEWAY,
        ErrorKind::Database { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Configuration { .. } | ErrorKind::Internal { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err.kind);

        // Caller cancellation is caller-initiated, not our failure
        if matches!(err.kind, ErrorKind::Cancelled) {
            debug!(
                correlation_id = %err.correlation_id,
                "Request cancelled by caller"
            );
        } else {
            error!(
                correlation_id = %err.correlation_id,
                code = err.code(),
                error = %err,
                details = ?err.details,
                "Request failed"
            );
        }

        let retry_after = match err.kind {
            ErrorKind::RateLimited { retry_after_secs } => Some(retry_after_secs),
            _ => None,
        };

        let body = ErrorBody {
            error: err.safe_message(),
            correlation_id: err.correlation_id.to_string(),
            field_errors: err.field_errors().map(|f| f.as_map().clone()),
            retry_after,
        };

        let mut response = (status, Json(body)).into_response();

        if let Ok(value) = HeaderValue::from_str(&err.correlation_id.to_string()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(CORRELATION_ID_HEADER), value);
        }
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(HeaderName::from_static("retry-after"), HeaderValue::from(secs));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procgate_core::FieldErrors;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&GateError::validation(FieldErrors::new()).kind),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&GateError::not_found("procedure", "x").kind),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(
                &GateError::security(SecurityErrorKind::AuthenticationFailure, "bad token").kind
            ),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(
                &GateError::security(SecurityErrorKind::AuthorizationFailure, "no role").kind
            ),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&GateError::business_rule("max_rows", "too many").kind),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&GateError::external_service("vault", "down").kind),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&GateError::database(Some(5), "busy").kind),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&GateError::rate_limited(30).kind),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&GateError::cancelled().kind),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            status_for(&GateError::internal("boom").kind),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&GateError::configuration("bad env").kind),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_response_shape_carries_safe_message_and_correlation_id() {
        let err = GateError::database(Some(19), "UNIQUE constraint failed: customers.email");
        let cid = err.correlation_id.to_string();
        let response = ApiError(err).into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response
                .headers()
                .get(CORRELATION_ID_HEADER)
                .unwrap()
                .to_str()
                .unwrap(),
            cid
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["correlation_id"], cid.as_str());
        let message = body["error"].as_str().unwrap();
        assert!(!message.contains("customers"));
        assert!(!message.contains("email"));
    }

    #[tokio::test]
    async fn test_validation_response_carries_field_errors() {
        let mut errors = FieldErrors::new();
        errors.add("region", "required parameter missing");
        errors.add("limit", "expected integer, got text");
        let response = ApiError(GateError::validation(errors)).into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["field_errors"]["region"][0]
            .as_str()
            .unwrap()
            .contains("required"));
        assert!(body["field_errors"]["limit"][0].is_string());
    }

    #[tokio::test]
    async fn test_rate_limited_response_advertises_retry_after() {
        let response = ApiError(GateError::rate_limited(42)).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after").unwrap().to_str().unwrap(),
            "42"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["retry_after"], 42);
    }
}
