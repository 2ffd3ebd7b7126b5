//! Application state, routes, and request-context middleware.
//!
//! The upstream router authenticates callers and forwards identity in
//! headers (`X-Actor-Id`, `X-Actor-Name`, `X-Actor-Roles`); this surface
//! threads that identity, the correlation id, and the peer address through
//! invocation, audit, and error reporting.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::HeaderMap;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use procgate_audit::{
    purge_expired, query_audit_events, AuditPage, AuditPrincipal, AuditQueryFilter,
    RetentionPolicy,
};
use procgate_core::{
    Actor, CorrelationId, GateError, ParamValue, ProcedureParameter, ResultRow,
    SecurityErrorKind, SqlType,
};
use procgate_executor::{ExecutionContext, ProcedureExecutor};
use procgate_storage::{map_sqlite_error, ProcedureBackend};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error_boundary::{ApiError, CORRELATION_ID_HEADER};
use crate::rate_limiting::{rate_limit_middleware, RateLimiter};

/// Request header carrying a caller-supplied correlation id.
pub const CORRELATION_ID_REQUEST_HEADER: &str = "x-correlation-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<ProcedureExecutor>,
    pub backend: Arc<dyn ProcedureBackend>,
}

/// Per-request context resolved by [`request_context_middleware`] and
/// available to every handler and middleware behind it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: CorrelationId,
    pub actor: Option<Actor>,
    pub peer_ip: Option<String>,
}

/// Build the gateway router.
pub fn build_router(state: AppState, limiter: RateLimiter) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tools/{name}", post(invoke_tool))
        .route("/api/v1/audit", get(query_audit))
        .layer(middleware::from_fn(rate_limit_middleware))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(Extension(limiter))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Resolve the request context: correlation id (caller-supplied or
/// generated), caller identity, and peer address. The correlation id is
/// echoed on every response.
pub async fn request_context_middleware(mut req: axum::extract::Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_ID_REQUEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(CorrelationId::parse_or_new)
        .unwrap_or_default();

    let context = RequestContext {
        correlation_id,
        actor: actor_from_headers(req.headers()),
        peer_ip: req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|peer| peer.0.ip().to_string()),
    };
    req.extensions_mut().insert(correlation_id);
    req.extensions_mut().insert(context);

    let mut response = next.run(req).await;
    if !response.headers().contains_key(CORRELATION_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
    }
    response
}

/// Caller identity from the upstream router's headers.
fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let id = headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())?;

    let mut actor = Actor::new(id);
    if let Some(name) = headers.get("x-actor-name").and_then(|v| v.to_str().ok()) {
        actor = actor.with_display_name(name);
    }
    if let Some(roles) = headers.get("x-actor-roles").and_then(|v| v.to_str().ok()) {
        actor = actor.with_roles(
            roles
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from)
                .collect(),
        );
    }
    Some(actor)
}

async fn health() -> &'static str {
    "ok"
}

/// Tool invocation request body.
#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    /// Parameter values keyed by declared parameter name
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Caller time budget in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Tool invocation response body.
#[derive(Debug, Serialize)]
pub struct InvokeResponse {
    pub correlation_id: String,
    pub row_count: usize,
    pub rows: Vec<ResultRow>,
    pub rows_affected: u64,
    pub output: BTreeMap<String, ParamValue>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<ParamValue>,
}

async fn invoke_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(context): Extension<RequestContext>,
    Json(body): Json<InvokeRequest>,
) -> Result<Json<InvokeResponse>, ApiError> {
    let mut ctx = ExecutionContext::new().with_correlation_id(context.correlation_id);
    if let Some(actor) = context.actor {
        ctx = ctx.with_actor(actor);
    }
    if let Some(peer_ip) = context.peer_ip {
        ctx = ctx.with_ip_address(peer_ip);
    }
    if let Some(timeout_ms) = body.timeout_ms {
        ctx = ctx.with_caller_timeout(Duration::from_millis(timeout_ms));
    }

    let spec = state.executor.registry().get(&name);
    let params = build_parameters(spec.as_deref(), body.parameters);

    let is_mutation = spec.map(|s| s.operation.is_mutation()).unwrap_or(false);

    let result = if is_mutation {
        state.executor.execute_non_query(&name, params, &ctx).await
    } else {
        state.executor.execute(&name, params, &ctx).await
    }?;

    Ok(Json(InvokeResponse {
        correlation_id: context.correlation_id.to_string(),
        row_count: result.row_count(),
        rows: result.rows,
        rows_affected: result.rows_affected,
        output: result.output,
        execution_time_ms: result.execution_time_ms,
        return_value: result.return_value,
    }))
}

/// Turn the JSON parameter map into typed parameters. Declared parameters
/// take their declared type and direction; unknown names pass through with
/// inferred types so the executor reports them as field errors.
fn build_parameters(
    spec: Option<&procgate_executor::ProcedureSpec>,
    parameters: BTreeMap<String, serde_json::Value>,
) -> Vec<ProcedureParameter> {
    parameters
        .into_iter()
        .map(|(name, value)| {
            let value = ParamValue::from(value);
            let declared = spec.and_then(|s| s.params.iter().find(|p| p.name == name));
            match declared {
                Some(d) => ProcedureParameter {
                    name,
                    value,
                    direction: d.direction,
                    sql_type: d.sql_type,
                },
                None => {
                    let sql_type = inferred_type(&value);
                    ProcedureParameter::input(name, value, sql_type)
                }
            }
        })
        .collect()
}

fn inferred_type(value: &ParamValue) -> SqlType {
    match value {
        ParamValue::Null | ParamValue::Text(_) => SqlType::Text,
        ParamValue::Boolean(_) => SqlType::Boolean,
        ParamValue::Integer(_) => SqlType::Integer,
        ParamValue::Real(_) => SqlType::Real,
        ParamValue::Blob(_) => SqlType::Blob,
    }
}

/// Query the audit trail, subject to row-level visibility.
async fn query_audit(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Query(filter): Query<AuditQueryFilter>,
) -> Result<Json<AuditPage>, ApiError> {
    let Some(actor) = context.actor else {
        return Err(GateError::security(
            SecurityErrorKind::AuthenticationFailure,
            "audit query without caller identity",
        )
        .with_correlation_id(context.correlation_id)
        .into());
    };

    let principal = AuditPrincipal::from_actor(&actor);
    let backend = Arc::clone(&state.backend);

    let page = tokio::task::spawn_blocking(move || {
        let conn = backend.get_connection()?;
        query_audit_events(&conn, &principal, &filter).map_err(map_sqlite_error)
    })
    .await
    .map_err(|e| GateError::internal(format!("audit query task failed: {e}")))?
    .map_err(|e| e.with_correlation_id(context.correlation_id))?;

    Ok(Json(page))
}

/// Periodic retention sweep. Spawned once at startup; errors are logged
/// and the next tick tries again.
pub async fn retention_sweep_task(
    backend: Arc<dyn ProcedureBackend>,
    policy: RetentionPolicy,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so startup stays quick
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let backend = Arc::clone(&backend);
        let swept = tokio::task::spawn_blocking(move || {
            let conn = backend.get_connection()?;
            purge_expired(&conn, &policy, chrono::Utc::now()).map_err(map_sqlite_error)
        })
        .await;

        match swept {
            Ok(Ok(result)) => {
                if result.deleted_total() > 0 {
                    info!(
                        deleted = result.deleted_total(),
                        "Retention sweep deleted expired audit events"
                    );
                }
            }
            Ok(Err(e)) => error!(error = %e, "Retention sweep failed"),
            Err(e) => error!(error = %e, "Retention sweep task failed"),
        }
    }
}
