//! ProcGate gateway server.
//!
//! Wires the backend, the procedure registry, the audit pipeline, and the
//! HTTP surface together. Configuration comes from the environment:
//!
//! - `PROCGATE_DB_PATH`: SQLite database path (default: `procgate.db`)
//! - `PROCGATE_PROCEDURES_PATH`: JSON manifest of registered procedures
//! - `PORT`: listen port (default: 8080)

use std::sync::Arc;
use std::time::Duration;

use procgate_api::app::{build_router, retention_sweep_task, AppState};
use procgate_api::rate_limiting::{RateLimitConfig, RateLimiter};
use procgate_audit::{audit_writer_task, AuditRecorder, AuditRecorderConfig, RetentionPolicy};
use procgate_executor::{ProcedureExecutor, ProcedureRegistry};
use procgate_storage::{ExecutorConfig, LocalSqliteBackend, ProcedureBackend};
use tracing_subscriber::EnvFilter;

/// How often the retention sweep runs.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_path =
        std::env::var("PROCGATE_DB_PATH").unwrap_or_else(|_| "procgate.db".to_string());
    tracing::info!(db_path = %db_path, "Using database");

    let backend = LocalSqliteBackend::new(&db_path);
    if !backend.exists().unwrap_or(false) {
        tracing::warn!("Database does not exist, initializing");
        backend.initialize().expect("failed to initialize database");
    }
    let backend: Arc<dyn ProcedureBackend> = Arc::new(backend);

    let manifest_path = std::env::var("PROCGATE_PROCEDURES_PATH")
        .expect("PROCGATE_PROCEDURES_PATH must point to the procedure manifest");
    let manifest = std::fs::read_to_string(&manifest_path)
        .unwrap_or_else(|e| panic!("failed to read procedure manifest {manifest_path}: {e}"));
    let registry =
        ProcedureRegistry::from_manifest_json(&manifest).expect("invalid procedure manifest");
    tracing::info!(procedures = registry.len(), "Procedure registry loaded");

    let audit_config = AuditRecorderConfig::default();
    let (recorder, receiver) = AuditRecorder::new(&audit_config);
    tokio::spawn(audit_writer_task(
        receiver,
        Arc::clone(&backend),
        audit_config,
    ));

    tokio::spawn(retention_sweep_task(
        Arc::clone(&backend),
        RetentionPolicy::from_env(),
        RETENTION_SWEEP_INTERVAL,
    ));

    let executor = ProcedureExecutor::new(
        Arc::clone(&backend),
        Arc::new(registry),
        recorder,
        ExecutorConfig::from_env(),
    )
    .expect("invalid executor configuration");

    let state = AppState {
        executor: Arc::new(executor),
        backend,
    };
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let app = build_router(state, limiter);

    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .expect("PORT must be a valid number");

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("ProcGate listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .unwrap();
}
