//! ProcGate Executor
//!
//! The single gateway to the database. Callers name a registered procedure
//! and supply typed parameters; the executor binds them, applies the
//! command timeout, retries transient failures for idempotent procedures,
//! and records exactly one audit event per invocation, success or failure.
//! A circuit breaker short-circuits calls while the database is known to
//! be failing.
//!
//! No ad hoc command text ever reaches this layer: the registry holds the
//! vetted SQL, resolved once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use procgate_audit::{AuditEvent, AuditRecorder, SecurityEventType};
use procgate_core::{
    Actor, CorrelationId, ErrorKind, GateError, OperationKind, ProcedureParameter,
    ProcedureResult, Result, SecurityErrorKind, SqlRiskClassifier,
};
use procgate_storage::{ExecutorConfig, ProcedureBackend};
use tracing::warn;

pub mod bind;
pub mod circuit;
pub mod registry;
pub mod retry;
pub mod transaction;

pub use bind::StatementKind;
pub use circuit::{CircuitBreaker, CircuitState};
pub use registry::{ParamSpec, ProcedureRegistry, ProcedureSpec};
pub use transaction::{TransactionScope, TxState};

/// Per-operation context threaded from the caller into execution, audit,
/// and errors.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub correlation_id: CorrelationId,
    pub actor: Option<Actor>,
    pub ip_address: Option<String>,
    /// Caller-requested time budget. When it is the binding limit and
    /// expires, the failure is classified as caller cancellation.
    pub caller_timeout: Option<Duration>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            actor: None,
            ip_address: None,
            caller_timeout: None,
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_caller_timeout(mut self, timeout: Duration) -> Self {
        self.caller_timeout = Some(timeout);
        self
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The stored procedure executor.
pub struct ProcedureExecutor {
    backend: Arc<dyn ProcedureBackend>,
    registry: Arc<ProcedureRegistry>,
    classifier: Arc<SqlRiskClassifier>,
    recorder: AuditRecorder,
    config: ExecutorConfig,
    circuit: CircuitBreaker,
}

impl ProcedureExecutor {
    pub fn new(
        backend: Arc<dyn ProcedureBackend>,
        registry: Arc<ProcedureRegistry>,
        recorder: AuditRecorder,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate().map_err(GateError::configuration)?;
        let circuit = CircuitBreaker::new(config.circuit_breaker.clone());
        Ok(Self {
            backend,
            registry,
            classifier: Arc::new(SqlRiskClassifier::new()),
            recorder,
            config,
            circuit,
        })
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        &self.registry
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Execute a registered procedure and return its rows.
    pub async fn execute(
        &self,
        name: &str,
        params: Vec<ProcedureParameter>,
        ctx: &ExecutionContext,
    ) -> Result<ProcedureResult> {
        self.invoke(name, params, ctx, StatementKind::Query).await
    }

    /// Execute a registered data-modifying procedure and return the
    /// affected-row count and output parameters.
    pub async fn execute_non_query(
        &self,
        name: &str,
        params: Vec<ProcedureParameter>,
        ctx: &ExecutionContext,
    ) -> Result<ProcedureResult> {
        self.invoke(name, params, ctx, StatementKind::NonQuery).await
    }

    /// Run several executor calls atomically in one transaction scope.
    ///
    /// The closure's calls enlist in a single session-scoped transaction;
    /// returning `Ok` commits (unless the closure finalized the scope
    /// itself). Any error, or a panic via the scope's drop guard, rolls
    /// back before propagating.
    pub async fn execute_transaction<T, F>(&self, ctx: &ExecutionContext, f: F) -> Result<T>
    where
        F: FnOnce(&mut TransactionScope<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.circuit
            .check()
            .map_err(|e| e.with_correlation_id(ctx.correlation_id))?;

        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let classifier = Arc::clone(&self.classifier);
        let recorder = self.recorder.clone();
        let correlation_id = ctx.correlation_id;
        let actor = ctx.actor.clone();
        let ip_address = ctx.ip_address.clone();

        let (handle_tx, mut handle_rx) = tokio::sync::oneshot::channel();

        let join = tokio::task::spawn_blocking(move || -> Result<T> {
            let conn = backend.get_connection()?;
            let _ = handle_tx.send(conn.get_interrupt_handle());

            let mut scope = TransactionScope::new(
                &conn,
                registry,
                classifier,
                recorder,
                correlation_id,
                actor,
                ip_address,
            );
            scope.begin()?;

            match f(&mut scope) {
                Ok(value) => {
                    if scope.state() == TxState::Active {
                        scope.commit()?;
                    }
                    Ok(value)
                }
                Err(err) => {
                    if scope.state() == TxState::Active {
                        let _ = scope.rollback();
                    }
                    Err(err)
                }
            }
        });

        let outcome = match tokio::time::timeout(self.config.transaction_timeout, join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(GateError::internal(format!(
                "transaction task failed: {join_err}"
            ))),
            Err(_) => {
                if let Ok(handle) = handle_rx.try_recv() {
                    handle.interrupt();
                }
                Err(GateError::database_timeout(format!(
                    "transaction exceeded timeout of {:?}",
                    self.config.transaction_timeout
                )))
            }
        };

        match &outcome {
            Ok(_) => self.circuit.on_success(),
            Err(err) => {
                if matches!(err.kind, ErrorKind::Database { .. }) {
                    self.circuit.on_failure();
                }
            }
        }
        outcome.map_err(|e| e.with_correlation_id(ctx.correlation_id))
    }

    async fn invoke(
        &self,
        name: &str,
        params: Vec<ProcedureParameter>,
        ctx: &ExecutionContext,
        kind: StatementKind,
    ) -> Result<ProcedureResult> {
        let operation = self
            .registry
            .get(name)
            .map(|s| s.operation)
            .unwrap_or(OperationKind::Execute);

        let outcome = self
            .try_invoke(name, &params, ctx, kind)
            .await
            .map_err(|e| e.with_correlation_id(ctx.correlation_id));

        let inputs: BTreeMap<String, serde_json::Value> = params
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::to_value(&p.value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();

        record_invocation_outcome(
            &self.recorder,
            operation,
            name,
            kind,
            ctx.correlation_id,
            ctx.actor.as_ref(),
            ctx.ip_address.as_deref(),
            Some(&inputs),
            &outcome,
        );

        outcome
    }

    async fn try_invoke(
        &self,
        name: &str,
        params: &[ProcedureParameter],
        ctx: &ExecutionContext,
        kind: StatementKind,
    ) -> Result<ProcedureResult> {
        self.circuit.check()?;

        let spec = self
            .registry
            .get(name)
            .ok_or_else(|| GateError::not_found("procedure", name))?;

        let plan = bind::plan(&spec, &self.classifier, params)?;

        let command_timeout = spec.timeout().unwrap_or(self.config.command_timeout);
        let (effective_timeout, caller_bound) = match ctx.caller_timeout {
            Some(caller) if caller < command_timeout => (caller, true),
            _ => (command_timeout, false),
        };

        let mut attempt: u32 = 1;
        loop {
            let result = self
                .run_attempt(&spec, &plan, kind, effective_timeout, caller_bound)
                .await;

            match result {
                Ok(result) => {
                    self.circuit.on_success();
                    return Ok(result);
                }
                Err(err) => {
                    if matches!(err.kind, ErrorKind::Database { .. }) {
                        self.circuit.on_failure();
                    }
                    if retry::should_retry(&self.config.retry, spec.idempotent, &err, attempt) {
                        let delay = retry::backoff_delay(&self.config.retry, attempt);
                        warn!(
                            procedure = %spec.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            correlation_id = %ctx.correlation_id,
                            "Transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        spec: &Arc<ProcedureSpec>,
        plan: &bind::BindPlan,
        kind: StatementKind,
        timeout: Duration,
        caller_bound: bool,
    ) -> Result<ProcedureResult> {
        let backend = Arc::clone(&self.backend);
        let spec = Arc::clone(spec);
        let plan = plan.clone();
        let (handle_tx, mut handle_rx) = tokio::sync::oneshot::channel();

        let join = tokio::task::spawn_blocking(move || -> Result<ProcedureResult> {
            let conn = backend.get_connection()?;
            let _ = handle_tx.send(conn.get_interrupt_handle());
            bind::run_statement(&conn, &spec, &plan, kind)
        });

        match tokio::time::timeout(timeout, join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(GateError::internal(format!(
                "executor task failed: {join_err}"
            ))),
            Err(_) => {
                // Interrupt the in-flight statement before reporting
                if let Ok(handle) = handle_rx.try_recv() {
                    handle.interrupt();
                }
                if caller_bound {
                    Err(GateError::cancelled()
                        .with_detail("timeout_ms", timeout.as_millis().to_string()))
                } else {
                    Err(GateError::database_timeout(format!(
                        "statement exceeded command timeout of {timeout:?}"
                    )))
                }
            }
        }
    }
}

/// Build and record the single audit event for one invocation outcome.
///
/// Security-classified failures become security events carrying the threat
/// indicators; everything else becomes a database event with the
/// diagnostic error attached.
#[allow(clippy::too_many_arguments)]
pub(crate) fn record_invocation_outcome(
    recorder: &AuditRecorder,
    operation: OperationKind,
    name: &str,
    kind: StatementKind,
    correlation_id: CorrelationId,
    actor: Option<&Actor>,
    ip_address: Option<&str>,
    inputs: Option<&BTreeMap<String, serde_json::Value>>,
    outcome: &Result<ProcedureResult>,
) {
    let mut event = match outcome {
        Ok(result) => {
            let mut event =
                AuditEvent::database(operation, name, kind.action(), correlation_id)
                    .with_execution_time_ms(result.execution_time_ms)
                    .with_rows_affected(result.rows_affected);
            if let Some(inputs) = inputs {
                event = event.with_parameters(inputs.clone());
            }
            event
        }
        Err(err) => match &err.kind {
            ErrorKind::Security { kind: sec_kind, .. } => {
                let event_type = match sec_kind {
                    SecurityErrorKind::AuthenticationFailure => SecurityEventType::LoginFailure,
                    SecurityErrorKind::AuthorizationFailure => SecurityEventType::PermissionDenied,
                    SecurityErrorKind::SuspiciousActivity => SecurityEventType::SuspiciousActivity,
                };
                let indicators: Vec<String> = err
                    .details
                    .get("block_reasons")
                    .map(|s| s.split("; ").map(String::from).collect())
                    .unwrap_or_default();
                let risk = 0.4 + 0.2 * indicators.len() as f64;
                AuditEvent::security(event_type, name, correlation_id)
                    .with_threat_indicators(indicators)
                    .with_risk_score(risk)
                    .with_error(err.code(), err.to_string())
            }
            _ => {
                let mut event =
                    AuditEvent::database(operation, name, kind.action(), correlation_id)
                        .with_error(err.code(), err.to_string());
                if let Some(inputs) = inputs {
                    event = event.with_parameters(inputs.clone());
                }
                event
            }
        },
    };

    if let Some(actor) = actor {
        event = event.with_actor(actor.clone());
    }
    if let Some(ip) = ip_address {
        event = event.with_ip_address(ip);
    }

    recorder.record(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_context_builders() {
        let cid = CorrelationId::new();
        let ctx = ExecutionContext::new()
            .with_correlation_id(cid)
            .with_actor(Actor::new("u-1"))
            .with_ip_address("10.0.0.1")
            .with_caller_timeout(Duration::from_secs(2));

        assert_eq!(ctx.correlation_id, cid);
        assert_eq!(ctx.actor.unwrap().id, "u-1");
        assert_eq!(ctx.ip_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(ctx.caller_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_executor_rejects_invalid_config() {
        use procgate_audit::AuditRecorderConfig;
        use procgate_storage::{LocalSqliteBackend, RetryConfig};

        let (recorder, _rx) = AuditRecorder::new(&AuditRecorderConfig::default());
        let config = ExecutorConfig::default().with_retry(RetryConfig {
            max_attempts: 0,
            ..Default::default()
        });

        let err = ProcedureExecutor::new(
            Arc::new(LocalSqliteBackend::new("unused.db")),
            Arc::new(ProcedureRegistry::builder().build()),
            recorder,
            config,
        )
        .err()
        .expect("zero retry attempts must be rejected");
        assert_eq!(err.code(), "configuration");
    }
}
