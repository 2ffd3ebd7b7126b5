//! Session-scoped transaction coordination.
//!
//! A [`TransactionScope`] owns one connection for its whole lifetime and
//! drives the `NotStarted → Active → {Committed | RolledBack}` state
//! machine. Executor calls made through the scope enlist in its
//! transaction and run strictly sequentially on its connection. An error
//! inside an active scope rolls back before anything propagates, as does
//! dropping the scope without committing, which is how caller
//! cancellation surfaces.

use std::sync::Arc;

use procgate_audit::AuditRecorder;
use procgate_core::{
    Actor, CorrelationId, GateError, ProcedureParameter, ProcedureResult, Result,
    SqlRiskClassifier,
};
use procgate_storage::map_sqlite_error;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::bind::{self, StatementKind};
use crate::registry::ProcedureRegistry;
use crate::record_invocation_outcome;

/// Transaction scope state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

/// A transaction scope over one backend connection.
pub struct TransactionScope<'c> {
    conn: &'c Connection,
    state: TxState,
    registry: Arc<ProcedureRegistry>,
    classifier: Arc<SqlRiskClassifier>,
    recorder: AuditRecorder,
    correlation_id: CorrelationId,
    actor: Option<Actor>,
    ip_address: Option<String>,
}

impl<'c> TransactionScope<'c> {
    pub(crate) fn new(
        conn: &'c Connection,
        registry: Arc<ProcedureRegistry>,
        classifier: Arc<SqlRiskClassifier>,
        recorder: AuditRecorder,
        correlation_id: CorrelationId,
        actor: Option<Actor>,
        ip_address: Option<String>,
    ) -> Self {
        Self {
            conn,
            state: TxState::NotStarted,
            registry,
            classifier,
            recorder,
            correlation_id,
            actor,
            ip_address,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Open the transaction. Rejected when the scope is already active or
    /// finished.
    pub fn begin(&mut self) -> Result<()> {
        match self.state {
            TxState::NotStarted => {
                self.conn
                    .execute_batch("BEGIN IMMEDIATE")
                    .map_err(map_sqlite_error)?;
                self.state = TxState::Active;
                debug!(correlation_id = %self.correlation_id, "Transaction begun");
                Ok(())
            }
            TxState::Active => Err(GateError::internal("transaction scope already active")
                .with_correlation_id(self.correlation_id)),
            TxState::Committed | TxState::RolledBack => {
                Err(GateError::internal("transaction scope already finalized")
                    .with_correlation_id(self.correlation_id))
            }
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        self.require_active()?;
        self.conn
            .execute_batch("COMMIT")
            .map_err(map_sqlite_error)?;
        self.state = TxState::Committed;
        debug!(correlation_id = %self.correlation_id, "Transaction committed");
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.require_active()?;
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(map_sqlite_error)?;
        self.state = TxState::RolledBack;
        debug!(correlation_id = %self.correlation_id, "Transaction rolled back");
        Ok(())
    }

    /// Execute a registered read procedure inside the scope.
    pub fn execute(
        &mut self,
        name: &str,
        params: &[ProcedureParameter],
    ) -> Result<ProcedureResult> {
        self.run(name, params, StatementKind::Query)
    }

    /// Execute a registered data-modifying procedure inside the scope.
    pub fn execute_non_query(
        &mut self,
        name: &str,
        params: &[ProcedureParameter],
    ) -> Result<ProcedureResult> {
        self.run(name, params, StatementKind::NonQuery)
    }

    fn run(
        &mut self,
        name: &str,
        params: &[ProcedureParameter],
        kind: StatementKind,
    ) -> Result<ProcedureResult> {
        self.require_active()?;

        let spec = self.registry.get(name);
        let operation = spec
            .as_ref()
            .map(|s| s.operation)
            .unwrap_or(procgate_core::OperationKind::Execute);

        let outcome = match spec {
            Some(spec) => bind::plan(&spec, &self.classifier, params).and_then(|plan| {
                bind::run_statement(self.conn, &spec, &plan, kind).map(|r| (plan, r))
            }),
            None => Err(GateError::not_found("procedure", name)),
        };

        let (inputs, result) = match outcome {
            Ok((plan, result)) => (Some(plan.input_json().clone()), Ok(result)),
            Err(e) => (None, Err(e.with_correlation_id(self.correlation_id))),
        };

        record_invocation_outcome(
            &self.recorder,
            operation,
            name,
            kind,
            self.correlation_id,
            self.actor.as_ref(),
            self.ip_address.as_deref(),
            inputs.as_ref(),
            &result,
        );

        result
    }

    fn require_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(GateError::internal(format!(
                "transaction scope is {:?}, expected Active",
                self.state
            ))
            .with_correlation_id(self.correlation_id));
        }
        Ok(())
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            warn!(
                correlation_id = %self.correlation_id,
                "Transaction scope dropped while active, rolling back"
            );
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(
                    correlation_id = %self.correlation_id,
                    error = %e,
                    "Rollback on drop failed"
                );
            }
            self.state = TxState::RolledBack;
        }
    }
}
