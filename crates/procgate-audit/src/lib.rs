//! ProcGate Audit
//!
//! Append-only audit trail for every attempted operation:
//! - One structured event per executor invocation, success or failure
//! - Non-blocking buffered writes so slow audit storage never stalls the
//!   business operation
//! - Graceful degradation: a failed audit write falls back to structured
//!   logging, never to the caller
//! - An authorized query path with row-level visibility
//! - A retention sweep, the only sanctioned deletion path
//!
//! ## Configuration
//!
//! - `PROCGATE_AUDIT_BUFFER_SIZE`: Max events in buffer (default: 1000)
//! - `PROCGATE_AUDIT_FLUSH_INTERVAL_MS`: Flush interval (default: 1000)
//! - `PROCGATE_AUDIT_RETENTION_DAYS`: Routine event retention (default: 90)
//! - `PROCGATE_AUDIT_SECURITY_RETENTION_DAYS`: Security event retention
//!   (default: 365)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use procgate_core::{Actor, CorrelationId, OperationKind, OperationResult};
use serde::{Deserialize, Serialize};

pub mod query;
pub mod recorder;

pub use query::{
    AuditEventRow, AuditPage, AuditPrincipal, AuditQueryFilter, PurgeResult, RetentionPolicy,
    query_audit_events, purge_expired, AUDITOR_ROLE,
};
pub use recorder::{audit_writer_task, AuditRecorder, AuditRecorderConfig};

/// Top-level event classification (matches the audit store CHECK
/// constraint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEventType {
    Database,
    Security,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Database => "database",
            AuditEventType::Security => "security",
        }
    }
}

/// Security event sub-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    LoginSuccess,
    LoginFailure,
    UnauthorizedAccess,
    PermissionDenied,
    SuspiciousActivity,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::LoginSuccess => "login_success",
            SecurityEventType::LoginFailure => "login_failure",
            SecurityEventType::UnauthorizedAccess => "unauthorized_access",
            SecurityEventType::PermissionDenied => "permission_denied",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
        }
    }
}

/// One changed field in a before/after diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
}

/// Compute the minimal diff between two field maps.
///
/// For every key present in either map whose values differ, one
/// [`FieldChange`] is emitted; a key absent from one side is treated as
/// null on that side. Output is ordered by field name.
pub fn changed_fields(
    before: &BTreeMap<String, serde_json::Value>,
    after: &BTreeMap<String, serde_json::Value>,
) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    let keys: std::collections::BTreeSet<&String> = before.keys().chain(after.keys()).collect();

    for key in keys {
        let old_value = before.get(key);
        let new_value = after.get(key);
        if old_value != new_value {
            changes.push(FieldChange {
                field: key.clone(),
                old_value: old_value.cloned(),
                new_value: new_value.cloned(),
            });
        }
    }

    changes
}

/// Database-operation payload carried in `additional_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseAuditDetail {
    /// Input parameter values as bound, keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

/// Security payload carried in `additional_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityAuditDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_permissions: Vec<String>,
    /// Risk score in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threat_indicators: Vec<String>,
}

/// Specialized payload, persisted as JSON in `additional_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuditDetail {
    Database(DatabaseAuditDetail),
    Security(SecurityAuditDetail),
}

/// An immutable record of one attempted operation.
///
/// Built by the executor (or the security layer) at the boundary of each
/// invocation and handed to the [`AuditRecorder`]; never mutated after it
/// is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    /// Operation kind for database events, security sub-kind for security
    /// events
    pub event_sub_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    pub actor: Option<Actor>,
    pub ip_address: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Procedure name for database events, resource for security events
    pub resource_name: Option<String>,
    pub action: String,
    pub result: OperationResult,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub detail: Option<AuditDetail>,
}

impl AuditEvent {
    /// Start a database event for one procedure invocation.
    pub fn database(
        operation: OperationKind,
        procedure_name: impl Into<String>,
        action: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            event_type: AuditEventType::Database,
            event_sub_type: operation.as_str().to_string(),
            timestamp: Utc::now(),
            correlation_id,
            actor: None,
            ip_address: None,
            resource_type: None,
            resource_id: None,
            resource_name: Some(procedure_name.into()),
            action: action.into(),
            result: OperationResult::Success,
            error_code: None,
            error_message: None,
            duration_ms: None,
            detail: Some(AuditDetail::Database(DatabaseAuditDetail::default())),
        }
    }

    /// Start a security event.
    pub fn security(
        kind: SecurityEventType,
        resource: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            event_type: AuditEventType::Security,
            event_sub_type: kind.as_str().to_string(),
            timestamp: Utc::now(),
            correlation_id,
            actor: None,
            ip_address: None,
            resource_type: None,
            resource_id: None,
            resource_name: Some(resource.into()),
            action: kind.as_str().to_string(),
            result: OperationResult::Failure,
            error_code: None,
            error_message: None,
            duration_ms: None,
            detail: Some(AuditDetail::Security(SecurityAuditDetail::default())),
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(entity_type.into());
        self.resource_id = Some(entity_id.into());
        self
    }

    pub fn with_result(mut self, result: OperationResult) -> Self {
        self.result = result;
        self
    }

    pub fn with_error(
        mut self,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.result = OperationResult::Failure;
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, serde_json::Value>) -> Self {
        if let Some(AuditDetail::Database(ref mut d)) = self.detail {
            d.parameters = parameters;
        }
        self
    }

    /// Record before/after snapshots; the changed-field diff is computed
    /// here so the persisted event is self-contained.
    pub fn with_before_after(
        mut self,
        before: BTreeMap<String, serde_json::Value>,
        after: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        if let Some(AuditDetail::Database(ref mut d)) = self.detail {
            d.changed_fields = changed_fields(&before, &after);
            d.before = Some(before);
            d.after = Some(after);
        }
        self
    }

    pub fn with_rows_affected(mut self, rows_affected: u64) -> Self {
        if let Some(AuditDetail::Database(ref mut d)) = self.detail {
            d.rows_affected = Some(rows_affected);
        }
        self
    }

    pub fn with_execution_time_ms(mut self, execution_time_ms: u64) -> Self {
        self.duration_ms = Some(execution_time_ms);
        if let Some(AuditDetail::Database(ref mut d)) = self.detail {
            d.execution_time_ms = Some(execution_time_ms);
        }
        self
    }

    /// Risk score is clamped into [0, 1].
    pub fn with_risk_score(mut self, score: f64) -> Self {
        if let Some(AuditDetail::Security(ref mut d)) = self.detail {
            d.risk_score = Some(score.clamp(0.0, 1.0));
        }
        self
    }

    pub fn with_threat_indicators(mut self, indicators: Vec<String>) -> Self {
        if let Some(AuditDetail::Security(ref mut d)) = self.detail {
            d.threat_indicators = indicators;
        }
        self
    }

    pub fn with_authentication_method(mut self, method: impl Into<String>) -> Self {
        if let Some(AuditDetail::Security(ref mut d)) = self.detail {
            d.authentication_method = Some(method.into());
        }
        self
    }

    pub fn with_permissions(
        mut self,
        required: Vec<String>,
        held: Vec<String>,
    ) -> Self {
        if let Some(AuditDetail::Security(ref mut d)) = self.detail {
            d.required_permissions = required;
            d.user_permissions = held;
        }
        self
    }
}
