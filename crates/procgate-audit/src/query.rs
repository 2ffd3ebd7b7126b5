//! Authorized audit queries and the retention sweep.
//!
//! Row-level visibility is enforced here, in application code: a principal
//! without the auditor role only ever sees events whose actor id matches
//! their own, regardless of the filters they pass.

use chrono::{DateTime, Duration, Utc};
use procgate_core::Actor;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AuditDetail;

/// Role that grants visibility over all actors' audit events.
pub const AUDITOR_ROLE: &str = "auditor";

/// The principal running an audit query.
#[derive(Debug, Clone)]
pub struct AuditPrincipal {
    pub actor_id: String,
    pub roles: Vec<String>,
}

impl AuditPrincipal {
    pub fn new(actor_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            roles,
        }
    }

    pub fn from_actor(actor: &Actor) -> Self {
        Self {
            actor_id: actor.id.clone(),
            roles: actor.roles.clone(),
        }
    }

    pub fn is_auditor(&self) -> bool {
        self.roles.iter().any(|r| r == AUDITOR_ROLE)
    }
}

/// Caller-supplied filters for an audit query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQueryFilter {
    pub event_type: Option<String>,
    pub action: Option<String>,
    pub actor_id: Option<String>,
    pub correlation_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub result: Option<String>,
    /// Maximum number of results (default: 100, capped at 1000)
    pub limit: Option<i64>,
    /// Offset for pagination (default: 0)
    pub offset: Option<i64>,
}

/// One persisted audit event as returned by the query path.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEventRow {
    pub id: i64,
    pub event_type: String,
    pub event_sub_type: String,
    pub timestamp: String,
    pub correlation_id: String,
    pub actor_id: Option<String>,
    pub actor_name: Option<String>,
    pub actor_roles: Option<String>,
    pub ip_address: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub action: String,
    pub result: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub additional_data: Option<AuditDetail>,
}

/// A page of audit events.
#[derive(Debug, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEventRow>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Query audit events visible to the principal.
pub fn query_audit_events(
    conn: &Connection,
    principal: &AuditPrincipal,
    filter: &AuditQueryFilter,
) -> Result<AuditPage, rusqlite::Error> {
    let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
    let offset = filter.offset.unwrap_or(0).max(0);

    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    // Visibility scope comes first and cannot be widened by caller filters
    if !principal.is_auditor() {
        conditions.push("actor_id = ?".to_string());
        values.push(Box::new(principal.actor_id.clone()));
    }

    if let Some(ref event_type) = filter.event_type {
        conditions.push("event_type = ?".to_string());
        values.push(Box::new(event_type.clone()));
    }
    if let Some(ref action) = filter.action {
        conditions.push("action = ?".to_string());
        values.push(Box::new(action.clone()));
    }
    if let Some(ref actor_id) = filter.actor_id {
        conditions.push("actor_id = ?".to_string());
        values.push(Box::new(actor_id.clone()));
    }
    if let Some(ref correlation_id) = filter.correlation_id {
        conditions.push("correlation_id = ?".to_string());
        values.push(Box::new(correlation_id.clone()));
    }
    if let Some(ref resource_type) = filter.resource_type {
        conditions.push("resource_type = ?".to_string());
        values.push(Box::new(resource_type.clone()));
    }
    if let Some(ref resource_id) = filter.resource_id {
        conditions.push("resource_id = ?".to_string());
        values.push(Box::new(resource_id.clone()));
    }
    if let Some(ref result) = filter.result {
        conditions.push("result = ?".to_string());
        values.push(Box::new(result.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM audit_event {}", where_clause);
    let total: i64 = {
        let mut stmt = conn.prepare(&count_sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
        stmt.query_row(params_ref.as_slice(), |row| row.get(0))?
    };

    let query_sql = format!(
        r#"
        SELECT id, event_type, event_sub_type, timestamp, correlation_id,
               actor_id, actor_name, actor_roles, ip_address,
               resource_type, resource_id, resource_name,
               action, result, error_code, error_message, duration_ms,
               additional_data
        FROM audit_event
        {}
        ORDER BY timestamp DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
        where_clause
    );

    let mut stmt = conn.prepare(&query_sql)?;
    values.push(Box::new(limit));
    values.push(Box::new(offset));
    let params_ref: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();

    let entries: Vec<AuditEventRow> = stmt
        .query_map(params_ref.as_slice(), |row| {
            let additional_data: Option<String> = row.get(17)?;
            Ok(AuditEventRow {
                id: row.get(0)?,
                event_type: row.get(1)?,
                event_sub_type: row.get(2)?,
                timestamp: row.get(3)?,
                correlation_id: row.get(4)?,
                actor_id: row.get(5)?,
                actor_name: row.get(6)?,
                actor_roles: row.get(7)?,
                ip_address: row.get(8)?,
                resource_type: row.get(9)?,
                resource_id: row.get(10)?,
                resource_name: row.get(11)?,
                action: row.get(12)?,
                result: row.get(13)?,
                error_code: row.get(14)?,
                error_message: row.get(15)?,
                duration_ms: row.get(16)?,
                additional_data: additional_data.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AuditPage {
        entries,
        total,
        limit,
        offset,
    })
}

/// How long audit events are retained, in days.
///
/// Security events are compliance-flagged and kept longer than routine
/// database events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub routine_days: u16,
    pub security_days: u16,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            routine_days: 90,
            security_days: 365,
        }
    }
}

impl RetentionPolicy {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            routine_days: std::env::var("PROCGATE_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.routine_days),
            security_days: std::env::var("PROCGATE_AUDIT_SECURITY_RETENTION_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.security_days),
        }
    }
}

/// Result of one retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeResult {
    pub deleted_routine: u64,
    pub deleted_security: u64,
}

impl PurgeResult {
    pub fn deleted_total(&self) -> u64 {
        self.deleted_routine + self.deleted_security
    }
}

/// Delete events past their retention window. The only sanctioned deletion
/// path for audit events.
pub fn purge_expired(
    conn: &Connection,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<PurgeResult, rusqlite::Error> {
    let routine_cutoff = (now - Duration::days(policy.routine_days as i64)).to_rfc3339();
    let security_cutoff = (now - Duration::days(policy.security_days as i64)).to_rfc3339();

    let deleted_routine = conn.execute(
        "DELETE FROM audit_event WHERE event_type != 'security' AND timestamp < ?1",
        [&routine_cutoff],
    )? as u64;

    let deleted_security = conn.execute(
        "DELETE FROM audit_event WHERE event_type = 'security' AND timestamp < ?1",
        [&security_cutoff],
    )? as u64;

    let result = PurgeResult {
        deleted_routine,
        deleted_security,
    };
    if result.deleted_total() > 0 {
        info!(
            deleted_routine,
            deleted_security,
            routine_days = policy.routine_days,
            security_days = policy.security_days,
            "Audit retention sweep completed"
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::write_events_to_db;
    use crate::{AuditEvent, SecurityEventType};
    use procgate_core::{Actor, CorrelationId, OperationKind};
    use procgate_storage::{LocalSqliteBackend, ProcedureBackend};
    use tempfile::NamedTempFile;

    fn seeded_conn() -> (NamedTempFile, Connection) {
        let file = NamedTempFile::new().unwrap();
        let backend = LocalSqliteBackend::new(file.path());
        let conn = backend.get_connection().unwrap();

        let events = vec![
            AuditEvent::database(
                OperationKind::Read,
                "list_customers",
                "ExecuteQuery",
                CorrelationId::new(),
            )
            .with_actor(Actor::new("alice")),
            AuditEvent::database(
                OperationKind::Update,
                "update_limit",
                "ExecuteNonQuery",
                CorrelationId::new(),
            )
            .with_actor(Actor::new("bob")),
            AuditEvent::security(
                SecurityEventType::PermissionDenied,
                "audit_query",
                CorrelationId::new(),
            )
            .with_actor(Actor::new("alice")),
        ];
        write_events_to_db(&conn, &events).unwrap();
        (file, conn)
    }

    #[test]
    fn test_auditor_sees_all_events() {
        let (_file, conn) = seeded_conn();
        let principal = AuditPrincipal::new("carol", vec![AUDITOR_ROLE.to_string()]);

        let page = query_audit_events(&conn, &principal, &AuditQueryFilter::default()).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.entries.len(), 3);
    }

    #[test]
    fn test_non_auditor_scoped_to_own_events() {
        let (_file, conn) = seeded_conn();
        let principal = AuditPrincipal::new("alice", vec!["analyst".to_string()]);

        let page = query_audit_events(&conn, &principal, &AuditQueryFilter::default()).unwrap();
        assert_eq!(page.total, 2);
        assert!(page
            .entries
            .iter()
            .all(|e| e.actor_id.as_deref() == Some("alice")));
    }

    #[test]
    fn test_scope_cannot_be_widened_by_filter() {
        let (_file, conn) = seeded_conn();
        let principal = AuditPrincipal::new("alice", vec![]);

        // Alice asks for Bob's events; the visibility predicate wins
        let filter = AuditQueryFilter {
            actor_id: Some("bob".to_string()),
            ..Default::default()
        };
        let page = query_audit_events(&conn, &principal, &filter).unwrap();
        assert_eq!(page.total, 0);
    }

    #[test]
    fn test_filters_and_pagination() {
        let (_file, conn) = seeded_conn();
        let principal = AuditPrincipal::new("carol", vec![AUDITOR_ROLE.to_string()]);

        let filter = AuditQueryFilter {
            event_type: Some("database".to_string()),
            ..Default::default()
        };
        let page = query_audit_events(&conn, &principal, &filter).unwrap();
        assert_eq!(page.total, 2);

        let filter = AuditQueryFilter {
            limit: Some(1),
            offset: Some(0),
            ..Default::default()
        };
        let page = query_audit_events(&conn, &principal, &filter).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.limit, 1);
    }

    #[test]
    fn test_query_by_correlation_id() {
        let (_file, conn) = seeded_conn();
        let principal = AuditPrincipal::new("carol", vec![AUDITOR_ROLE.to_string()]);

        let cid: String = conn
            .query_row(
                "SELECT correlation_id FROM audit_event WHERE action = 'ExecuteQuery'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        let filter = AuditQueryFilter {
            correlation_id: Some(cid.clone()),
            ..Default::default()
        };
        let page = query_audit_events(&conn, &principal, &filter).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].correlation_id, cid);
    }

    #[test]
    fn test_purge_respects_split_retention() {
        let (_file, conn) = seeded_conn();
        let policy = RetentionPolicy {
            routine_days: 30,
            security_days: 365,
        };

        // Nothing is old enough yet
        let result = purge_expired(&conn, &policy, Utc::now()).unwrap();
        assert_eq!(result.deleted_total(), 0);

        // 40 days in the future: routine events expire, security survives
        let later = Utc::now() + Duration::days(40);
        let result = purge_expired(&conn, &policy, later).unwrap();
        assert_eq!(result.deleted_routine, 2);
        assert_eq!(result.deleted_security, 0);

        // Past the security window everything goes
        let much_later = Utc::now() + Duration::days(400);
        let result = purge_expired(&conn, &policy, much_later).unwrap();
        assert_eq!(result.deleted_security, 1);
    }
}
