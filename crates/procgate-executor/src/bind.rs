//! Typed parameter binding and row decoding.
//!
//! Callers never supply SQL; this module turns a validated parameter list
//! into named bindings for a registered procedure's statement and decodes
//! the result rows back into the typed value model.

use std::collections::BTreeMap;

use procgate_core::{
    FieldErrors, GateError, ParamValue, ProcedureParameter, ProcedureResult, Result, ResultRow,
    SecurityErrorKind, SqlRiskClassifier,
};
use procgate_storage::map_sqlite_error;
use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;

use crate::registry::ProcedureSpec;

/// Synthesized output parameter: execution time of the final attempt.
pub const OUT_EXECUTION_TIME_MS: &str = "execution_time_ms";

/// Synthesized output parameter: affected row count for data-modifying
/// calls.
pub const OUT_ROWS_AFFECTED: &str = "rows_affected";

/// Whether an invocation produces rows or an affected-row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    NonQuery,
}

impl StatementKind {
    pub fn action(&self) -> &'static str {
        match self {
            StatementKind::Query => "ExecuteQuery",
            StatementKind::NonQuery => "ExecuteNonQuery",
        }
    }
}

/// A validated, ready-to-bind invocation plan.
#[derive(Debug, Clone)]
pub struct BindPlan {
    /// `:name` placeholders with their bound values
    named: Vec<(String, Value)>,
    /// Input values as bound, for the audit record
    input_json: BTreeMap<String, serde_json::Value>,
}

impl BindPlan {
    pub fn input_json(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.input_json
    }
}

/// Validate caller parameters against the procedure's declarations and
/// build the bind plan.
///
/// Failures are [`GateError::validation`] with one entry per offending
/// field, or a security classification when a string value carries an
/// injection shape.
pub fn plan(
    spec: &ProcedureSpec,
    classifier: &SqlRiskClassifier,
    params: &[ProcedureParameter],
) -> Result<BindPlan> {
    let mut errors = FieldErrors::new();

    for param in params {
        if !spec
            .params
            .iter()
            .any(|declared| declared.name == param.name)
        {
            errors.add(&param.name, "not a declared parameter of this procedure");
        }
    }

    // Screen string values before anything is bound
    for param in params {
        if let Some(text) = param.value.as_text() {
            let verdict = classifier.classify_parameter(text);
            if !verdict.is_allowed() {
                let reasons: Vec<String> =
                    verdict.reasons().iter().map(|r| r.to_string()).collect();
                return Err(GateError::security(
                    SecurityErrorKind::SuspiciousActivity,
                    format!(
                        "parameter '{}' blocked by risk screening: {}",
                        param.name,
                        reasons.join(", ")
                    ),
                )
                .with_detail("parameter", param.name.clone())
                .with_detail("block_reasons", reasons.join("; ")));
            }
        }
    }

    let mut named = Vec::new();
    let mut input_json = BTreeMap::new();

    for declared in spec.params.iter().filter(|p| p.direction.accepts_input()) {
        let supplied = params.iter().find(|p| p.name == declared.name);
        match supplied {
            Some(param) => {
                if param.value == ParamValue::Null && declared.required {
                    errors.add(&declared.name, "required parameter cannot be null");
                    continue;
                }
                if !param.value.conforms_to(declared.sql_type) {
                    errors.add(
                        &declared.name,
                        format!(
                            "expected {}, got {}",
                            declared.sql_type.as_str(),
                            param.value.type_name()
                        ),
                    );
                    continue;
                }
                input_json.insert(
                    declared.name.clone(),
                    serde_json::to_value(&param.value).unwrap_or(serde_json::Value::Null),
                );
                named.push((format!(":{}", declared.name), to_sql_value(&param.value)));
            }
            None if declared.required => {
                errors.add(&declared.name, "required parameter missing");
            }
            None => {
                input_json.insert(declared.name.clone(), serde_json::Value::Null);
                named.push((format!(":{}", declared.name), Value::Null));
            }
        }
    }

    if errors.has_errors() {
        return Err(GateError::validation(errors));
    }

    Ok(BindPlan { named, input_json })
}

/// Run a planned invocation on a connection.
///
/// Decodes rows for queries, captures the affected-row count for
/// non-queries, and synthesizes the output parameter map (declared outputs
/// resolved from the first result row, plus execution time and affected
/// rows).
pub fn run_statement(
    conn: &Connection,
    spec: &ProcedureSpec,
    plan: &BindPlan,
    kind: StatementKind,
) -> Result<ProcedureResult> {
    let started = std::time::Instant::now();

    let mut stmt = conn.prepare_cached(&spec.sql).map_err(map_sqlite_error)?;
    let bound: Vec<(&str, &dyn rusqlite::ToSql)> = plan
        .named
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql))
        .collect();

    let mut result = ProcedureResult::default();

    match kind {
        StatementKind::Query => {
            let column_names: Vec<String> = stmt
                .column_names()
                .iter()
                .map(|name| name.to_string())
                .collect();

            let mut rows = stmt.query(bound.as_slice()).map_err(map_sqlite_error)?;
            while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                let mut decoded = ResultRow::new();
                for (index, name) in column_names.iter().enumerate() {
                    let value = row.get_ref(index).map_err(map_sqlite_error)?;
                    decoded.insert(name.clone(), from_value_ref(value));
                }
                result.rows.push(decoded);
            }
        }
        StatementKind::NonQuery => {
            let affected = stmt.execute(bound.as_slice()).map_err(map_sqlite_error)?;
            result.rows_affected = affected as u64;
        }
    }

    result.execution_time_ms = started.elapsed().as_millis() as u64;

    // Declared outputs resolve from the first result row by name
    if let Some(first_row) = result.rows.first().cloned() {
        for declared in spec.params.iter().filter(|p| p.direction.produces_output()) {
            if let Some(value) = first_row.get(&declared.name) {
                if declared.direction == procgate_core::ParamDirection::ReturnValue {
                    result.return_value = Some(value.clone());
                } else {
                    result.output.insert(declared.name.clone(), value.clone());
                }
            }
        }
    }

    result.output.insert(
        OUT_EXECUTION_TIME_MS.to_string(),
        ParamValue::Integer(result.execution_time_ms as i64),
    );
    if kind == StatementKind::NonQuery {
        result.output.insert(
            OUT_ROWS_AFFECTED.to_string(),
            ParamValue::Integer(result.rows_affected as i64),
        );
    }

    Ok(result)
}

fn to_sql_value(value: &ParamValue) -> Value {
    match value {
        ParamValue::Null => Value::Null,
        ParamValue::Boolean(b) => Value::Integer(i64::from(*b)),
        ParamValue::Integer(i) => Value::Integer(*i),
        ParamValue::Real(r) => Value::Real(*r),
        ParamValue::Text(s) => Value::Text(s.clone()),
        ParamValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> ParamValue {
    match value {
        ValueRef::Null => ParamValue::Null,
        ValueRef::Integer(i) => ParamValue::Integer(i),
        ValueRef::Real(r) => ParamValue::Real(r),
        ValueRef::Text(t) => ParamValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => ParamValue::Blob(b.to_vec()),
    }
}
