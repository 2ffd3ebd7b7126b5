//! Typed parameter and result model for registered procedures
//!
//! Parameters carry an explicit name, value, direction, and declared type.
//! Results are returned by value: rows, output parameter values, affected
//! row count, execution time, and an optional return value. Callers never
//! pass mutable reference objects to be filled in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parameter direction in the stored-procedure calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamDirection {
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl ParamDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamDirection::Input => "input",
            ParamDirection::Output => "output",
            ParamDirection::InputOutput => "input_output",
            ParamDirection::ReturnValue => "return_value",
        }
    }

    /// Whether a caller-supplied value is consumed for this direction.
    pub fn accepts_input(&self) -> bool {
        matches!(self, ParamDirection::Input | ParamDirection::InputOutput)
    }

    /// Whether a value is surfaced back to the caller for this direction.
    pub fn produces_output(&self) -> bool {
        matches!(
            self,
            ParamDirection::Output | ParamDirection::InputOutput | ParamDirection::ReturnValue
        )
    }
}

/// Declared parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    Timestamp,
}

impl SqlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Integer => "integer",
            SqlType::Real => "real",
            SqlType::Text => "text",
            SqlType::Blob => "blob",
            SqlType::Boolean => "boolean",
            SqlType::Timestamp => "timestamp",
        }
    }
}

/// A parameter value.
///
/// The untagged serde representation maps naturally onto JSON request
/// bodies: numbers, strings, booleans, and null bind without ceremony.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ParamValue {
    /// Whether this value conforms to a declared type. `Null` conforms to
    /// every type; nullability is enforced separately by the registry.
    pub fn conforms_to(&self, declared: SqlType) -> bool {
        match (self, declared) {
            (ParamValue::Null, _) => true,
            (ParamValue::Integer(_), SqlType::Integer) => true,
            (ParamValue::Real(_), SqlType::Real) => true,
            // Integers are accepted where reals are declared
            (ParamValue::Integer(_), SqlType::Real) => true,
            (ParamValue::Text(_), SqlType::Text) => true,
            (ParamValue::Blob(_), SqlType::Blob) => true,
            (ParamValue::Boolean(_), SqlType::Boolean) => true,
            (ParamValue::Text(s), SqlType::Timestamp) => {
                s.parse::<DateTime<Utc>>().is_ok()
            }
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Null => "null",
            ParamValue::Boolean(_) => "boolean",
            ParamValue::Integer(_) => "integer",
            ParamValue::Real(_) => "real",
            ParamValue::Text(_) => "text",
            ParamValue::Blob(_) => "blob",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ParamValue::Null,
            serde_json::Value::Bool(b) => ParamValue::Boolean(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ParamValue::Integer(i)
                } else {
                    ParamValue::Real(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => ParamValue::Text(s),
            // Arrays and objects are not bindable scalars; carried as JSON
            // text so the registry type check can reject them clearly
            other => ParamValue::Text(other.to_string()),
        }
    }
}

/// A named, directioned, typed parameter for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureParameter {
    pub name: String,
    pub value: ParamValue,
    pub direction: ParamDirection,
    pub sql_type: SqlType,
}

impl ProcedureParameter {
    pub fn input(name: impl Into<String>, value: ParamValue, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            value,
            direction: ParamDirection::Input,
            sql_type,
        }
    }
}

/// One decoded result row, keyed by column name.
pub type ResultRow = BTreeMap<String, ParamValue>;

/// The complete result of one procedure invocation, returned by value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureResult {
    /// Tabular rows (empty for non-query invocations)
    pub rows: Vec<ResultRow>,
    /// Output parameter values keyed by name. Always carries
    /// `execution_time_ms`; data-modifying calls also carry
    /// `rows_affected`.
    pub output: BTreeMap<String, ParamValue>,
    /// Rows affected by a data-modifying call
    pub rows_affected: u64,
    /// Wall-clock execution time of the final attempt
    pub execution_time_ms: u64,
    /// Declared return value, when the procedure produces one
    pub return_value: Option<ParamValue>,
}

impl ProcedureResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_semantics() {
        assert!(ParamDirection::Input.accepts_input());
        assert!(ParamDirection::InputOutput.accepts_input());
        assert!(!ParamDirection::Output.accepts_input());
        assert!(ParamDirection::Output.produces_output());
        assert!(ParamDirection::ReturnValue.produces_output());
        assert!(!ParamDirection::Input.produces_output());
    }

    #[test]
    fn test_value_conforms_to_declared_type() {
        assert!(ParamValue::Integer(7).conforms_to(SqlType::Integer));
        assert!(ParamValue::Integer(7).conforms_to(SqlType::Real));
        assert!(ParamValue::Real(1.5).conforms_to(SqlType::Real));
        assert!(!ParamValue::Real(1.5).conforms_to(SqlType::Integer));
        assert!(ParamValue::Text("abc".into()).conforms_to(SqlType::Text));
        assert!(!ParamValue::Text("abc".into()).conforms_to(SqlType::Integer));
        assert!(ParamValue::Boolean(true).conforms_to(SqlType::Boolean));
        assert!(ParamValue::Null.conforms_to(SqlType::Integer));
    }

    #[test]
    fn test_timestamp_conformance_requires_parseable_text() {
        assert!(ParamValue::Text("2026-01-15T10:30:00Z".into()).conforms_to(SqlType::Timestamp));
        assert!(!ParamValue::Text("yesterday-ish".into()).conforms_to(SqlType::Timestamp));
    }

    #[test]
    fn test_from_json_value() {
        assert_eq!(
            ParamValue::from(serde_json::json!(42)),
            ParamValue::Integer(42)
        );
        assert_eq!(
            ParamValue::from(serde_json::json!(2.5)),
            ParamValue::Real(2.5)
        );
        assert_eq!(
            ParamValue::from(serde_json::json!("hi")),
            ParamValue::Text("hi".to_string())
        );
        assert_eq!(
            ParamValue::from(serde_json::json!(true)),
            ParamValue::Boolean(true)
        );
        assert_eq!(ParamValue::from(serde_json::Value::Null), ParamValue::Null);
    }

    #[test]
    fn test_result_row_count() {
        let mut result = ProcedureResult::default();
        assert_eq!(result.row_count(), 0);
        result.rows.push(ResultRow::new());
        result.rows.push(ResultRow::new());
        assert_eq!(result.row_count(), 2);
    }
}
