//! The closed procedure registry.
//!
//! Tool-name dispatch goes through a registry built once at startup.
//! Registration validates the procedure name, its SQL against the risk
//! classifier, and its parameter declarations against the placeholders the
//! SQL actually uses, so a bad registration fails the process at startup,
//! never a caller at request time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use procgate_core::{
    GateError, OperationKind, ParamDirection, Result, SqlRiskClassifier, SqlType, ToolClass,
};
use serde::Deserialize;

/// Maximum length for a procedure name
pub const MAX_PROCEDURE_NAME_LEN: usize = 100;

/// One declared parameter of a registered procedure.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub sql_type: SqlType,
    #[serde(default = "default_direction")]
    pub direction: ParamDirection,
    /// Input parameters only: whether the caller must supply a non-null
    /// value
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_direction() -> ParamDirection {
    ParamDirection::Input
}

fn default_required() -> bool {
    true
}

impl ParamSpec {
    pub fn input(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            direction: ParamDirection::Input,
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_direction(mut self, direction: ParamDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// A registered procedure: vetted, parameterized SQL plus its calling
/// convention.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcedureSpec {
    pub name: String,
    pub sql: String,
    pub operation: OperationKind,
    pub tool_class: ToolClass,
    /// Whether a transient failure may be retried transparently
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Per-procedure command timeout override, in milliseconds
    #[serde(default, rename = "timeout_ms")]
    pub timeout_ms: Option<u64>,
}

impl ProcedureSpec {
    /// A read procedure: read-only tool class, retried transparently.
    pub fn read(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            operation: OperationKind::Read,
            tool_class: ToolClass::ReadOnly,
            idempotent: true,
            params: Vec::new(),
            timeout_ms: None,
        }
    }

    /// A data-modifying procedure. Not idempotent unless explicitly marked.
    pub fn write(
        name: impl Into<String>,
        sql: impl Into<String>,
        operation: OperationKind,
    ) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            operation,
            tool_class: ToolClass::ReadWrite,
            idempotent: false,
            params: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// The closed set of invocable procedures, resolved once at startup.
#[derive(Debug, Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<String, Arc<ProcedureSpec>>,
}

impl ProcedureRegistry {
    pub fn builder() -> ProcedureRegistryBuilder {
        ProcedureRegistryBuilder {
            classifier: SqlRiskClassifier::new(),
            procedures: HashMap::new(),
        }
    }

    /// Build a registry from a JSON manifest: an array of procedure specs.
    pub fn from_manifest_json(manifest: &str) -> Result<Self> {
        let specs: Vec<ProcedureSpec> = serde_json::from_str(manifest)
            .map_err(|e| GateError::configuration(format!("invalid procedure manifest: {e}")))?;
        let mut builder = Self::builder();
        for spec in specs {
            builder = builder.register(spec)?;
        }
        Ok(builder.build())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcedureSpec>> {
        self.procedures.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(|k| k.as_str())
    }
}

/// Validating registry builder.
#[derive(Debug)]
pub struct ProcedureRegistryBuilder {
    classifier: SqlRiskClassifier,
    procedures: HashMap<String, Arc<ProcedureSpec>>,
}

impl ProcedureRegistryBuilder {
    /// Register a procedure, validating it fully. Errors here are
    /// [`GateError::configuration`] failures meant to stop startup.
    pub fn register(mut self, spec: ProcedureSpec) -> Result<Self> {
        validate_procedure_name(&spec.name)?;

        if self.procedures.contains_key(&spec.name) {
            return Err(GateError::configuration(format!(
                "duplicate procedure registration: '{}'",
                spec.name
            )));
        }

        let verdict = self.classifier.classify(&spec.sql, spec.tool_class);
        if !verdict.is_allowed() {
            let reasons: Vec<String> =
                verdict.reasons().iter().map(|r| r.to_string()).collect();
            return Err(GateError::configuration(format!(
                "procedure '{}' failed risk screening: {}",
                spec.name,
                reasons.join(", ")
            )));
        }

        validate_param_declarations(&spec)?;

        self.procedures
            .insert(spec.name.clone(), Arc::new(spec));
        Ok(self)
    }

    pub fn build(self) -> ProcedureRegistry {
        ProcedureRegistry {
            procedures: self.procedures,
        }
    }
}

/// Procedure names: non-empty, bounded, alphanumeric/underscore/hyphen.
fn validate_procedure_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GateError::configuration("procedure name cannot be empty"));
    }
    if name.len() > MAX_PROCEDURE_NAME_LEN {
        return Err(GateError::configuration(format!(
            "procedure name too long: {} > {} characters",
            name.len(),
            MAX_PROCEDURE_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(GateError::configuration(format!(
            "procedure name '{name}' contains invalid characters (allowed: alphanumeric, _, -)"
        )));
    }
    Ok(())
}

/// Cross-check declared parameters against the `:name` placeholders the SQL
/// actually uses.
fn validate_param_declarations(spec: &ProcedureSpec) -> Result<()> {
    let mut seen = HashSet::new();
    for param in &spec.params {
        if param.name.is_empty()
            || !param
                .name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_')
        {
            return Err(GateError::configuration(format!(
                "procedure '{}' declares invalid parameter name '{}'",
                spec.name, param.name
            )));
        }
        if !seen.insert(param.name.as_str()) {
            return Err(GateError::configuration(format!(
                "procedure '{}' declares parameter '{}' twice",
                spec.name, param.name
            )));
        }
    }

    let placeholders = sql_placeholders(&spec.sql);

    for placeholder in &placeholders {
        let declared = spec
            .params
            .iter()
            .any(|p| p.direction.accepts_input() && &p.name == placeholder);
        if !declared {
            return Err(GateError::configuration(format!(
                "procedure '{}' uses placeholder ':{}' with no matching input parameter",
                spec.name, placeholder
            )));
        }
    }

    for param in spec.params.iter().filter(|p| p.direction.accepts_input()) {
        if !placeholders.contains(&param.name) {
            return Err(GateError::configuration(format!(
                "procedure '{}' declares input parameter '{}' not used by its SQL",
                spec.name, param.name
            )));
        }
    }

    Ok(())
}

/// Extract `:name` placeholders from SQL, skipping quoted strings.
fn sql_placeholders(sql: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if c == '\'' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                i += 1;
            }
            ':' => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() {
                    let c = bytes[end] as char;
                    if c.is_alphanumeric() || c == '_' {
                        end += 1;
                    } else {
                        break;
                    }
                }
                if end > start {
                    names.insert(sql[start..end].to_string());
                }
                i = end.max(start);
            }
            _ => i += 1,
        }
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_spec() -> ProcedureSpec {
        ProcedureSpec::read(
            "list_customers",
            "SELECT id, name FROM customers WHERE region = :region",
        )
        .with_params(vec![ParamSpec::input("region", SqlType::Text)])
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ProcedureRegistry::builder()
            .register(list_spec())
            .unwrap()
            .build();

        assert_eq!(registry.len(), 1);
        let spec = registry.get("list_customers").unwrap();
        assert_eq!(spec.operation, OperationKind::Read);
        assert!(spec.idempotent);
        assert!(registry.get("unknown_tool").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let err = ProcedureRegistry::builder()
            .register(list_spec())
            .unwrap()
            .register(list_spec())
            .unwrap_err();
        assert_eq!(err.code(), "configuration");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let too_long = "x".repeat(101);
        for name in ["", "drop table", "p@yments", too_long.as_str()] {
            let spec = ProcedureSpec::read(name, "SELECT 1");
            assert!(
                ProcedureRegistry::builder().register(spec).is_err(),
                "name {name:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_risky_sql_rejected_at_registration() {
        // DDL never registers
        let spec = ProcedureSpec::write("drop_it", "DROP TABLE customers", OperationKind::Execute);
        let err = ProcedureRegistry::builder().register(spec).unwrap_err();
        assert!(err.to_string().contains("risk screening"));

        // DML in a read-only tool class never registers
        let spec = ProcedureSpec::read("sneaky", "DELETE FROM customers WHERE id = :id")
            .with_params(vec![ParamSpec::input("id", SqlType::Integer)]);
        assert!(ProcedureRegistry::builder().register(spec).is_err());

        // The same DML is registrable as a write-enabled procedure
        let spec = ProcedureSpec::write(
            "delete_customer",
            "DELETE FROM customers WHERE id = :id",
            OperationKind::Delete,
        )
        .with_params(vec![ParamSpec::input("id", SqlType::Integer)]);
        assert!(ProcedureRegistry::builder().register(spec).is_ok());
    }

    #[test]
    fn test_placeholder_declaration_mismatch_rejected() {
        // SQL uses :region, nothing declared
        let spec = ProcedureSpec::read(
            "list_customers",
            "SELECT id FROM customers WHERE region = :region",
        );
        let err = ProcedureRegistry::builder().register(spec).unwrap_err();
        assert!(err.to_string().contains(":region"));

        // Declared parameter unused by the SQL
        let spec = ProcedureSpec::read("count_customers", "SELECT COUNT(*) FROM customers")
            .with_params(vec![ParamSpec::input("region", SqlType::Text)]);
        let err = ProcedureRegistry::builder().register(spec).unwrap_err();
        assert!(err.to_string().contains("not used"));
    }

    #[test]
    fn test_placeholder_scan_skips_string_literals() {
        let names = sql_placeholders(
            "SELECT ':not_a_param', id FROM t WHERE a = :alpha AND b = :beta_2",
        );
        assert_eq!(names.len(), 2);
        assert!(names.contains("alpha"));
        assert!(names.contains("beta_2"));
    }

    #[test]
    fn test_duplicate_param_declaration_rejected() {
        let spec = ProcedureSpec::read(
            "list_customers",
            "SELECT id FROM customers WHERE region = :region",
        )
        .with_params(vec![
            ParamSpec::input("region", SqlType::Text),
            ParamSpec::input("region", SqlType::Text),
        ]);
        let err = ProcedureRegistry::builder().register(spec).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = r#"[
            {
                "name": "list_customers",
                "sql": "SELECT id, name FROM customers WHERE region = :region",
                "operation": "read",
                "tool_class": "read_only",
                "idempotent": true,
                "params": [
                    {"name": "region", "sql_type": "text"}
                ]
            },
            {
                "name": "rename_customer",
                "sql": "UPDATE customers SET name = :name WHERE id = :id",
                "operation": "update",
                "tool_class": "read_write",
                "params": [
                    {"name": "id", "sql_type": "integer"},
                    {"name": "name", "sql_type": "text"}
                ],
                "timeout_ms": 5000
            }
        ]"#;

        let registry = ProcedureRegistry::from_manifest_json(manifest).unwrap();
        assert_eq!(registry.len(), 2);
        let spec = registry.get("rename_customer").unwrap();
        assert_eq!(spec.timeout(), Some(Duration::from_millis(5000)));
        assert!(!spec.idempotent);
    }

    #[test]
    fn test_manifest_with_unknown_procedure_shape_fails() {
        let err = ProcedureRegistry::from_manifest_json("[{\"name\": \"x\"}]").unwrap_err();
        assert_eq!(err.code(), "configuration");
    }
}
