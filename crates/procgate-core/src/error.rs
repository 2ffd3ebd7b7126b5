//! Error taxonomy and message sanitization for ProcGate
//!
//! Every failure in the gateway is a [`GateError`]: a typed kind plus a
//! correlation id, a UTC timestamp, and a structured details bag. The
//! diagnostic rendering (`Display`) is log-only; callers receive
//! [`GateError::safe_message`], which never interpolates identifiers, raw
//! command text, or parameter values.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::CorrelationId;

/// SQLite primary result codes classified as transient: SQLITE_BUSY,
/// SQLITE_LOCKED, SQLITE_CANTOPEN. Constraint violations (19) are
/// deliberately absent: retrying a write that may already have taken effect
/// is not safe.
pub const TRANSIENT_VENDOR_CODES: &[i32] = &[5, 6, 14];

/// Field-level validation errors, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an error message for a field.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn as_map(&self) -> &BTreeMap<String, Vec<String>> {
        &self.0
    }

    /// One line per field: `field: message; message`.
    pub fn formatted(&self) -> String {
        self.0
            .iter()
            .map(|(field, messages)| format!("{}: {}", field, messages.join("; ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field, messages.join("; "))?;
            first = false;
        }
        Ok(())
    }
}

/// Sub-kind of a security failure. The safe message is fixed per sub-kind;
/// identity, addresses, and indicators live only in the details bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityErrorKind {
    AuthenticationFailure,
    AuthorizationFailure,
    SuspiciousActivity,
}

impl SecurityErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityErrorKind::AuthenticationFailure => "authentication_failure",
            SecurityErrorKind::AuthorizationFailure => "authorization_failure",
            SecurityErrorKind::SuspiciousActivity => "suspicious_activity",
        }
    }
}

/// The closed set of failure classifications.
///
/// `Display` is the diagnostic rendering and may contain sensitive detail;
/// it is for logs only. Caller-facing text comes from
/// [`GateError::safe_message`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("validation failed: {0}")]
    Validation(FieldErrors),

    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: String,
        resource_id: String,
    },

    #[error("security violation ({}): {message}", .kind.as_str())]
    Security {
        kind: SecurityErrorKind,
        message: String,
    },

    #[error("database failure (code {code:?}): {message}")]
    Database {
        /// Vendor error code, when the driver surfaced one
        code: Option<i32>,
        /// Classified from [`TRANSIENT_VENDOR_CODES`] at construction
        transient: bool,
        message: String,
    },

    #[error("business rule '{rule}' violated: {message}")]
    BusinessRule { rule: String, message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("external service '{service}' failure: {message}")]
    ExternalService { service: String, message: String },

    #[error("operation cancelled by caller")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// A classified gateway failure.
#[derive(Debug, Clone)]
pub struct GateError {
    pub kind: ErrorKind,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    /// Structured diagnostic context. Log-only; never rendered to callers.
    pub details: BTreeMap<String, String>,
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for GateError {}

impl GateError {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            correlation_id: CorrelationId::new(),
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn validation(errors: FieldErrors) -> Self {
        Self::new(ErrorKind::Validation(errors))
    }

    /// Convenience for a single-field validation failure.
    pub fn validation_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.add(field, message);
        Self::validation(errors)
    }

    pub fn not_found(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        })
    }

    pub fn security(kind: SecurityErrorKind, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security {
            kind,
            message: message.into(),
        })
    }

    pub fn database(code: Option<i32>, message: impl Into<String>) -> Self {
        let transient = code.is_some_and(|c| TRANSIENT_VENDOR_CODES.contains(&c));
        Self::new(ErrorKind::Database {
            code,
            transient,
            message: message.into(),
        })
    }

    /// A command-timeout failure. Timeouts are transient by policy: the
    /// statement was interrupted and retrying may succeed.
    pub fn database_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database {
            code: None,
            transient: true,
            message: message.into(),
        })
    }

    /// The fixed classification surfaced while the circuit breaker is open.
    pub fn circuit_open(consecutive_failures: u32) -> Self {
        Self::new(ErrorKind::Database {
            code: None,
            transient: false,
            message: format!(
                "circuit breaker open after {consecutive_failures} consecutive failures"
            ),
        })
        .with_detail("circuit_state", "open")
    }

    pub fn business_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessRule {
            rule: rule.into(),
            message: message.into(),
        })
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration {
            message: message.into(),
        })
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(ErrorKind::RateLimited { retry_after_secs })
    }

    pub fn external_service(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalService {
            service: service.into(),
            message: message.into(),
        })
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal {
            message: message.into(),
        })
    }

    /// Thread an existing correlation id through this error.
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }

    /// Attach a diagnostic key/value to the details bag.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Whether a retry of the failed operation may succeed unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Database { transient: true, .. })
    }

    /// Short machine-readable code for the audit store and response body.
    pub fn code(&self) -> &'static str {
        match &self.kind {
            ErrorKind::Validation(_) => "validation",
            ErrorKind::NotFound { .. } => "not_found",
            ErrorKind::Security { kind, .. } => kind.as_str(),
            ErrorKind::Database { .. } => "database",
            ErrorKind::BusinessRule { .. } => "business_rule",
            ErrorKind::Configuration { .. } => "configuration",
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::ExternalService { .. } => "external_service",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal { .. } => "internal",
        }
    }

    /// The caller-facing rendering of this failure.
    ///
    /// Fixed templates everywhere the condition could carry sensitive
    /// detail; mirrored only for validation and business-rule failures,
    /// whose messages are intentionally user-facing.
    pub fn safe_message(&self) -> String {
        match &self.kind {
            ErrorKind::Validation(errors) => format!("validation failed: {errors}"),
            ErrorKind::NotFound { resource_type, .. } => {
                format!("{resource_type} not found")
            }
            ErrorKind::Security { kind, .. } => match kind {
                SecurityErrorKind::AuthenticationFailure => "Authentication failed.".to_string(),
                SecurityErrorKind::AuthorizationFailure => {
                    "You do not have permission to perform this operation.".to_string()
                }
                SecurityErrorKind::SuspiciousActivity => {
                    "The request was blocked by security policy.".to_string()
                }
            },
            ErrorKind::Database { .. } => {
                "A database error occurred. Please try again later.".to_string()
            }
            ErrorKind::BusinessRule { rule, message } => {
                format!("{rule}: {message}")
            }
            ErrorKind::Configuration { .. } => {
                "The service is misconfigured. Please contact support.".to_string()
            }
            ErrorKind::RateLimited { .. } => {
                "Too many requests. Please retry after the specified time.".to_string()
            }
            ErrorKind::ExternalService { .. } => {
                "An upstream service is currently unavailable.".to_string()
            }
            ErrorKind::Cancelled => "The request was cancelled.".to_string(),
            ErrorKind::Internal { .. } => {
                "Internal server error. Please contact support with the correlation ID."
                    .to_string()
            }
        }
    }

    /// Field errors, when this is a validation failure.
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match &self.kind {
            ErrorKind::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_errors_accumulate() {
        let mut errors = FieldErrors::new();
        assert!(!errors.has_errors());

        errors.add("name", "cannot be empty");
        errors.add("name", "too long");
        errors.add("amount", "must be positive");

        assert!(errors.has_errors());
        let formatted = errors.formatted();
        assert!(formatted.contains("name: cannot be empty; too long"));
        assert!(formatted.contains("amount: must be positive"));
        // Every field appears in the formatted view
        for field in errors.fields() {
            assert!(formatted.contains(field));
        }
    }

    #[test]
    fn test_validation_mirrors_message() {
        let err = GateError::validation_field("name", "cannot be empty");
        assert!(err.safe_message().contains("name: cannot be empty"));
        assert!(err.field_errors().unwrap().has_errors());
    }

    #[test]
    fn test_not_found_template_omits_identifier() {
        let err = GateError::not_found("procedure", "payments_by_customer_2024");
        assert_eq!(err.safe_message(), "procedure not found");
        assert!(!err.safe_message().contains("payments_by_customer_2024"));
        // Diagnostic rendering keeps the identifier for logs
        assert!(err.to_string().contains("payments_by_customer_2024"));
    }

    #[test]
    fn test_security_safe_message_is_fixed_template() {
        // Diagnostic carries a literal email and IP address
        let err = GateError::security(
            SecurityErrorKind::AuthorizationFailure,
            "user dana@example.com from 10.1.2.3 denied access to payroll",
        )
        .with_detail("ip_address", "10.1.2.3")
        .with_detail("user", "dana@example.com");

        assert_eq!(
            err.safe_message(),
            "You do not have permission to perform this operation."
        );
        assert!(!err.safe_message().contains("dana@example.com"));
        assert!(!err.safe_message().contains("10.1.2.3"));
        // Details keep the diagnostics for log correlation
        assert_eq!(err.details.get("ip_address").unwrap(), "10.1.2.3");
    }

    #[test]
    fn test_security_sub_kind_templates_differ() {
        let authn = GateError::security(SecurityErrorKind::AuthenticationFailure, "bad token");
        let authz = GateError::security(SecurityErrorKind::AuthorizationFailure, "no role");
        let sus = GateError::security(SecurityErrorKind::SuspiciousActivity, "tautology");
        assert_ne!(authn.safe_message(), authz.safe_message());
        assert_ne!(authz.safe_message(), sus.safe_message());
    }

    #[test]
    fn test_database_safe_message_never_leaks_diagnostics() {
        let sensitive = [
            "UNIQUE constraint failed: customers.email",
            "no such table: payroll_2024",
            "SELECT * FROM secret_table WHERE ssn = '123-45-6789'",
        ];
        for message in sensitive {
            let err = GateError::database(Some(19), message);
            let safe = err.safe_message();
            for token in ["customers", "payroll_2024", "secret_table", "ssn", "123-45"] {
                assert!(!safe.contains(token), "leaked {token:?} in {safe:?}");
            }
        }
    }

    #[test]
    fn test_transient_classification_from_vendor_codes() {
        assert!(GateError::database(Some(5), "database is locked").is_transient());
        assert!(GateError::database(Some(6), "table is locked").is_transient());
        assert!(GateError::database(Some(14), "unable to open database file").is_transient());
        // Constraint violation is permanent by policy
        assert!(!GateError::database(Some(19), "UNIQUE constraint failed").is_transient());
        assert!(!GateError::database(None, "unknown failure").is_transient());
        assert!(GateError::database_timeout("interrupted").is_transient());
    }

    #[test]
    fn test_correlation_id_generated_and_overridable() {
        let err = GateError::internal("boom");
        let supplied = crate::CorrelationId::new();
        let err = err.with_correlation_id(supplied);
        assert_eq!(err.correlation_id, supplied);
    }

    #[test]
    fn test_business_rule_mirrors_message() {
        let err = GateError::business_rule("max_rows", "result set exceeds 10000 rows");
        assert!(err.safe_message().contains("result set exceeds 10000 rows"));
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let err = GateError::rate_limited(42);
        match err.kind {
            ErrorKind::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 42),
            _ => panic!("wrong kind"),
        }
        assert_eq!(err.code(), "rate_limited");
    }

    #[test]
    fn test_circuit_open_is_database_classification() {
        let err = GateError::circuit_open(5);
        assert_eq!(err.code(), "database");
        assert!(!err.is_transient());
        assert_eq!(err.details.get("circuit_state").unwrap(), "open");
    }
}
