//! ProcGate Core
//!
//! Core types, the error taxonomy, and command risk classification for the
//! ProcGate gateway.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod params;
pub mod sanitize;

pub use error::{ErrorKind, FieldErrors, GateError, SecurityErrorKind};
pub use params::{
    ParamDirection, ParamValue, ProcedureParameter, ProcedureResult, ResultRow, SqlType,
};
pub use sanitize::{BlockReason, SqlRiskClassifier, ToolClass, Verdict};

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Opaque identifier threading one logical operation across validation,
/// execution, audit, and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a caller-supplied correlation id. Invalid input yields a fresh
    /// id rather than an error so a malformed header can never fail a
    /// request.
    pub fn parse_or_new(raw: &str) -> Self {
        raw.parse::<Uuid>().map(Self).unwrap_or_else(|_| Self::new())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<Uuid>().map(Self)
    }
}

/// The authenticated principal on whose behalf an operation runs.
///
/// Authentication itself is a collaborator contract: the upstream router
/// resolves identity and passes it through. The gateway only threads the
/// actor into audit records and visibility checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable user identifier
    pub id: String,
    /// Human-readable display name
    pub display_name: Option<String>,
    /// Roles held by the actor
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            roles: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Outcome of one attempted operation (matches the audit store CHECK
/// constraint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Success,
    Failure,
    PartialSuccess,
}

impl OperationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationResult::Success => "success",
            OperationResult::Failure => "failure",
            OperationResult::PartialSuccess => "partial_success",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(OperationResult::Success),
            "failure" => Some(OperationResult::Failure),
            "partial_success" => Some(OperationResult::PartialSuccess),
            _ => None,
        }
    }
}

/// Kind of database operation a registered procedure performs (matches the
/// audit store CHECK constraint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Read,
    Update,
    Delete,
    Execute,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "read" => Some(OperationKind::Read),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            "execute" => Some(OperationKind::Execute),
            _ => None,
        }
    }

    /// Whether this operation modifies data.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, OperationKind::Read)
    }
}
