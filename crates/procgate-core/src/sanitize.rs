//! Command risk classification for ProcGate
//!
//! Pattern-based screening of command text against a per-tool-class policy:
//! - Statement terminators followed by further statements
//! - SQL comment tokens
//! - Always-true predicates (`OR 1=1`, `OR 'a'='a'`)
//! - Dynamic-execution keywords
//! - System-procedure name prefixes
//! - DML/DDL/privilege verbs, depending on the tool class
//!
//! This is defense-in-depth, not a SQL compiler: the classifier fails closed
//! on ambiguous input and is a pure function of its arguments.

use regex::Regex;

/// Maximum accepted command length in bytes
pub const MAX_COMMAND_LEN: usize = 8192;

/// Tool class driving the verb policy.
///
/// A read-only tool rejects any DML or DDL verb outright; a write-enabled
/// tool rejects DDL and privilege statements but allows DML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    ReadOnly,
    ReadWrite,
}

impl ToolClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolClass::ReadOnly => "read_only",
            ToolClass::ReadWrite => "read_write",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read_only" => Some(ToolClass::ReadOnly),
            "read_write" => Some(ToolClass::ReadWrite),
            _ => None,
        }
    }
}

/// Why a piece of command text was blocked.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "token")]
pub enum BlockReason {
    EmptyCommand,
    ControlBytes,
    ExcessiveLength(usize),
    /// A statement terminator with further content behind it
    MultipleStatements,
    CommentToken(String),
    /// An always-true predicate such as `OR 1=1`
    Tautology,
    DynamicExecution(String),
    SystemProcedurePrefix(String),
    DmlVerb(String),
    DdlVerb(String),
    PrivilegeVerb(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::EmptyCommand => write!(f, "empty command"),
            BlockReason::ControlBytes => write!(f, "control bytes in command"),
            BlockReason::ExcessiveLength(len) => {
                write!(f, "command too long: {} > {} bytes", len, MAX_COMMAND_LEN)
            }
            BlockReason::MultipleStatements => write!(f, "multiple statements"),
            BlockReason::CommentToken(t) => write!(f, "comment token '{t}'"),
            BlockReason::Tautology => write!(f, "always-true predicate"),
            BlockReason::DynamicExecution(t) => write!(f, "dynamic execution keyword '{t}'"),
            BlockReason::SystemProcedurePrefix(t) => {
                write!(f, "system procedure reference '{t}'")
            }
            BlockReason::DmlVerb(t) => write!(f, "DML verb '{t}' not allowed for this tool"),
            BlockReason::DdlVerb(t) => write!(f, "DDL verb '{t}'"),
            BlockReason::PrivilegeVerb(t) => write!(f, "privilege statement '{t}'"),
        }
    }
}

/// Classification verdict. [`Verdict::Blocked`] lists every matched reason,
/// not just the first, so callers can log and audit the full picture.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reasons")]
pub enum Verdict {
    Allowed,
    Blocked(Vec<BlockReason>),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    pub fn reasons(&self) -> &[BlockReason] {
        match self {
            Verdict::Allowed => &[],
            Verdict::Blocked(reasons) => reasons,
        }
    }
}

/// Pattern-based risk classifier.
///
/// Patterns are compiled once at construction; [`SqlRiskClassifier::classify`]
/// is stateless, deterministic, and side-effect free.
#[derive(Debug)]
pub struct SqlRiskClassifier {
    tautology_numeric: Regex,
    tautology_string: Regex,
    dynamic_execution: Regex,
    system_procedure: Regex,
    dml_verb: Regex,
    ddl_verb: Regex,
    privilege_verb: Regex,
}

/// Comment tokens scanned as plain substrings. These are never legitimate
/// inside a procedure name or a plain parameter value.
const COMMENT_TOKENS: &[&str] = &["--", "/*"];

impl Default for SqlRiskClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlRiskClassifier {
    pub fn new() -> Self {
        // Verb detection is word-boundary anchored so identifiers that merely
        // contain a forbidden substring (e.g. `backup_selection`) do not trip.
        Self {
            tautology_numeric: compile(r"(?i)\bOR\s+(\d+)\s*=\s*(\d+)"),
            tautology_string: compile(r"(?i)\bOR\s+'([^']*)'\s*=\s*'([^']*)'"),
            dynamic_execution: compile(r"(?i)\b(EXECUTE\s+IMMEDIATE|EXEC|EXECUTE|sp_executesql)\b"),
            system_procedure: compile(r"(?i)\b((?:xp_|sp_)[A-Za-z0-9_]+)"),
            dml_verb: compile(r"(?i)\b(INSERT|UPDATE|DELETE|MERGE)\b"),
            ddl_verb: compile(r"(?i)\b(CREATE|ALTER|DROP|TRUNCATE)\b"),
            privilege_verb: compile(r"(?i)\b(GRANT|REVOKE|DENY)\b"),
        }
    }

    /// Classify command text under the given tool-class policy.
    pub fn classify(&self, text: &str, policy: ToolClass) -> Verdict {
        let mut reasons = Vec::new();

        // Fail closed on ambiguous input before any pattern matching
        if text.trim().is_empty() {
            return Verdict::Blocked(vec![BlockReason::EmptyCommand]);
        }
        if text.chars().any(|c| c == '\0' || (c.is_control() && c != '\n' && c != '\r' && c != '\t'))
        {
            return Verdict::Blocked(vec![BlockReason::ControlBytes]);
        }
        if text.len() > MAX_COMMAND_LEN {
            return Verdict::Blocked(vec![BlockReason::ExcessiveLength(text.len())]);
        }

        self.scan_injection_shapes(text, &mut reasons);

        for m in self.dml_verb.find_iter(text) {
            if policy == ToolClass::ReadOnly {
                reasons.push(BlockReason::DmlVerb(m.as_str().to_uppercase()));
            }
        }
        for m in self.ddl_verb.find_iter(text) {
            reasons.push(BlockReason::DdlVerb(m.as_str().to_uppercase()));
        }
        for m in self.privilege_verb.find_iter(text) {
            reasons.push(BlockReason::PrivilegeVerb(m.as_str().to_uppercase()));
        }

        if reasons.is_empty() {
            Verdict::Allowed
        } else {
            Verdict::Blocked(reasons)
        }
    }

    /// Screen a string-typed parameter value.
    ///
    /// Applies only the injection-shaped patterns (terminators, comments,
    /// tautologies, dynamic execution, system procedures), not the bare
    /// verb policy: free text such as "please delete my account" in a
    /// comment field is legitimate parameter content.
    pub fn classify_parameter(&self, value: &str) -> Verdict {
        if value.contains('\0') {
            return Verdict::Blocked(vec![BlockReason::ControlBytes]);
        }
        if value.len() > MAX_COMMAND_LEN {
            return Verdict::Blocked(vec![BlockReason::ExcessiveLength(value.len())]);
        }

        let mut reasons = Vec::new();
        self.scan_injection_shapes(value, &mut reasons);

        if reasons.is_empty() {
            Verdict::Allowed
        } else {
            Verdict::Blocked(reasons)
        }
    }

    fn scan_injection_shapes(&self, text: &str, reasons: &mut Vec<BlockReason>) {
        // A terminator is only a finding when another statement follows it
        if let Some(pos) = text.find(';') {
            if !text[pos + 1..].trim().is_empty() {
                reasons.push(BlockReason::MultipleStatements);
            }
        }

        for token in COMMENT_TOKENS {
            if text.contains(token) {
                reasons.push(BlockReason::CommentToken((*token).to_string()));
            }
        }

        if let Some(caps) = self.tautology_numeric.captures(text) {
            if caps[1] == caps[2] {
                reasons.push(BlockReason::Tautology);
            }
        }
        if let Some(caps) = self.tautology_string.captures(text) {
            if caps[1] == caps[2] {
                reasons.push(BlockReason::Tautology);
            }
        }

        if let Some(m) = self.dynamic_execution.find(text) {
            reasons.push(BlockReason::DynamicExecution(m.as_str().to_uppercase()));
        }
        if let Some(caps) = self.system_procedure.captures(text) {
            reasons.push(BlockReason::SystemProcedurePrefix(caps[1].to_string()));
        }
    }
}

fn compile(pattern: &str) -> Regex {
    // Patterns are compile-time literals; a failure here is a programmer
    // error caught by the unit tests below.
    Regex::new(pattern).expect("hard-coded classifier pattern must compile")
}
