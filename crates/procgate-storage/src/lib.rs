//! ProcGate Storage
//!
//! Backend abstraction over the relational database that registered
//! procedures execute against, plus the gateway's runtime configuration.
//!
//! The reference backend is a local SQLite file. SQLite has no server-side
//! stored procedures, so a registered procedure is vetted, parameterized SQL
//! held by the gateway's closed registry; callers still only ever name a
//! procedure and supply typed parameters. Client/server engines with native
//! procedures plug in behind the same trait.

use std::path::{Path, PathBuf};

use procgate_core::{GateError, Result};
use rusqlite::Connection;

pub mod config;

pub use config::{CircuitBreakerConfig, ExecutorConfig, RetryConfig};

/// Backend abstraction for procedure execution and audit persistence.
pub trait ProcedureBackend: Send + Sync {
    /// Open a connection to the database.
    ///
    /// Each logical operation runs on its own connection; transaction
    /// scopes hold one connection for their whole lifetime.
    fn get_connection(&self) -> Result<Connection>;

    /// Check whether the database exists.
    fn exists(&self) -> Result<bool>;

    /// Create the database and bootstrap the gateway schema.
    fn initialize(&self) -> Result<()>;
}

/// Local filesystem SQLite backend.
#[derive(Clone, Debug)]
pub struct LocalSqliteBackend {
    path: PathBuf,
}

impl LocalSqliteBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| {
            GateError::database(sqlite_code(&e), format!("failed to open database: {e}"))
        })?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| GateError::database(sqlite_code(&e), e.to_string()))?;

        Ok(conn)
    }
}

impl ProcedureBackend for LocalSqliteBackend {
    fn get_connection(&self) -> Result<Connection> {
        let conn = self.open()?;
        init_gate_schema(&conn)?;
        Ok(conn)
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.path.exists())
    }

    fn initialize(&self) -> Result<()> {
        if self.exists()? {
            return Err(GateError::configuration(format!(
                "database already exists at {:?}",
                self.path
            )));
        }
        let conn = self.open()?;
        init_gate_schema(&conn)?;
        Ok(())
    }
}

/// Extract the primary SQLite result code from a driver error, for
/// transient/permanent classification.
pub fn sqlite_code(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code & 0xff),
        _ => None,
    }
}

/// Map a driver error into the gateway taxonomy.
pub fn map_sqlite_error(err: rusqlite::Error) -> GateError {
    GateError::database(sqlite_code(&err), err.to_string())
}

/// Initialize the gateway schema.
///
/// Creates the append-only `audit_event` table. Audit events are inserted
/// by the audit writer and deleted only by the retention sweep; there is no
/// update path anywhere in the gateway.
pub fn init_gate_schema(conn: &Connection) -> Result<()> {
    let ddl = r#"
    CREATE TABLE IF NOT EXISTS audit_event (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      event_type TEXT NOT NULL CHECK (event_type IN ('database', 'security')),
      event_sub_type TEXT NOT NULL,
      timestamp TEXT NOT NULL,
      correlation_id TEXT NOT NULL,
      actor_id TEXT,
      actor_name TEXT,
      actor_roles TEXT,
      ip_address TEXT,
      resource_type TEXT,
      resource_id TEXT,
      resource_name TEXT,
      action TEXT NOT NULL,
      result TEXT NOT NULL CHECK (result IN ('success', 'failure', 'partial_success')),
      error_code TEXT,
      error_message TEXT,
      duration_ms INTEGER,
      additional_data TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_audit_event_correlation ON audit_event(correlation_id);
    CREATE INDEX IF NOT EXISTS idx_audit_event_timestamp ON audit_event(timestamp);
    CREATE INDEX IF NOT EXISTS idx_audit_event_actor ON audit_event(actor_id);
    CREATE INDEX IF NOT EXISTS idx_audit_event_type ON audit_event(event_type);
    "#;

    conn.execute_batch(ddl)
        .map_err(|e| GateError::database(sqlite_code(&e), format!("schema bootstrap failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_local_backend_initialize() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();

        let backend = LocalSqliteBackend::new(&path);
        assert!(!backend.exists().unwrap());

        backend.initialize().unwrap();
        assert!(backend.exists().unwrap());

        let conn = backend.get_connection().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert!(tables.contains(&"audit_event".to_string()));
    }

    #[test]
    fn test_local_backend_double_initialize() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();

        let backend = LocalSqliteBackend::new(&path);
        backend.initialize().unwrap();

        let err = backend.initialize().unwrap_err();
        assert_eq!(err.code(), "configuration");
    }

    #[test]
    fn test_connection_enables_foreign_keys() {
        let temp_file = NamedTempFile::new().unwrap();
        let backend = LocalSqliteBackend::new(temp_file.path());

        let conn = backend.get_connection().unwrap();
        let fk_enabled: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_enabled, 1);
    }

    #[test]
    fn test_audit_result_check_constraint() {
        let temp_file = NamedTempFile::new().unwrap();
        let backend = LocalSqliteBackend::new(temp_file.path());
        let conn = backend.get_connection().unwrap();

        let err = conn.execute(
            "INSERT INTO audit_event (event_type, event_sub_type, timestamp, correlation_id, action, result)
             VALUES ('database', 'read', '2026-01-01T00:00:00Z', 'cid', 'ExecuteQuery', 'maybe')",
            [],
        );
        assert!(err.is_err(), "result outside the closed set must be rejected");
    }

    #[test]
    fn test_sqlite_code_extraction() {
        let temp_file = NamedTempFile::new().unwrap();
        let backend = LocalSqliteBackend::new(temp_file.path());
        let conn = backend.get_connection().unwrap();

        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES (1)", [])
            .unwrap_err();
        // SQLITE_CONSTRAINT = 19, classified permanent
        assert_eq!(sqlite_code(&err), Some(19));
        assert!(!map_sqlite_error(err).is_transient());
    }
}
