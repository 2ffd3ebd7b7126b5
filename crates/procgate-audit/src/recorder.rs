//! Buffered, non-blocking audit recording.
//!
//! [`AuditRecorder`] is a cheap-to-clone handle; events flow over a bounded
//! channel to [`audit_writer_task`], which batches inserts into the
//! append-only `audit_event` table. Persistence failures degrade to the
//! `audit_fallback` tracing target; the business operation never observes
//! them.

use std::sync::Arc;

use procgate_storage::ProcedureBackend;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::AuditEvent;

/// Default buffer size for audit events
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default flush interval in milliseconds
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Batch size at which the writer flushes without waiting for the interval
const FLUSH_BATCH_SIZE: usize = 100;

/// Configuration for the audit recorder.
#[derive(Debug, Clone)]
pub struct AuditRecorderConfig {
    /// Maximum number of events in the buffer
    pub buffer_size: usize,
    /// Flush interval in milliseconds
    pub flush_interval_ms: u64,
}

impl Default for AuditRecorderConfig {
    fn default() -> Self {
        Self {
            buffer_size: std::env::var("PROCGATE_AUDIT_BUFFER_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BUFFER_SIZE),
            flush_interval_ms: std::env::var("PROCGATE_AUDIT_FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
        }
    }
}

/// Handle for recording audit events.
///
/// Recording never returns an error and never blocks request processing:
/// if the buffer is full or the channel is closed, the event is emitted to
/// the `audit_fallback` tracing target instead.
#[derive(Clone)]
pub struct AuditRecorder {
    sender: mpsc::Sender<AuditEvent>,
}

impl AuditRecorder {
    /// Create a recorder and the receiver its writer task consumes.
    pub fn new(config: &AuditRecorderConfig) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(config.buffer_size);
        (Self { sender }, receiver)
    }

    /// Record an audit event (non-blocking).
    pub fn record(&self, event: AuditEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    correlation_id = %event.correlation_id,
                    action = %event.action,
                    "Audit buffer full, falling back to log"
                );
                log_event_as_fallback(&event, "buffer overflow");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                error!(
                    correlation_id = %event.correlation_id,
                    "Audit channel closed, falling back to log"
                );
                log_event_as_fallback(&event, "channel closed");
            }
        }
    }

    /// Record an audit event, waiting for buffer space if necessary.
    pub async fn record_async(&self, event: AuditEvent) {
        let correlation_id = event.correlation_id;
        if let Err(e) = self.sender.send(event).await {
            error!(
                correlation_id = %correlation_id,
                error = %e,
                "Failed to enqueue audit event"
            );
            log_event_as_fallback(&e.0, "channel closed");
        }
    }
}

/// Background task that writes audit events to the database.
///
/// Batches events from the channel and flushes either when the batch grows
/// past [`FLUSH_BATCH_SIZE`] or on the configured interval. Failures are
/// logged and the affected events re-emitted via the fallback target.
pub async fn audit_writer_task(
    mut receiver: mpsc::Receiver<AuditEvent>,
    backend: Arc<dyn ProcedureBackend>,
    config: AuditRecorderConfig,
) {
    let flush_interval = std::time::Duration::from_millis(config.flush_interval_ms);
    let mut batch: Vec<AuditEvent> = Vec::with_capacity(FLUSH_BATCH_SIZE);
    let mut interval = tokio::time::interval(flush_interval);

    info!(
        buffer_size = config.buffer_size,
        flush_interval_ms = config.flush_interval_ms,
        "Audit writer task started"
    );

    loop {
        tokio::select! {
            event = receiver.recv() => {
                match event {
                    Some(e) => {
                        batch.push(e);
                        if batch.len() >= FLUSH_BATCH_SIZE {
                            flush_batch(&mut batch, &backend).await;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            flush_batch(&mut batch, &backend).await;
                        }
                        info!("Audit writer task shutting down");
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                if !batch.is_empty() {
                    flush_batch(&mut batch, &backend).await;
                }
            }
        }
    }
}

async fn flush_batch(batch: &mut Vec<AuditEvent>, backend: &Arc<dyn ProcedureBackend>) {
    if batch.is_empty() {
        return;
    }

    let events: Vec<AuditEvent> = std::mem::take(batch);
    let count = events.len();

    debug!(count, "Flushing audit batch");

    let backend = Arc::clone(backend);
    let result = tokio::task::spawn_blocking(move || match backend.get_connection() {
        Ok(conn) => match write_events_to_db(&conn, &events) {
            Ok(written) => Ok(written),
            Err(e) => Err((e.to_string(), events)),
        },
        Err(e) => Err((e.to_string(), events)),
    })
    .await;

    match result {
        Ok(Ok(written)) => {
            debug!(written, "Audit batch written");
        }
        Ok(Err((e, events))) => {
            error!(error = %e, count, "Failed to write audit batch");
            for event in &events {
                log_event_as_fallback(event, "write failure");
            }
        }
        Err(e) => {
            error!(error = %e, count, "Audit write task panicked");
        }
    }
}

/// Emit an event to the fallback tracing target so a persistence failure is
/// never silent.
fn log_event_as_fallback(event: &AuditEvent, reason: &str) {
    info!(
        target: "audit_fallback",
        event_type = event.event_type.as_str(),
        event_sub_type = %event.event_sub_type,
        correlation_id = %event.correlation_id,
        actor = event.actor.as_ref().map(|a| a.id.as_str()),
        action = %event.action,
        result = event.result.as_str(),
        reason = reason,
        "Audit event (fallback)"
    );
}

/// Write a batch of audit events in a single transaction.
pub fn write_events_to_db(
    conn: &Connection,
    events: &[AuditEvent],
) -> Result<usize, rusqlite::Error> {
    let tx = conn.unchecked_transaction()?;

    let mut stmt = tx.prepare_cached(
        r#"
        INSERT INTO audit_event (
            event_type, event_sub_type, timestamp, correlation_id,
            actor_id, actor_name, actor_roles, ip_address,
            resource_type, resource_id, resource_name,
            action, result, error_code, error_message, duration_ms,
            additional_data
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
        )
        "#,
    )?;

    let mut count = 0;
    for event in events {
        let actor_roles = event
            .actor
            .as_ref()
            .filter(|a| !a.roles.is_empty())
            .map(|a| a.roles.join(","));
        let additional_data = event
            .detail
            .as_ref()
            .and_then(|d| serde_json::to_string(d).ok());

        stmt.execute(rusqlite::params![
            event.event_type.as_str(),
            event.event_sub_type,
            event.timestamp.to_rfc3339(),
            event.correlation_id.to_string(),
            event.actor.as_ref().map(|a| a.id.clone()),
            event.actor.as_ref().and_then(|a| a.display_name.clone()),
            actor_roles,
            event.ip_address,
            event.resource_type,
            event.resource_id,
            event.resource_name,
            event.action,
            event.result.as_str(),
            event.error_code,
            event.error_message,
            event.duration_ms,
            additional_data,
        ])?;
        count += 1;
    }

    drop(stmt);
    tx.commit()?;

    Ok(count)
}
