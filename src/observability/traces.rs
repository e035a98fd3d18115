//! Durable trace persistence over a pooled Postgres connection.
//!
//! The writer is constructed once at process startup and shared behind
//! [`TraceSink`]. Every failure path degrades to the explicit
//! [`NoopTraceWriter`] or to a logged-and-swallowed write error; tracing
//! is never allowed to fail or delay the primary agent workflow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::core::error::CarapaceError;
use crate::core::time::now_epoch_secs;
use crate::observability::run::{Run, ToolEvent};
use crate::observability::schemas::SCHEMA_STATEMENTS;

/// Environment variable holding the Postgres DSN (URL or key-value form).
/// Absent or blank means tracing stays disabled for the process lifetime.
pub const TRACES_DB_URL_ENV: &str = "CARAPACE_TRACES_DB_URL";

/// Tool tag for context-snapshot rows in `tool_events`.
const CONTEXT_EVENT_TOOL: &str = "__context__";

const MAX_CONNECTIONS: u32 = 6;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const CONN_LIFETIME: Duration = Duration::from_secs(30 * 60);

const SCHEMA_RACE_RETRIES: u32 = 3;
const SCHEMA_RACE_BACKOFF: Duration = Duration::from_millis(50);

/// Capability boundary for trace persistence.
///
/// The runtime holds an `Arc<dyn TraceSink>` and calls it unconditionally;
/// whether anything is actually stored depends on which implementation was
/// selected at startup. All methods are best-effort and infallible from
/// the caller's point of view.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Records one `tool_events` row and, on success, appends the event
    /// to the run's in-memory ledger for the final summary.
    async fn record_tool_event(&self, run: &Run, event: ToolEvent, result_len: usize);

    /// Records a context snapshot as a tagged `tool_events` row. Empty
    /// payloads are skipped.
    async fn record_context_event(&self, run: &Run, payload: Map<String, Value>, iteration: u32);

    /// Records an arbitrary milestone as a `run_events` row. A blank
    /// `event_type` is skipped; a blank `status` defaults to `ok`.
    async fn record_run_event(
        &self,
        run: &Run,
        event_type: &str,
        payload: Map<String, Value>,
        status: &str,
        duration_ms: i64,
        error: &str,
    );

    /// Upserts the run's `traces` summary row. Safe to call repeatedly
    /// for the same task id; the last call wins.
    async fn finish_run(&self, run: &Run, exit_code: i32);

    fn enabled(&self) -> bool;
}

/// Explicit no-op sink, selected whenever the backing store is absent or
/// unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceWriter;

#[async_trait]
impl TraceSink for NoopTraceWriter {
    async fn record_tool_event(&self, _run: &Run, _event: ToolEvent, _result_len: usize) {}

    async fn record_context_event(
        &self,
        _run: &Run,
        _payload: Map<String, Value>,
        _iteration: u32,
    ) {
    }

    async fn record_run_event(
        &self,
        _run: &Run,
        _event_type: &str,
        _payload: Map<String, Value>,
        _status: &str,
        _duration_ms: i64,
        _error: &str,
    ) {
    }

    async fn finish_run(&self, _run: &Run, _exit_code: i32) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// Postgres-backed trace writer.
pub struct TraceWriter {
    pool: PgPool,
}

impl TraceWriter {
    /// Builds the process-wide trace sink from [`TRACES_DB_URL_ENV`].
    ///
    /// Any failure (unset variable, unreachable store, failed schema
    /// provisioning) yields the no-op sink and a logged warning; the
    /// caller's workflow continues unaffected either way.
    pub async fn from_env() -> Arc<dyn TraceSink> {
        let dsn = std::env::var(TRACES_DB_URL_ENV).unwrap_or_default();
        let dsn = dsn.trim();
        if dsn.is_empty() {
            return Arc::new(NoopTraceWriter);
        }
        match Self::connect(dsn).await {
            Ok(writer) => {
                tracing::info!("runtime tracing enabled");
                Arc::new(writer)
            }
            Err(err) => {
                tracing::warn!(error = %err, "runtime tracing disabled: trace store unavailable");
                Arc::new(NoopTraceWriter)
            }
        }
    }

    /// Opens a bounded pool against `dsn` and provisions the schema.
    ///
    /// The DSN is normalized to carry an explicit `sslmode` only when the
    /// caller did not already choose one. The pool's acquire timeout
    /// doubles as the bounded connectivity probe.
    pub async fn connect(dsn: &str) -> Result<Self, CarapaceError> {
        let dsn = ensure_sslmode(dsn);
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(CONNECT_TIMEOUT)
            .idle_timeout(IDLE_TIMEOUT)
            .max_lifetime(CONN_LIFETIME)
            .connect(&dsn)
            .await?;
        let writer = Self { pool };
        writer.ensure_schema().await?;
        Ok(writer)
    }

    /// Runs the fixed DDL sequence. Concurrent first-boot races are
    /// recognized by their error text and retried with a short backoff;
    /// a race signature that survives every retry means another process
    /// created the object and is tolerated. Any other error aborts.
    async fn ensure_schema(&self) -> Result<(), CarapaceError> {
        for stmt in SCHEMA_STATEMENTS {
            let mut race: Option<sqlx::Error> = None;
            for attempt in 0..SCHEMA_RACE_RETRIES {
                match sqlx::query(stmt).execute(&self.pool).await {
                    Ok(_) => {
                        race = None;
                        break;
                    }
                    Err(err) if is_schema_race_error(&err) => {
                        race = Some(err);
                        if attempt + 1 < SCHEMA_RACE_RETRIES {
                            tokio::time::sleep(SCHEMA_RACE_BACKOFF).await;
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if let Some(err) = race {
                tracing::debug!(error = %err, "schema statement lost a provisioning race");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TraceSink for TraceWriter {
    async fn record_tool_event(&self, run: &Run, event: ToolEvent, result_len: usize) {
        let args_json = serde_json::to_string(&event.args).unwrap_or_default();
        let status = if event.is_error { "error" } else { "done" };
        let started_at = now_epoch_secs();
        let inserted = sqlx::query(
            "INSERT INTO tool_events
               (task_id, persona, tool, args_json, iteration, status, duration_ms, result_len, error, started_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(&run.id)
        .bind(&run.persona)
        .bind(&event.tool)
        .bind(args_json)
        .bind(event.iteration as i32)
        .bind(status)
        .bind(event.duration_ms)
        .bind(result_len as i64)
        .bind(null_if_blank(&event.error_msg))
        .bind(started_at)
        .execute(&self.pool)
        .await;
        if let Err(err) = inserted {
            tracing::warn!(
                task_id = %run.id,
                tool = %event.tool,
                error = %err,
                "failed to insert tool_event"
            );
            return;
        }
        run.append_tool_event(event);
    }

    async fn record_context_event(&self, run: &Run, payload: Map<String, Value>, iteration: u32) {
        if payload.is_empty() {
            return;
        }
        let payload_json = serde_json::to_string(&payload).unwrap_or_default();
        let started_at = now_epoch_secs();
        let inserted = sqlx::query(
            "INSERT INTO tool_events
               (task_id, persona, tool, args_json, iteration, status, duration_ms, result_len, error, started_at)
             VALUES ($1,$2,$3,$4,$5,'done',0,0,NULL,$6)",
        )
        .bind(&run.id)
        .bind(&run.persona)
        .bind(CONTEXT_EVENT_TOOL)
        .bind(payload_json)
        .bind(iteration as i32)
        .bind(started_at)
        .execute(&self.pool)
        .await;
        if let Err(err) = inserted {
            tracing::warn!(task_id = %run.id, error = %err, "failed to insert context event");
        }
    }

    async fn record_run_event(
        &self,
        run: &Run,
        event_type: &str,
        payload: Map<String, Value>,
        status: &str,
        duration_ms: i64,
        error: &str,
    ) {
        if event_type.trim().is_empty() {
            return;
        }
        let status = if status.is_empty() { "ok" } else { status };
        let payload_json = serde_json::to_string(&payload).unwrap_or_default();
        let created_at = now_epoch_secs();
        let inserted = sqlx::query(
            "INSERT INTO run_events
               (task_id, persona, event_type, payload_json, status, duration_ms, error, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
        )
        .bind(&run.id)
        .bind(&run.persona)
        .bind(event_type)
        .bind(payload_json)
        .bind(status)
        .bind(duration_ms)
        .bind(null_if_blank(error))
        .bind(created_at)
        .execute(&self.pool)
        .await;
        if let Err(err) = inserted {
            tracing::warn!(
                task_id = %run.id,
                event_type = %event_type,
                error = %err,
                "failed to insert run_event"
            );
        }
    }

    async fn finish_run(&self, run: &Run, exit_code: i32) {
        let ended_at = now_epoch_secs();
        let duration_ms = (((ended_at - run.started_at) * 1000.0) as i64).max(0);
        let (tool_events, error_count) = run.snapshot();
        let tools_json = serde_json::to_string(&tool_events).unwrap_or_else(|_| "[]".to_string());
        let upserted = sqlx::query(
            "INSERT INTO traces
               (task_id, gateway, sender, preview, exit_code, started_at, ended_at, duration_ms, tool_count, error_count, tools_json)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
             ON CONFLICT (task_id) DO UPDATE SET
               gateway=EXCLUDED.gateway,
               sender=EXCLUDED.sender,
               preview=EXCLUDED.preview,
               exit_code=EXCLUDED.exit_code,
               started_at=EXCLUDED.started_at,
               ended_at=EXCLUDED.ended_at,
               duration_ms=EXCLUDED.duration_ms,
               tool_count=EXCLUDED.tool_count,
               error_count=EXCLUDED.error_count,
               tools_json=EXCLUDED.tools_json",
        )
        .bind(&run.id)
        .bind(&run.gateway)
        .bind(&run.sender)
        .bind(&run.subject)
        .bind(exit_code)
        .bind(run.started_at)
        .bind(ended_at)
        .bind(duration_ms)
        .bind(tool_events.len() as i32)
        .bind(error_count as i32)
        .bind(tools_json)
        .execute(&self.pool)
        .await;
        if let Err(err) = upserted {
            tracing::warn!(task_id = %run.id, error = %err, "failed to upsert trace row");
        }
    }

    fn enabled(&self) -> bool {
        true
    }
}

fn null_if_blank(s: &str) -> Option<&str> {
    if s.trim().is_empty() { None } else { Some(s) }
}

/// Appends `sslmode=disable` to a DSN that carries no explicit `sslmode`,
/// in whichever syntax the DSN uses. A caller-specified `sslmode` (any
/// value) is returned byte-for-byte unchanged.
pub fn ensure_sslmode(dsn: &str) -> String {
    if dsn.to_lowercase().contains("sslmode=") {
        return dsn.to_string();
    }
    if dsn.contains("://") {
        if dsn.contains('?') {
            return format!("{dsn}&sslmode=disable");
        }
        return format!("{dsn}?sslmode=disable");
    }
    format!("{dsn} sslmode=disable")
}

fn is_schema_race_error(err: &sqlx::Error) -> bool {
    is_schema_race_message(&err.to_string())
}

/// Error-text signatures of two processes provisioning the same schema
/// object at once: the pg_type catalog unique-index race and the plain
/// "already exists" report.
fn is_schema_race_message(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("pg_type_typname_nsp_index")
        || (msg.contains("duplicate key value violates unique constraint") && msg.contains("pg_type"))
        || msg.contains("already exists")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_sslmode_url_without_query() {
        assert_eq!(
            ensure_sslmode("postgresql://u:p@localhost:5432/db"),
            "postgresql://u:p@localhost:5432/db?sslmode=disable"
        );
    }

    #[test]
    fn test_ensure_sslmode_url_with_query() {
        assert_eq!(
            ensure_sslmode("postgresql://u:p@localhost:5432/db?connect_timeout=2"),
            "postgresql://u:p@localhost:5432/db?connect_timeout=2&sslmode=disable"
        );
    }

    #[test]
    fn test_ensure_sslmode_key_value_form() {
        assert_eq!(
            ensure_sslmode("host=localhost port=5432 dbname=traces user=carapace"),
            "host=localhost port=5432 dbname=traces user=carapace sslmode=disable"
        );
    }

    #[test]
    fn test_ensure_sslmode_respects_existing_value() {
        let url = "postgresql://u:p@localhost:5432/db?sslmode=require";
        assert_eq!(ensure_sslmode(url), url);
        let kv = "host=localhost dbname=db sslmode=verify-full";
        assert_eq!(ensure_sslmode(kv), kv);
        let upper = "host=localhost dbname=db SSLMODE=require";
        assert_eq!(ensure_sslmode(upper), upper);
    }

    #[test]
    fn test_schema_race_signatures() {
        assert!(is_schema_race_message(
            r#"duplicate key value violates unique constraint "pg_type_typname_nsp_index""#
        ));
        assert!(is_schema_race_message(r#"relation "tool_events" already exists"#));
        assert!(!is_schema_race_message("permission denied for schema public"));
        assert!(!is_schema_race_message(
            r#"duplicate key value violates unique constraint "traces_pkey""#
        ));
    }

    #[test]
    fn test_null_if_blank() {
        assert_eq!(null_if_blank(""), None);
        assert_eq!(null_if_blank("   "), None);
        assert_eq!(null_if_blank("boom"), Some("boom"));
    }
}
