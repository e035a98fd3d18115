//! Trace store schema definitions.
//!
//! Three tables: `traces` (one upserted summary row per run),
//! `tool_events` (append-only, one row per tool call attempt), and
//! `run_events` (append-only milestone rows). Every statement is
//! idempotent so any number of processes can provision a fresh database;
//! first-boot races are handled by the retry loop in
//! [`traces`](crate::observability::traces).

pub const TRACES_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS traces (
        task_id     TEXT PRIMARY KEY,
        gateway     TEXT,
        sender      TEXT,
        preview     TEXT,
        exit_code   INTEGER,
        started_at  DOUBLE PRECISION NOT NULL,
        ended_at    DOUBLE PRECISION,
        duration_ms INTEGER,
        tool_count  INTEGER DEFAULT 0,
        error_count INTEGER DEFAULT 0,
        tools_json  TEXT DEFAULT '[]'
    )
";

pub const TOOL_EVENTS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS tool_events (
        id          BIGSERIAL PRIMARY KEY,
        task_id     TEXT NOT NULL,
        persona     TEXT,
        tool        TEXT NOT NULL,
        args_json   TEXT,
        iteration   INTEGER,
        status      TEXT NOT NULL DEFAULT 'running',
        duration_ms INTEGER,
        result_len  INTEGER,
        error       TEXT,
        started_at  DOUBLE PRECISION NOT NULL
    )
";

pub const TOOL_EVENTS_TASK_ID_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tool_events_task_id ON tool_events (task_id)";
pub const TOOL_EVENTS_STARTED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tool_events_started_at ON tool_events (started_at)";
pub const TOOL_EVENTS_PERSONA_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tool_events_persona ON tool_events (persona) WHERE persona IS NOT NULL";

pub const RUN_EVENTS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS run_events (
        id           BIGSERIAL PRIMARY KEY,
        task_id      TEXT NOT NULL,
        persona      TEXT,
        event_type   TEXT NOT NULL,
        payload_json TEXT,
        status       TEXT NOT NULL DEFAULT 'ok',
        duration_ms  INTEGER,
        error        TEXT,
        created_at   DOUBLE PRECISION NOT NULL
    )
";

pub const RUN_EVENTS_TASK_ID_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_run_events_task_id ON run_events (task_id)";
pub const RUN_EVENTS_CREATED_AT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_run_events_created_at ON run_events (created_at)";

/// Provisioning order: tables before their indexes.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    TRACES_TABLE,
    TOOL_EVENTS_TABLE,
    TOOL_EVENTS_TASK_ID_INDEX,
    TOOL_EVENTS_STARTED_AT_INDEX,
    TOOL_EVENTS_PERSONA_INDEX,
    RUN_EVENTS_TABLE,
    RUN_EVENTS_TASK_ID_INDEX,
    RUN_EVENTS_CREATED_AT_INDEX,
];
