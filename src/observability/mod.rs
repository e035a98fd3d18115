//! Run ledger, ambient execution context, and the durable trace store.
//!
//! Everything here is best-effort by contract: a missing backing store,
//! a failed insert, or an absent ambient run leaves the primary agent
//! workflow untouched.

pub mod run;
pub mod schemas;
pub mod traces;

pub use run::{
    Run, ToolEvent, current_iteration, current_run, with_iteration, with_run,
};
pub use traces::{NoopTraceWriter, TraceSink, TraceWriter, TRACES_DB_URL_ENV};
