//! Carapace: the governance shell for agent runtimes.
//!
//! **Carapace sits between an agent and the outside world.** Every tool
//! invocation and every outbound message passes through its hook pipelines
//! before anything executes or leaves the process, and every run leaves a
//! durable trace behind for audit.
//!
//! # Core Principles
//!
//! - **Deterministic**: hooks run sequentially in registration order; a
//!   later hook always observes the rewrites of an earlier one
//! - **Block, don't sanitize**: the built-in secret guard vetoes suspect
//!   actions outright so callers cannot miss a policy decision
//! - **Fail-open observability**: tracing is best-effort; a missing or
//!   broken store never fails the primary task
//! - **Process-global policy**: one hook manager, one trace sink, a single
//!   security posture for every run on the process
//!
//! # Architecture
//!
//! The owning runtime drives all flow:
//!
//! 1. Build one [`hooks::HookManager`] at startup (the default manager
//!    carries the [`hooks::SecretLeakGuard`] on both gated pipelines).
//! 2. Build one trace sink with [`observability::TraceWriter::from_env`]
//!    and share it everywhere.
//! 3. Per task: create an [`observability::Run`], scope it with
//!    [`observability::with_run`], and finish it with
//!    [`observability::TraceSink::finish_run`].
//! 4. Per tool call: `run_before_tool` before dispatch, then
//!    `run_after_tool` plus `record_tool_event`.
//! 5. Per outbound message: `run_before_outbound` before transmission.
//!
//! # Crate Structure
//!
//! - [`core`]: shared primitives (error type, time and id helpers)
//! - [`hooks`]: extension points and the secret leak guard
//! - [`observability`]: run ledger, ambient context, and the trace store

pub mod core;
pub mod hooks;
pub mod observability;
