//! Per-task run ledger and ambient context propagation.
//!
//! A [`Run`] is created at task start, mutated throughout execution, read
//! once at finalization, then discarded. Its event list lives behind an
//! internal lock so tool-completion callbacks on different tasks of the
//! host runtime can append concurrently.
//!
//! The active run and the current tool-call iteration travel ambiently
//! through [`tokio::task_local!`] scopes instead of explicit parameters.
//! Absence is a valid state: without a scoped run, tracing is inert.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::time::now_epoch_secs;

/// One completed tool call inside a run. Append-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolEvent {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration_ms: i64,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

#[derive(Debug, Default)]
struct RunState {
    tool_events: Vec<ToolEvent>,
    error_count: u32,
}

/// The unit of work for one task execution.
///
/// Identity fields are fixed at construction; the event ledger mutates
/// under its own lock, independent of any hook-manager locking.
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub gateway: String,
    pub sender: String,
    pub subject: String,
    pub session_key: String,
    pub persona: String,
    /// Unix-epoch seconds at construction time.
    pub started_at: f64,
    state: Mutex<RunState>,
}

impl Run {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            gateway: String::new(),
            sender: String::new(),
            subject: String::new(),
            session_key: String::new(),
            persona: String::new(),
            started_at: now_epoch_secs(),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = gateway.into();
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = session_key.into();
        self
    }

    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    /// Appends a completed tool event; the error counter only increases.
    pub fn append_tool_event(&self, event: ToolEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if event.is_error {
            state.error_count += 1;
        }
        state.tool_events.push(event);
    }

    /// An immutable copy of the ledger: (events in append order, error
    /// count). Taken once at finalize time.
    pub fn snapshot(&self) -> (Vec<ToolEvent>, u32) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.tool_events.clone(), state.error_count)
    }
}

tokio::task_local! {
    static CURRENT_RUN: Arc<Run>;
    static CURRENT_ITERATION: u32;
}

/// Scopes `fut` with `run` as the ambient active run.
pub async fn with_run<F>(run: Arc<Run>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_RUN.scope(run, fut).await
}

/// The ambient active run, if any.
pub fn current_run() -> Option<Arc<Run>> {
    CURRENT_RUN.try_with(Arc::clone).ok()
}

/// Scopes `fut` with the given tool-call iteration number.
pub async fn with_iteration<F>(iteration: u32, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_ITERATION.scope(iteration, fut).await
}

/// The ambient iteration number; zero when unset.
pub fn current_iteration() -> u32 {
    CURRENT_ITERATION.try_with(|n| *n).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order_and_counts_errors() {
        let run = Run::new("task-1");
        for i in 0..4 {
            run.append_tool_event(ToolEvent {
                tool: format!("tool-{i}"),
                iteration: i,
                is_error: i % 2 == 1,
                ..ToolEvent::default()
            });
        }
        let (events, errors) = run.snapshot();
        assert_eq!(events.len(), 4);
        assert_eq!(errors, 2);
        let names: Vec<_> = events.iter().map(|e| e.tool.as_str()).collect();
        assert_eq!(names, ["tool-0", "tool-1", "tool-2", "tool-3"]);
    }

    #[test]
    fn test_tool_event_serialization_omits_empty_fields() {
        let ev = ToolEvent {
            tool: "search".to_string(),
            iteration: 1,
            ..ToolEvent::default()
        };
        let json = serde_json::to_value(&ev).expect("serialize");
        let obj = json.as_object().expect("object");
        assert!(!obj.contains_key("args"));
        assert!(!obj.contains_key("duration_ms"));
        assert!(!obj.contains_key("error_msg"));
        assert!(!obj.contains_key("extra"));
        assert_eq!(obj["tool"], "search");
        assert_eq!(obj["is_error"], false);
    }

    #[tokio::test]
    async fn test_ambient_run_and_iteration_scoping() {
        assert!(current_run().is_none());
        assert_eq!(current_iteration(), 0);

        let run = Arc::new(Run::new("task-9"));
        with_run(run.clone(), async {
            let active = current_run().expect("run is scoped");
            assert_eq!(active.id, "task-9");
            with_iteration(3, async {
                assert_eq!(current_iteration(), 3);
            })
            .await;
            assert_eq!(current_iteration(), 0);
        })
        .await;

        assert!(current_run().is_none());
    }
}
