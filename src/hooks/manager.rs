//! Thread-safe hook registry and ordered pipeline executor.
//!
//! Registration takes the write lock (rare, administrative); dispatch
//! takes a read-locked snapshot and then runs without holding any lock,
//! so the hot path never contends with registration traffic. Within one
//! dispatch, hooks run strictly sequentially. A panicking or slow hook
//! delays its caller directly: no isolation or timeout is imposed here.

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};

use crate::core::error::CarapaceError;
use crate::hooks::secret_guard::SecretLeakGuard;
use crate::hooks::{
    AfterToolHook, BeforeOutboundHook, BeforeToolHook, ErrorHook, HookMeta, HookStage,
    OutboundMessage, ToolInvocation, ToolOutcome,
};

/// Registry and executor for the four extension points.
///
/// One manager per process is the intended shape: governance policy is
/// global, not per-run.
pub struct HookManager {
    before_tool: RwLock<Vec<BeforeToolHook>>,
    after_tool: RwLock<Vec<AfterToolHook>>,
    before_outbound: RwLock<Vec<BeforeOutboundHook>>,
    on_error: RwLock<Vec<ErrorHook>>,
}

/// The default manager carries the baseline policy; see
/// [`with_default_policy`](HookManager::with_default_policy).
impl Default for HookManager {
    fn default() -> Self {
        Self::with_default_policy()
    }
}

impl HookManager {
    /// An empty manager with no policy attached.
    pub fn new() -> Self {
        Self {
            before_tool: RwLock::new(Vec::new()),
            after_tool: RwLock::new(Vec::new()),
            before_outbound: RwLock::new(Vec::new()),
            on_error: RwLock::new(Vec::new()),
        }
    }

    /// A manager pre-wired with the [`SecretLeakGuard`] on both gated
    /// pipelines. This is the baseline posture; callers needing extra
    /// policy register on top of it.
    pub fn with_default_policy() -> Self {
        let manager = Self::new();
        let guard = SecretLeakGuard::new();
        manager.register_before_tool(move |inv| guard.before_tool(inv));
        manager.register_before_outbound(move |msg| guard.before_outbound(msg));
        manager
    }

    pub fn register_before_tool<F>(&self, hook: F)
    where
        F: Fn(ToolInvocation) -> Result<ToolInvocation, CarapaceError> + Send + Sync + 'static,
    {
        self.before_tool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    pub fn register_after_tool<F>(&self, hook: F)
    where
        F: Fn(&ToolInvocation, &ToolOutcome) + Send + Sync + 'static,
    {
        self.after_tool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    pub fn register_before_outbound<F>(&self, hook: F)
    where
        F: Fn(OutboundMessage) -> Result<OutboundMessage, CarapaceError> + Send + Sync + 'static,
    {
        self.before_outbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    pub fn register_on_error<F>(&self, hook: F)
    where
        F: Fn(HookStage, &CarapaceError, &HookMeta) + Send + Sync + 'static,
    {
        self.on_error
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Runs the before-tool pipeline, feeding each hook's (possibly
    /// rewritten) invocation into the next. The first error wins: later
    /// hooks do not run, on-error hooks are notified with stage
    /// `before_tool` and the original tool name, and the caller must not
    /// dispatch the tool.
    pub fn run_before_tool(
        &self,
        invocation: ToolInvocation,
    ) -> Result<ToolInvocation, CarapaceError> {
        let hooks = self.snapshot_before_tool();
        let tool_name = invocation.name.clone();
        let mut current = invocation;
        for hook in hooks {
            match hook(current) {
                Ok(next) => current = next,
                Err(err) => {
                    let mut meta = Map::new();
                    meta.insert("tool".to_string(), Value::String(tool_name));
                    self.emit_error(HookStage::BeforeTool, &err, &meta);
                    return Err(err);
                }
            }
        }
        Ok(current)
    }

    /// Fan-out notification of a completed tool call. Hooks observe but
    /// cannot veto finished work.
    pub fn run_after_tool(&self, invocation: &ToolInvocation, outcome: &ToolOutcome) {
        for hook in self.snapshot_after_tool() {
            hook(invocation, outcome);
        }
    }

    /// Runs the before-outbound pipeline; identical short-circuit
    /// semantics to [`run_before_tool`](Self::run_before_tool), with the
    /// channel and chat id of the original message as error metadata.
    /// A blocking error means the message must not be sent.
    pub fn run_before_outbound(
        &self,
        message: OutboundMessage,
    ) -> Result<OutboundMessage, CarapaceError> {
        let hooks = self.snapshot_before_outbound();
        let channel = message.channel.clone();
        let chat_id = message.chat_id.clone();
        let mut current = message;
        for hook in hooks {
            match hook(current) {
                Ok(next) => current = next,
                Err(err) => {
                    let mut meta = Map::new();
                    meta.insert("channel".to_string(), Value::String(channel));
                    meta.insert("chat_id".to_string(), Value::String(chat_id));
                    self.emit_error(HookStage::BeforeOutbound, &err, &meta);
                    return Err(err);
                }
            }
        }
        Ok(current)
    }

    /// Notifies every on-error hook of a pipeline failure.
    pub fn emit_error(&self, stage: HookStage, err: &CarapaceError, meta: &HookMeta) {
        for hook in self.snapshot_on_error() {
            hook(stage, err, meta);
        }
    }

    fn snapshot_before_tool(&self) -> Vec<BeforeToolHook> {
        self.before_tool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn snapshot_after_tool(&self) -> Vec<AfterToolHook> {
        self.after_tool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn snapshot_before_outbound(&self) -> Vec<BeforeOutboundHook> {
        self.before_outbound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn snapshot_on_error(&self) -> Vec<ErrorHook> {
        self.on_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_after_tool_fans_out_to_all_hooks() {
        let manager = HookManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            manager.register_after_tool(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        let inv = ToolInvocation::new("echo", Map::new());
        manager.run_after_tool(&inv, &ToolOutcome::default());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_emit_error_reaches_every_on_error_hook() {
        let manager = HookManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            manager.register_on_error(move |stage, _, _| {
                assert_eq!(stage, HookStage::BeforeOutbound);
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        let err = CarapaceError::PolicyViolation("test".into());
        manager.emit_error(HookStage::BeforeOutbound, &err, &Map::new());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_manager_passes_invocation_through() {
        let manager = HookManager::new();
        let mut args = Map::new();
        args.insert("q".to_string(), Value::String("hi".into()));
        let inv = ToolInvocation::new("search", args.clone());
        let out = manager.run_before_tool(inv).expect("no hooks, no error");
        assert_eq!(out.name, "search");
        assert_eq!(out.args, args);
    }

    #[test]
    fn test_stage_display_names() {
        assert_eq!(HookStage::BeforeTool.to_string(), "before_tool");
        assert_eq!(HookStage::BeforeOutbound.to_string(), "before_outbound");
    }
}
