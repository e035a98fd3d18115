//! Extension points gating tool execution and outbound traffic.
//!
//! Four hook lists exist: before-tool and before-outbound can rewrite or
//! veto the in-flight action; after-tool and on-error can only observe.
//! Dispatch is sequential in registration order, so a later hook always
//! sees the output of an earlier one, and the first error short-circuits
//! the gated pipelines.

pub mod manager;
pub mod secret_guard;

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::error::CarapaceError;

pub use manager::HookManager;
pub use secret_guard::SecretLeakGuard;

/// A proposed or executing tool call. Created by the runtime; before-tool
/// hooks may return a rewritten copy (argument redaction, routing fixes);
/// read-only once dispatch begins.
#[derive(Debug, Clone, Default)]
pub struct ToolInvocation {
    pub name: String,
    pub args: Map<String, Value>,
    pub channel: String,
    pub chat_id: String,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
            channel: String::new(),
            chat_id: String::new(),
        }
    }
}

/// The result of one tool execution. Produced once, never mutated.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub is_error: bool,
    /// Content fed back to the agent.
    pub for_llm: String,
    /// Content surfaced to the end user, if any.
    pub for_user: String,
    /// True when the tool completes out-of-band.
    pub is_async: bool,
}

/// A reply about to leave the system. Before-outbound hooks may rewrite
/// or veto it.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
        }
    }
}

/// Pipeline stage reported to on-error hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeTool,
    BeforeOutbound,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::BeforeTool => write!(f, "before_tool"),
            HookStage::BeforeOutbound => write!(f, "before_outbound"),
        }
    }
}

/// Metadata attached to on-error notifications (tool name, channel, ...).
pub type HookMeta = Map<String, Value>;

pub type BeforeToolHook =
    Arc<dyn Fn(ToolInvocation) -> Result<ToolInvocation, CarapaceError> + Send + Sync>;
pub type AfterToolHook = Arc<dyn Fn(&ToolInvocation, &ToolOutcome) + Send + Sync>;
pub type BeforeOutboundHook =
    Arc<dyn Fn(OutboundMessage) -> Result<OutboundMessage, CarapaceError> + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(HookStage, &CarapaceError, &HookMeta) + Send + Sync>;
