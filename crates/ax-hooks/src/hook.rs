use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use ax_core::types::{TaskId, TaskStatus};

// ---------------------------------------------------------------------------
// HookEvent
// ---------------------------------------------------------------------------

/// Lifecycle events a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    RequestReceived,
    RequestBlocked,
    ExecutionStarted,
    ExecutionStream,
    ExecutionIntervention,
    ExecutionCompleted,
    ExecutionFailed,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::RequestReceived => "request_received",
            HookEvent::RequestBlocked => "request_blocked",
            HookEvent::ExecutionStarted => "execution_started",
            HookEvent::ExecutionStream => "execution_stream",
            HookEvent::ExecutionIntervention => "execution_intervention",
            HookEvent::ExecutionCompleted => "execution_completed",
            HookEvent::ExecutionFailed => "execution_failed",
        }
    }
}

// ---------------------------------------------------------------------------
// HookContext
// ---------------------------------------------------------------------------

/// The incoming tool invocation, present on request-phase events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub tool: String,
    pub args: Value,
}

/// Execution state, present on execution-phase events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub output: Option<String>,
}

/// One chunk of PTY output, present on stream events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub task_id: TaskId,
    pub chunk: String,
}

/// Context passed by reference through a hook chain. Hooks may stash
/// cross-cutting observations in `metadata`; everything decision-relevant
/// goes through the returned [`HookResult`] instead.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: HookEvent,
    pub request: Option<Request>,
    pub execution: Option<Execution>,
    pub stream: Option<Stream>,
    pub metadata: Map<String, Value>,
}

impl HookContext {
    pub fn new(event: HookEvent) -> Self {
        Self {
            event,
            request: None,
            execution: None,
            stream: None,
            metadata: Map::new(),
        }
    }

    pub fn with_request(mut self, tool: impl Into<String>, args: Value) -> Self {
        self.request = Some(Request {
            tool: tool.into(),
            args,
        });
        self
    }

    pub fn with_execution(mut self, task_id: TaskId, status: TaskStatus) -> Self {
        self.execution = Some(Execution {
            task_id,
            status,
            output: None,
        });
        self
    }

    pub fn with_stream(mut self, task_id: TaskId, chunk: impl Into<String>) -> Self {
        self.stream = Some(Stream {
            task_id,
            chunk: chunk.into(),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// HookResult
// ---------------------------------------------------------------------------

/// Outcome of one hook (and, merged, of a whole chain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookResult {
    /// Proceed unchanged.
    Continue,
    /// Reject the request; the reason is surfaced to the caller.
    Block { reason: String },
    /// Shallow field-wise patch. During request admission the patch is
    /// merged into the tool args; during streaming a `command` key is
    /// forwarded to the executor's `inject`.
    Modify { modifications: Map<String, Value> },
    /// Re-enter request handling with a different tool and args.
    Redirect { tool: String, args: Value },
}

impl HookResult {
    pub fn modify_command(command: impl Into<String>) -> Self {
        let mut modifications = Map::new();
        modifications.insert("command".into(), Value::String(command.into()));
        HookResult::Modify { modifications }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, HookResult::Continue)
    }
}

// ---------------------------------------------------------------------------
// Hook trait
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook failed: {0}")]
    Failed(String),
    #[error("hook io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A prioritised, named handler subscribed to lifecycle events.
///
/// Hooks must be resilient: a returned error is logged and the chain
/// continues. Hooks of equal priority run in registration order.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Unique name, used for unregistration and logging.
    fn name(&self) -> &str;

    /// Events this hook subscribes to.
    fn events(&self) -> &[HookEvent];

    /// Higher priorities run first. Defaults to 0.
    fn priority(&self) -> i32 {
        0
    }

    async fn handle(&self, ctx: &mut HookContext) -> Result<HookResult, HookError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hook_result_serialises_tagged() {
        let r = HookResult::Block {
            reason: "nope".into(),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["action"], "block");
        assert_eq!(json["reason"], "nope");

        let r = HookResult::modify_command("stop planning");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["action"], "modify");
        assert_eq!(json["modifications"]["command"], "stop planning");
    }

    #[test]
    fn context_builders() {
        let ctx = HookContext::new(HookEvent::RequestReceived)
            .with_request("spawn", json!({"prompt": "hi"}));
        assert_eq!(ctx.request.as_ref().unwrap().tool, "spawn");
        assert!(ctx.stream.is_none());

        let ctx = HookContext::new(HookEvent::ExecutionStream).with_stream(9, "chunk");
        assert_eq!(ctx.stream.as_ref().unwrap().task_id, 9);
    }

    #[test]
    fn event_names_are_stable() {
        assert_eq!(HookEvent::RequestBlocked.as_str(), "request_blocked");
        assert_eq!(HookEvent::ExecutionStream.as_str(), "execution_stream");
    }
}
