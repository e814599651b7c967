//! Routes decoded tool requests onto the orchestrator and the task
//! registry.
//!
//! Only `spawn` and `orchestrate` enter the hook-dispatched request path;
//! `send`/`status`/`output`/`interrupt` are control-plane calls that act on
//! already-admitted tasks directly.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::debug;

use ax_hooks::orchestrator::HookOrchestrator;

use crate::protocol::{
    InterruptArgs, OutputArgs, SendArgs, StatusArgs, ToolRequest, ToolResponse,
};
use crate::resources;

pub struct ToolHandler {
    orchestrator: Arc<HookOrchestrator>,
    started: Instant,
}

impl ToolHandler {
    pub fn new(orchestrator: Arc<HookOrchestrator>) -> Self {
        Self {
            orchestrator,
            started: Instant::now(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<HookOrchestrator> {
        &self.orchestrator
    }

    pub async fn handle(&self, request: ToolRequest) -> ToolResponse {
        let id = request.id.clone();

        if let Some(resource) = &request.resource {
            return match resources::render(resource, &self.orchestrator, self.started) {
                Some(doc) => ToolResponse::ok(id, json!({ "resource": resource, "body": doc })),
                None => ToolResponse::err(id, format!("unknown resource: {resource}")),
            };
        }

        let Some(tool) = request.tool.as_deref() else {
            return ToolResponse::err(id, "request needs a 'tool' or 'resource' field");
        };
        debug!(tool, "tool request");

        match tool {
            "spawn" | "orchestrate" => {
                match self.orchestrator.handle_request(tool, request.args).await {
                    Ok(outcome) => ToolResponse::ok(id, outcome.to_json()),
                    Err(e) => ToolResponse::err(id, e.to_string()),
                }
            }
            "send" => match serde_json::from_value::<SendArgs>(request.args) {
                Ok(args) => match self.orchestrator.write_to_task(args.task_id, &args.message) {
                    Ok(()) => ToolResponse::ok(id, json!({ "sent": true })),
                    Err(e) => ToolResponse::err(id, e.to_string()),
                },
                Err(e) => ToolResponse::err(id, format!("invalid send args: {e}")),
            },
            "status" => match serde_json::from_value::<StatusArgs>(request.args) {
                Ok(StatusArgs { task_id: Some(task_id) }) => {
                    match self.orchestrator.get_task(task_id) {
                        Some(task) => ToolResponse::ok(id, json!(task)),
                        None => ToolResponse::err(id, format!("task not found: {task_id}")),
                    }
                }
                Ok(StatusArgs { task_id: None }) => {
                    ToolResponse::ok(id, json!(self.orchestrator.get_all_tasks()))
                }
                Err(e) => ToolResponse::err(id, format!("invalid status args: {e}")),
            },
            "output" => match serde_json::from_value::<OutputArgs>(request.args) {
                Ok(args) => match self.orchestrator.get_task(args.task_id) {
                    Some(task) => {
                        let body = match args.tail {
                            Some(n) => tail_lines(&task.output, n),
                            None => task.output,
                        };
                        ToolResponse::ok(id, json!({ "taskId": args.task_id, "output": body }))
                    }
                    None => ToolResponse::err(id, format!("task not found: {}", args.task_id)),
                },
                Err(e) => ToolResponse::err(id, format!("invalid output args: {e}")),
            },
            "interrupt" => match serde_json::from_value::<InterruptArgs>(request.args) {
                Ok(args) => {
                    match self
                        .orchestrator
                        .interrupt_task(args.task_id, args.follow_up)
                        .await
                    {
                        Ok(()) => ToolResponse::ok(id, json!({ "interrupted": true })),
                        Err(e) => ToolResponse::err(id, e.to_string()),
                    }
                }
                Err(e) => ToolResponse::err(id, format!("invalid interrupt args: {e}")),
            },
            other => ToolResponse::err(id, format!("unknown tool: {other}")),
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ax_core::registry::TaskRegistry;
    use ax_core::types::TaskId;
    use ax_hooks::executor::{ExecutionRequest, Executor, StreamChunk};

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        fn tool(&self) -> &str {
            "spawn"
        }
        async fn execute(
            &self,
            request: ExecutionRequest,
            stream: flume::Sender<StreamChunk>,
        ) -> ax_hooks::executor::Result<String> {
            let out = format!("line one\nline two\nline three: {}", request.prompt);
            let _ = stream.send(StreamChunk {
                task_id: request.task_id,
                data: out.clone(),
            });
            Ok(out)
        }
        fn inject(&self, _t: TaskId, _c: &str) -> ax_hooks::executor::Result<()> {
            Ok(())
        }
        fn write(&self, _t: TaskId, _d: &str) -> ax_hooks::executor::Result<()> {
            Ok(())
        }
        fn interrupt(&self, _t: TaskId) -> ax_hooks::executor::Result<()> {
            Ok(())
        }
        fn kill(&self, _t: TaskId) {}
        fn running(&self, _t: TaskId) -> bool {
            false
        }
        fn output(&self, _t: TaskId) -> Option<String> {
            None
        }
    }

    fn handler() -> ToolHandler {
        let orchestrator = HookOrchestrator::new(Arc::new(TaskRegistry::new()));
        orchestrator.register_executor(Arc::new(EchoExecutor));
        ToolHandler::new(orchestrator)
    }

    fn request(json_text: &str) -> ToolRequest {
        serde_json::from_str(json_text).unwrap()
    }

    #[tokio::test]
    async fn spawn_roundtrip() {
        let handler = handler();
        let resp = handler
            .handle(request(r#"{"id":1,"tool":"spawn","args":{"prompt":"hello"}}"#))
            .await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "completed");
        assert!(result["output"].as_str().unwrap().contains("hello"));
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn status_lists_and_fetches() {
        let handler = handler();
        let resp = handler
            .handle(request(r#"{"tool":"spawn","args":{"prompt":"x"}}"#))
            .await;
        let task_id = resp.result.unwrap()["taskId"].as_u64().unwrap();

        let all = handler.handle(request(r#"{"tool":"status","args":{}}"#)).await;
        assert_eq!(all.result.unwrap().as_array().unwrap().len(), 1);

        let one = handler
            .handle(request(&format!(
                r#"{{"tool":"status","args":{{"taskId":{task_id}}}}}"#
            )))
            .await;
        assert_eq!(one.result.unwrap()["status"], "completed");
    }

    #[tokio::test]
    async fn output_supports_tail() {
        let handler = handler();
        let resp = handler
            .handle(request(r#"{"tool":"spawn","args":{"prompt":"x"}}"#))
            .await;
        let task_id = resp.result.unwrap()["taskId"].as_u64().unwrap();

        let tail = handler
            .handle(request(&format!(
                r#"{{"tool":"output","args":{{"taskId":{task_id},"tail":1}}}}"#
            )))
            .await;
        let body = tail.result.unwrap()["output"].as_str().unwrap().to_string();
        assert!(body.starts_with("line three"));
        assert!(!body.contains("line one"));
    }

    #[tokio::test]
    async fn unknown_tool_and_missing_task_error() {
        let handler = handler();
        let resp = handler.handle(request(r#"{"tool":"frobnicate","args":{}}"#)).await;
        assert!(resp.error.unwrap().message.contains("unknown tool"));

        let resp = handler
            .handle(request(r#"{"tool":"output","args":{"taskId":12345}}"#))
            .await;
        assert!(resp.error.unwrap().message.contains("not found"));
    }

    #[tokio::test]
    async fn resources_render() {
        let handler = handler();
        for name in ["status", "help", "quick-start", "debug", "logs"] {
            let resp = handler
                .handle(request(&format!(r#"{{"resource":"{name}"}}"#)))
                .await;
            assert!(resp.error.is_none(), "resource {name} failed");
        }
        let resp = handler.handle(request(r#"{"resource":"nope"}"#)).await;
        assert!(resp.error.is_some());
    }
}
