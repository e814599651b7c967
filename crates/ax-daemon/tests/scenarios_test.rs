//! End-to-end scenarios across the orchestrator, hooks, and the
//! intervention controller, using scripted executors in place of real PTYs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use ax_core::config::InterventionConfig;
use ax_core::registry::TaskRegistry;
use ax_core::types::{TaskId, TaskStatus};
use ax_hooks::builtin::{ParallelDetectionHook, SecurityHook, ValidationHook};
use ax_hooks::executor::{ExecutionRequest, Executor, StreamChunk};
use ax_hooks::orchestrator::{HookOrchestrator, OrchestratorError, RequestOutcome};
use ax_scanner::controller::InterventionController;

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

/// Streams pre-canned chunks, records injections, then returns.
struct ScriptedExecutor {
    tool: String,
    chunks: Vec<String>,
    /// Pause between chunks, so interventions can land mid-stream.
    chunk_delay: Duration,
    injected: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new(tool: &str, chunks: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            tool: tool.into(),
            chunks,
            chunk_delay: Duration::from_millis(5),
            injected: Mutex::new(Vec::new()),
        })
    }

    fn injected(&self) -> Vec<String> {
        self.injected.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn tool(&self) -> &str {
        &self.tool
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        stream: flume::Sender<StreamChunk>,
    ) -> ax_hooks::executor::Result<String> {
        let mut output = String::new();
        for chunk in &self.chunks {
            output.push_str(chunk);
            let _ = stream.send(StreamChunk {
                task_id: request.task_id,
                data: chunk.clone(),
            });
            tokio::time::sleep(self.chunk_delay).await;
        }
        Ok(output)
    }

    fn inject(&self, _task_id: TaskId, command: &str) -> ax_hooks::executor::Result<()> {
        self.injected.lock().unwrap().push(command.to_string());
        Ok(())
    }

    fn write(&self, _task_id: TaskId, _data: &str) -> ax_hooks::executor::Result<()> {
        Ok(())
    }

    fn interrupt(&self, _task_id: TaskId) -> ax_hooks::executor::Result<()> {
        Ok(())
    }

    fn kill(&self, _task_id: TaskId) {}

    fn running(&self, _task_id: TaskId) -> bool {
        false
    }

    fn output(&self, _task_id: TaskId) -> Option<String> {
        None
    }
}

fn orchestrator() -> Arc<HookOrchestrator> {
    HookOrchestrator::new(Arc::new(TaskRegistry::new()))
}

// ---------------------------------------------------------------------------
// Scenario: block and reject
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dangerous_prompt_is_blocked_before_any_task_exists() {
    let orch = orchestrator();
    orch.register_hook(Arc::new(SecurityHook::new()));
    orch.register_hook(Arc::new(ValidationHook));
    orch.register_executor(ScriptedExecutor::new("spawn", vec!["never runs".into()]));

    let monitor = orch.attach_monitor();

    let err = orch
        .handle_request("spawn", json!({ "prompt": "rm -rf / please" }))
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Blocked { reason } => assert!(reason.contains("dangerous path")),
        other => panic!("expected Blocked, got {other:?}"),
    }
    assert!(orch.get_all_tasks().is_empty(), "no Task may be created");

    let kinds: Vec<String> = monitor.try_iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&"request_blocked".to_string()));
    assert!(!kinds.contains(&"execution_started".to_string()));
}

// ---------------------------------------------------------------------------
// Scenario: planning interrupt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn endless_planning_gets_a_stop_planning_injection() {
    let orch = orchestrator();
    let controller = Arc::new(InterventionController::new(InterventionConfig {
        enabled: true,
        action_cooldown_ms: 60_000,
        verify_window_secs: 3600,
        planning_grace_secs: 0,
    }));
    orch.register_hook(controller.clone());

    let executor = ScriptedExecutor::new(
        "spawn",
        vec![
            "I am analyzing the requirements...\n".into(),
            "still planning the module layout...\n".into(),
            "ok\n".into(),
        ],
    );
    orch.register_executor(executor.clone());

    let outcome = orch
        .handle_request("spawn", json!({ "prompt": "build a parser" }))
        .await
        .unwrap();

    let injected = executor.injected();
    assert_eq!(injected.len(), 1, "exactly one stop-planning intervention");
    assert!(injected[0].contains("Stop planning"));

    let stats = controller.stats();
    assert!(stats.total_interventions >= 1);

    let task = orch.get_task(outcome.task_id()).unwrap();
    assert_eq!(task.metadata.interventions, 1);
    assert!(!controller.history(outcome.task_id()).is_empty());
}

// ---------------------------------------------------------------------------
// Scenario: background mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn background_spawn_returns_before_completion() {
    let orch = orchestrator();
    let executor = ScriptedExecutor::new("spawn", vec!["working\n".into(), "done\n".into()]);
    orch.register_executor(executor);

    let start = std::time::Instant::now();
    let outcome = orch
        .handle_request("spawn", json!({ "prompt": "slow task", "verbose": true }))
        .await
        .unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(100),
        "background mode must return immediately"
    );
    let task_id = match outcome {
        RequestOutcome::Executing { task_id } => task_id,
        other => panic!("expected Executing, got {other:?}"),
    };

    // Poll status until terminal, then read the full buffer.
    let mut completed = false;
    for _ in 0..100 {
        if let Some(task) = orch.get_task(task_id) {
            if task.status == TaskStatus::Completed {
                assert!(task.output.contains("working"));
                assert!(task.output.contains("done"));
                completed = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(completed, "background task never reached Completed");
}

// ---------------------------------------------------------------------------
// Scenario: parallel prompts reroute to orchestrate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_prompt_lands_in_the_orchestrate_executor() {
    let orch = orchestrator();
    orch.register_hook(Arc::new(ParallelDetectionHook::new()));
    orch.register_executor(ScriptedExecutor::new("spawn", vec!["single\n".into()]));
    orch.register_executor(ScriptedExecutor::new("orchestrate", vec!["swarm\n".into()]));

    let outcome = orch
        .handle_request(
            "spawn",
            json!({ "prompt": "try 3 different approaches in parallel" }),
        )
        .await
        .unwrap();

    match outcome {
        RequestOutcome::Completed { output, .. } => assert!(output.contains("swarm")),
        other => panic!("expected Completed, got {other:?}"),
    }
    let task = orch.get_all_tasks().pop().unwrap();
    assert_eq!(task.executor.as_deref(), Some("orchestrate"));
}

// ---------------------------------------------------------------------------
// Scenario: event accounting per request
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_terminal_event_per_request() {
    let orch = orchestrator();
    orch.register_executor(ScriptedExecutor::new("spawn", vec!["a\n".into(), "b\n".into()]));
    let monitor = orch.attach_monitor();

    orch.handle_request("spawn", json!({ "prompt": "x" }))
        .await
        .unwrap();

    let kinds: Vec<String> = monitor.try_iter().map(|e| e.kind).collect();
    let count = |k: &str| kinds.iter().filter(|x| x.as_str() == k).count();
    assert_eq!(count("execution_started"), 1);
    assert_eq!(count("execution_completed") + count("execution_failed"), 1);
    assert_eq!(count("execution_stream"), 2, "one stream event per chunk");
}
