//! Read-only resource documents: registry snapshots and static help text.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use ax_core::types::TaskStatus;
use ax_hooks::hook::HookEvent;
use ax_hooks::orchestrator::HookOrchestrator;

const HELP: &str = r#"# axiom tools

| Tool | Args | Effect |
|---|---|---|
| `spawn` | `{prompt, verbose?, pattern?, count?}` | run a prompt in a supervised agent; `verbose` returns immediately |
| `send` | `{taskId, message}` | write a message into a running session |
| `status` | `{taskId?}` | one task, or all of them |
| `output` | `{taskId, tail?}` | the task's output buffer, optionally only the last N lines |
| `interrupt` | `{taskId, followUp?}` | ETX to the agent, then an optional follow-up message |
| `orchestrate` | `{action, prompt?, useWorktree?, baseBranch?, autoMerge?}` | decompose/execute/mergeAll/cleanup/status |

Resources: `status`, `logs`, `debug`, `help`, `quick-start`.
"#;

const QUICK_START: &str = r#"# quick start

1. Spawn a task and wait for it:
   `{"tool":"spawn","args":{"prompt":"add a health endpoint"}}`
2. Or run it in the background and poll:
   `{"tool":"spawn","args":{"prompt":"refactor the parser","verbose":true}}`
   `{"tool":"status","args":{"taskId":<id>}}`
3. Fan a big prompt out across isolated worktrees:
   `{"tool":"orchestrate","args":{"action":"execute","prompt":"Build REST API","useWorktree":true,"autoMerge":true}}`
"#;

/// Render a named resource, or `None` when the name is unknown.
pub fn render(name: &str, orchestrator: &Arc<HookOrchestrator>, started: Instant) -> Option<String> {
    match name {
        "help" => Some(HELP.to_string()),
        "quick-start" => Some(QUICK_START.to_string()),
        "status" => {
            let tasks = orchestrator.get_all_tasks();
            let running = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Running)
                .count();
            Some(
                serde_json::to_string_pretty(&json!({
                    "uptime_seconds": started.elapsed().as_secs(),
                    "tasks_total": tasks.len(),
                    "tasks_running": running,
                    "tasks": tasks,
                }))
                .unwrap_or_default(),
            )
        }
        "logs" => {
            let tasks = orchestrator.get_all_tasks();
            let mut doc = String::from("# recent task activity\n\n");
            for task in tasks.iter().rev().take(20) {
                doc.push_str(&format!(
                    "- `{}` {:?} interventions={} error={}\n",
                    task.id,
                    task.status,
                    task.metadata.interventions,
                    task.error.as_deref().unwrap_or("-"),
                ));
            }
            Some(doc)
        }
        "debug" => {
            let events = [
                HookEvent::RequestReceived,
                HookEvent::RequestBlocked,
                HookEvent::ExecutionStarted,
                HookEvent::ExecutionStream,
                HookEvent::ExecutionIntervention,
                HookEvent::ExecutionCompleted,
                HookEvent::ExecutionFailed,
            ];
            let hooks: Vec<_> = events
                .iter()
                .map(|e| json!({ "event": e.as_str(), "hooks": orchestrator.hook_count(*e) }))
                .collect();
            Some(
                serde_json::to_string_pretty(&json!({
                    "hooks": hooks,
                    "monitors": orchestrator.monitors().monitor_count(),
                    "tasks": orchestrator.get_all_tasks().len(),
                }))
                .unwrap_or_default(),
            )
        }
        _ => None,
    }
}
