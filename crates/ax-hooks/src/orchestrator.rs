//! The sole entry point for tool invocations and the sole notifier of
//! lifecycle events.
//!
//! Request flow: admission hooks -> executor lookup -> task creation ->
//! stream pump -> terminal hooks. The stream pump is a dedicated task that
//! fully dispatches chunk *i* (including any resulting injection) before it
//! receives chunk *i+1*, which is what lets interventions land in the PTY
//! ahead of later output.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use ax_core::registry::{RegistryError, TaskRegistry};
use ax_core::types::{TaskId, TaskStatus};
use ax_telemetry::event_log::{EventLog, EventRecord};

use crate::executor::{ExecutionRequest, Executor, ExecutorError, StreamChunk};
use crate::hook::{Hook, HookContext, HookEvent, HookResult};
use crate::monitor::{MonitorBus, MonitorEvent};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Request rejected by a `block` hook during admission.
    #[error("request blocked: {reason}")]
    Blocked { reason: String },
    #[error("no executor registered for tool: {0}")]
    UnknownTool(String),
    #[error("redirect chain exceeded {0} hops")]
    TooManyRedirects(usize),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// RequestOutcome
// ---------------------------------------------------------------------------

/// What the caller gets back from [`HookOrchestrator::handle_request`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Blocking mode: the executor ran to completion.
    Completed { task_id: TaskId, output: String },
    /// Background mode: the task is running; poll `status`/`output`.
    Executing { task_id: TaskId },
}

impl RequestOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            RequestOutcome::Completed { task_id, .. } => *task_id,
            RequestOutcome::Executing { task_id } => *task_id,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RequestOutcome::Completed { task_id, output } => {
                json!({ "taskId": task_id, "status": "completed", "output": output })
            }
            RequestOutcome::Executing { task_id } => {
                json!({ "taskId": task_id, "status": "executing" })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HookOrchestrator
// ---------------------------------------------------------------------------

const MAX_REDIRECTS: usize = 8;

pub struct HookOrchestrator {
    hooks: RwLock<HashMap<HookEvent, Vec<Arc<dyn Hook>>>>,
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
    registry: Arc<TaskRegistry>,
    monitors: MonitorBus,
    event_log: RwLock<Option<Arc<EventLog>>>,
    /// Self-reference for background execution; always upgradable while any
    /// caller holds the orchestrator.
    weak: Weak<HookOrchestrator>,
}

impl HookOrchestrator {
    pub fn new(registry: Arc<TaskRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            hooks: RwLock::new(HashMap::new()),
            executors: RwLock::new(HashMap::new()),
            registry,
            monitors: MonitorBus::new(),
            event_log: RwLock::new(None),
            weak: weak.clone(),
        })
    }

    pub fn set_event_log(&self, log: Arc<EventLog>) {
        *self.event_log.write().unwrap_or_else(|e| e.into_inner()) = Some(log);
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("orchestrator dropped mid-call")
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn monitors(&self) -> &MonitorBus {
        &self.monitors
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a hook under each of its subscribed events, keeping every
    /// event's list stable-sorted by priority descending.
    pub fn register_hook(&self, hook: Arc<dyn Hook>) {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        for event in hook.events() {
            let list = hooks.entry(*event).or_default();
            list.push(Arc::clone(&hook));
            list.sort_by_key(|h| std::cmp::Reverse(h.priority()));
        }
        debug!(hook = hook.name(), priority = hook.priority(), "hook registered");
    }

    /// Remove a hook by name from every event list. Relative order of the
    /// remaining hooks is untouched.
    pub fn unregister_hook(&self, name: &str) {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        for list in hooks.values_mut() {
            list.retain(|h| h.name() != name);
        }
    }

    /// Register the executor for a tool. One executor per tool; a second
    /// registration replaces the first.
    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        let tool = executor.tool().to_string();
        self.executors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool.clone(), executor);
        debug!(tool = %tool, "executor registered");
    }

    pub fn executor(&self, tool: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool)
            .cloned()
    }

    /// Number of hooks currently subscribed to `event`.
    pub fn hook_count(&self, event: HookEvent) -> usize {
        self.hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    fn hooks_for(&self, event: HookEvent) -> Vec<Arc<dyn Hook>> {
        self.hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event)
            .cloned()
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Hook dispatch
    // -----------------------------------------------------------------------

    /// Dispatch `event` through its hook chain.
    ///
    /// The first `Block` or `Redirect` terminates the chain and is returned.
    /// `Modify` results accumulate: all modification maps are shallow-merged
    /// in chain order (later hooks override earlier) and returned once the
    /// whole chain has run. A hook error is logged and the chain continues.
    pub async fn trigger_hooks(&self, ctx: &mut HookContext) -> HookResult {
        let chain = self.hooks_for(ctx.event);
        let mut merged: Map<String, Value> = Map::new();

        for hook in chain {
            match hook.handle(ctx).await {
                Ok(HookResult::Continue) => {}
                Ok(HookResult::Modify { modifications }) => {
                    for (k, v) in modifications {
                        merged.insert(k, v);
                    }
                }
                Ok(terminal @ (HookResult::Block { .. } | HookResult::Redirect { .. })) => {
                    debug!(
                        hook = hook.name(),
                        event = ctx.event.as_str(),
                        "hook terminated chain"
                    );
                    return terminal;
                }
                Err(e) => {
                    warn!(
                        hook = hook.name(),
                        event = ctx.event.as_str(),
                        error = %e,
                        "hook failed; chain continues"
                    );
                }
            }
        }

        if merged.is_empty() {
            HookResult::Continue
        } else {
            HookResult::Modify {
                modifications: merged,
            }
        }
    }

    /// Broadcast to attached monitors.
    pub fn notify_monitors(&self, event: MonitorEvent) {
        self.monitors.publish(event);
    }

    /// Attach a dashboard-style monitor.
    pub fn attach_monitor(&self) -> flume::Receiver<MonitorEvent> {
        self.monitors.attach()
    }

    // -----------------------------------------------------------------------
    // Request handling
    // -----------------------------------------------------------------------

    /// Main entry point: admit, bind, execute.
    pub async fn handle_request(&self, tool: &str, args: Value) -> Result<RequestOutcome> {
        self.handle_request_inner(tool.to_string(), args, 0).await
    }

    fn handle_request_inner(
        &self,
        tool: String,
        mut args: Value,
        depth: usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RequestOutcome>> + Send + '_>>
    {
        Box::pin(async move {
            if depth > MAX_REDIRECTS {
                return Err(OrchestratorError::TooManyRedirects(MAX_REDIRECTS));
            }

            self.log_event(None, "request_received", json!({ "tool": tool, "args": args }));

            // Admission chain.
            let mut ctx =
                HookContext::new(HookEvent::RequestReceived).with_request(&tool, args.clone());
            match self.trigger_hooks(&mut ctx).await {
                HookResult::Block { reason } => {
                    let mut blocked_ctx = HookContext::new(HookEvent::RequestBlocked)
                        .with_request(&tool, args.clone());
                    blocked_ctx
                        .metadata
                        .insert("reason".into(), Value::String(reason.clone()));
                    let _ = self.trigger_hooks(&mut blocked_ctx).await;
                    self.log_event(None, "request_blocked", json!({ "tool": tool, "reason": reason }));
                    self.notify_monitors(MonitorEvent::new(
                        "request_blocked",
                        None,
                        json!({ "tool": tool, "reason": reason }),
                    ));
                    return Err(OrchestratorError::Blocked { reason });
                }
                HookResult::Redirect {
                    tool: new_tool,
                    args: new_args,
                } => {
                    info!(from = %tool, to = %new_tool, "request redirected");
                    return self.handle_request_inner(new_tool, new_args, depth + 1).await;
                }
                HookResult::Modify { modifications } => {
                    merge_args(&mut args, modifications);
                }
                HookResult::Continue => {}
            }

            // Executor lookup for the (possibly redirected) tool.
            let executor = self
                .executor(&tool)
                .ok_or_else(|| OrchestratorError::UnknownTool(tool.clone()))?;

            let prompt = args
                .get("prompt")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let system_prompt = args
                .get("system_prompt")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let background = args
                .get("verbose")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let task_id = self.registry.create(prompt.clone(), None);
            let request = ExecutionRequest {
                task_id,
                prompt,
                system_prompt,
                args: args.clone(),
            };

            if background {
                let this = self.arc();
                let tool_name = tool.clone();
                tokio::spawn(async move {
                    let _ = this.run_execution(tool_name, executor, request).await;
                });
                Ok(RequestOutcome::Executing { task_id })
            } else {
                let output = self.run_execution(tool, executor, request).await?;
                Ok(RequestOutcome::Completed { task_id, output })
            }
        })
    }

    /// Drive one execution: stream pump, lifecycle hooks, terminal bookkeeping.
    async fn run_execution(
        &self,
        tool: String,
        executor: Arc<dyn Executor>,
        request: ExecutionRequest,
    ) -> Result<String> {
        let task_id = request.task_id;
        self.registry.start(task_id, &tool)?;

        let mut started_ctx = HookContext::new(HookEvent::ExecutionStarted)
            .with_execution(task_id, TaskStatus::Running);
        let _ = self.trigger_hooks(&mut started_ctx).await;
        self.log_event(Some(task_id), "execution_started", json!({ "tool": tool }));
        self.notify_monitors(MonitorEvent::new(
            "execution_started",
            Some(task_id),
            json!({ "tool": tool }),
        ));

        // The pump owns stream-phase dispatch: chunk i is fully handled
        // (hooks + any injection) before chunk i+1 is received.
        let (tx, rx) = flume::unbounded::<StreamChunk>();
        let pump = {
            let this = self.arc();
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                while let Ok(chunk) = rx.recv_async().await {
                    this.dispatch_stream_chunk(&executor, chunk).await;
                }
            })
        };

        let result = executor.execute(request, tx).await;
        // The executor dropped its sender on return; wait for the pump to
        // drain so terminal hooks observe the full stream history.
        let _ = pump.await;

        match result {
            Ok(output) => {
                // A concurrent interrupt may have moved the task off Running;
                // the stale transition is not an error worth failing over.
                if let Err(e) = self.registry.complete(task_id, Some(output.clone())) {
                    debug!(task_id, error = %e, "completion transition skipped");
                }
                let mut ctx = HookContext::new(HookEvent::ExecutionCompleted)
                    .with_execution(task_id, TaskStatus::Completed);
                if let Some(exec) = ctx.execution.as_mut() {
                    exec.output = Some(output.clone());
                }
                let _ = self.trigger_hooks(&mut ctx).await;
                self.log_event(Some(task_id), "execution_completed", json!({}));
                self.notify_monitors(MonitorEvent::new(
                    "execution_completed",
                    Some(task_id),
                    json!({}),
                ));
                Ok(output)
            }
            Err(e) => {
                let reason = e.to_string();
                // Timeouts get their own terminal status; both paths fire
                // the failure hook.
                let is_timeout = matches!(
                    e,
                    ExecutorError::StartupTimeout(_) | ExecutorError::IdleTimeout(_)
                );
                if is_timeout {
                    let _ = self.registry.timeout(task_id, reason.clone());
                } else {
                    let _ = self.registry.fail(task_id, reason.clone());
                }
                let mut ctx = HookContext::new(HookEvent::ExecutionFailed)
                    .with_execution(task_id, TaskStatus::Failed);
                ctx.metadata
                    .insert("error".into(), Value::String(reason.clone()));
                let _ = self.trigger_hooks(&mut ctx).await;
                self.log_event(Some(task_id), "execution_failed", json!({ "error": reason }));
                self.notify_monitors(MonitorEvent::new(
                    "execution_failed",
                    Some(task_id),
                    json!({ "error": reason }),
                ));
                Err(e.into())
            }
        }
    }

    /// Handle one stream chunk end-to-end.
    async fn dispatch_stream_chunk(&self, executor: &Arc<dyn Executor>, chunk: StreamChunk) {
        let task_id = chunk.task_id;
        let _ = self.registry.append_output(task_id, &chunk.data);
        self.notify_monitors(MonitorEvent::new(
            "execution_stream",
            Some(task_id),
            json!({ "chunk": chunk.data }),
        ));

        let mut ctx =
            HookContext::new(HookEvent::ExecutionStream).with_stream(task_id, chunk.data);
        let result = self.trigger_hooks(&mut ctx).await;

        if let HookResult::Modify { modifications } = result {
            if let Some(command) = modifications.get("command").and_then(|v| v.as_str()) {
                match executor.inject(task_id, command) {
                    Ok(()) => {
                        self.registry.record_intervention(task_id);
                        let mut ictx = HookContext::new(HookEvent::ExecutionIntervention)
                            .with_execution(task_id, TaskStatus::Running);
                        ictx.metadata
                            .insert("command".into(), Value::String(command.to_string()));
                        let _ = self.trigger_hooks(&mut ictx).await;
                        self.log_event(
                            Some(task_id),
                            "execution_intervention",
                            json!({ "command": command }),
                        );
                        self.notify_monitors(MonitorEvent::new(
                            "execution_intervention",
                            Some(task_id),
                            json!({ "command": command }),
                        ));
                    }
                    Err(e) => {
                        // Injection after PTY close is non-fatal.
                        warn!(task_id, error = %e, "injection failed");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Task control passthroughs
    // -----------------------------------------------------------------------

    pub fn get_task(&self, task_id: TaskId) -> Option<ax_core::types::Task> {
        self.registry.get(task_id)
    }

    pub fn get_all_tasks(&self) -> Vec<ax_core::types::Task> {
        self.registry.all()
    }

    pub fn clear_completed(&self) -> usize {
        self.registry.clear_completed()
    }

    /// Write a message into a running task's session (`send` tool).
    pub fn write_to_task(&self, task_id: TaskId, message: &str) -> Result<()> {
        let task = self
            .registry
            .get(task_id)
            .ok_or(OrchestratorError::Registry(RegistryError::NotFound(task_id)))?;
        let tool = task
            .executor
            .ok_or(OrchestratorError::Executor(ExecutorError::NoSession(task_id)))?;
        let executor = self
            .executor(&tool)
            .ok_or(OrchestratorError::UnknownTool(tool))?;
        executor.write(task_id, message)?;
        Ok(())
    }

    /// Interrupt a running task (`interrupt` tool). The optional follow-up
    /// is written 500 ms after the ETX so the agent has settled.
    pub async fn interrupt_task(
        &self,
        task_id: TaskId,
        follow_up: Option<String>,
    ) -> Result<()> {
        let task = self
            .registry
            .get(task_id)
            .ok_or(OrchestratorError::Registry(RegistryError::NotFound(task_id)))?;
        let tool = task
            .executor
            .ok_or(OrchestratorError::Executor(ExecutorError::NoSession(task_id)))?;
        let executor = self
            .executor(&tool)
            .ok_or(OrchestratorError::UnknownTool(tool))?;

        executor.interrupt(task_id)?;
        self.registry.interrupt(task_id, None);
        self.log_event(Some(task_id), "task_interrupted", json!({}));

        if let Some(msg) = follow_up {
            tokio::time::sleep(Duration::from_millis(500)).await;
            executor.write(task_id, &msg)?;
            self.registry.resume(task_id)?;
        }
        Ok(())
    }

    fn log_event(&self, task_id: Option<TaskId>, event: &str, payload: Value) {
        let log = self
            .event_log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(log) = log {
            let mut record = EventRecord::new(event, payload);
            if let Some(id) = task_id {
                record = record.with_task(id);
            }
            log.append(&record);
        }
    }
}

/// Shallow field-wise merge of `patch` into `args` (later keys win).
fn merge_args(args: &mut Value, patch: Map<String, Value>) {
    if let Value::Object(map) = args {
        for (k, v) in patch {
            map.insert(k, v);
        }
    } else {
        *args = Value::Object(patch);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::HookError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // -- Test hooks --

    struct StaticHook {
        name: String,
        events: Vec<HookEvent>,
        priority: i32,
        result: HookResult,
        calls: AtomicUsize,
    }

    impl StaticHook {
        fn new(
            name: &str,
            events: Vec<HookEvent>,
            priority: i32,
            result: HookResult,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                events,
                priority,
                result,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Hook for StaticHook {
        fn name(&self) -> &str {
            &self.name
        }
        fn events(&self) -> &[HookEvent] {
            &self.events
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        async fn handle(&self, _ctx: &mut HookContext) -> std::result::Result<HookResult, HookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl Hook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }
        fn events(&self) -> &[HookEvent] {
            &[HookEvent::RequestReceived]
        }
        fn priority(&self) -> i32 {
            1000
        }
        async fn handle(&self, _ctx: &mut HookContext) -> std::result::Result<HookResult, HookError> {
            Err(HookError::Failed("deliberate".into()))
        }
    }

    // -- Test executor --

    struct EchoExecutor {
        injected: StdMutex<Vec<String>>,
    }

    impl EchoExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                injected: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Executor for EchoExecutor {
        fn tool(&self) -> &str {
            "spawn"
        }
        async fn execute(
            &self,
            request: ExecutionRequest,
            stream: flume::Sender<StreamChunk>,
        ) -> crate::executor::Result<String> {
            let out = format!("echo: {}", request.prompt);
            let _ = stream.send(StreamChunk {
                task_id: request.task_id,
                data: out.clone(),
            });
            Ok(out)
        }
        fn inject(&self, _task_id: TaskId, command: &str) -> crate::executor::Result<()> {
            self.injected.lock().unwrap().push(command.to_string());
            Ok(())
        }
        fn write(&self, _task_id: TaskId, _data: &str) -> crate::executor::Result<()> {
            Ok(())
        }
        fn interrupt(&self, _task_id: TaskId) -> crate::executor::Result<()> {
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

    #[tokio::test]
    async fn blocking_request_completes() {
        let orch = orchestrator();
        orch.register_executor(EchoExecutor::new());

        let outcome = orch
            .handle_request("spawn", json!({ "prompt": "hello" }))
            .await
            .unwrap();

        match outcome {
            RequestOutcome::Completed { task_id, output } => {
                assert_eq!(output, "echo: hello");
                let task = orch.get_task(task_id).unwrap();
                assert_eq!(task.status, TaskStatus::Completed);
                assert!(task.output.contains("echo: hello"));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn block_hook_prevents_task_creation() {
        let orch = orchestrator();
        orch.register_executor(EchoExecutor::new());
        orch.register_hook(StaticHook::new(
            "security",
            vec![HookEvent::RequestReceived],
            100,
            HookResult::Block {
                reason: "dangerous path".into(),
            },
        ));

        let err = orch
            .handle_request("spawn", json!({ "prompt": "rm -rf /" }))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("dangerous path"));
        assert!(orch.get_all_tasks().is_empty(), "no task may be created");
    }

    #[tokio::test]
    async fn redirect_reroutes_to_other_tool() {
        let orch = orchestrator();
        orch.register_executor(EchoExecutor::new());
        // Redirect everything sent to "alias" to "spawn".
        orch.register_hook(StaticHook::new(
            "alias",
            vec![HookEvent::RequestReceived],
            10,
            HookResult::Redirect {
                tool: "spawn".into(),
                args: json!({ "prompt": "redirected" }),
            },
        ));

        let outcome = orch
            .handle_request("alias", json!({ "prompt": "original" }))
            .await
            .unwrap();
        match outcome {
            RequestOutcome::Completed { output, .. } => assert_eq!(output, "echo: redirected"),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn redirect_loop_is_bounded() {
        let orch = orchestrator();
        orch.register_hook(StaticHook::new(
            "loop",
            vec![HookEvent::RequestReceived],
            10,
            HookResult::Redirect {
                tool: "spawn".into(),
                args: json!({}),
            },
        ));

        let err = orch.handle_request("spawn", json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TooManyRedirects(_)));
    }

    #[tokio::test]
    async fn modify_hooks_accumulate_in_priority_order() {
        let orch = orchestrator();
        let mut first = Map::new();
        first.insert("prompt".into(), Value::String("from-high".into()));
        first.insert("extra".into(), Value::String("high".into()));
        let mut second = Map::new();
        second.insert("prompt".into(), Value::String("from-low".into()));

        orch.register_hook(StaticHook::new(
            "high",
            vec![HookEvent::RequestReceived],
            100,
            HookResult::Modify {
                modifications: first,
            },
        ));
        orch.register_hook(StaticHook::new(
            "low",
            vec![HookEvent::RequestReceived],
            1,
            HookResult::Modify {
                modifications: second,
            },
        ));
        orch.register_executor(EchoExecutor::new());

        let outcome = orch
            .handle_request("spawn", json!({ "prompt": "original" }))
            .await
            .unwrap();
        // Later (lower-priority) hook overrides the earlier one field-wise.
        match outcome {
            RequestOutcome::Completed { output, .. } => assert_eq!(output, "echo: from-low"),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hook_error_does_not_stop_chain() {
        let orch = orchestrator();
        orch.register_hook(Arc::new(FailingHook));
        let after = StaticHook::new(
            "after",
            vec![HookEvent::RequestReceived],
            1,
            HookResult::Continue,
        );
        orch.register_hook(after.clone());
        orch.register_executor(EchoExecutor::new());

        let outcome = orch.handle_request("spawn", json!({ "prompt": "x" })).await;
        assert!(outcome.is_ok());
        assert_eq!(after.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_modify_triggers_injection_and_intervention_event() {
        let orch = orchestrator();
        let exec = EchoExecutor::new();
        orch.register_executor(exec.clone());
        orch.register_hook(StaticHook::new(
            "interventor",
            vec![HookEvent::ExecutionStream],
            50,
            HookResult::modify_command("stop planning, implement now"),
        ));
        let interventions = StaticHook::new(
            "observer",
            vec![HookEvent::ExecutionIntervention],
            0,
            HookResult::Continue,
        );
        orch.register_hook(interventions.clone());

        let outcome = orch
            .handle_request("spawn", json!({ "prompt": "plan" }))
            .await
            .unwrap();

        let injected = exec.injected.lock().unwrap().clone();
        assert_eq!(injected, vec!["stop planning, implement now".to_string()]);
        assert_eq!(interventions.calls.load(Ordering::SeqCst), 1);

        let task = orch.get_task(outcome.task_id()).unwrap();
        assert_eq!(task.metadata.interventions, 1);
    }

    #[tokio::test]
    async fn background_mode_returns_immediately() {
        let orch = orchestrator();
        orch.register_executor(EchoExecutor::new());

        let start = std::time::Instant::now();
        let outcome = orch
            .handle_request("spawn", json!({ "prompt": "bg", "verbose": true }))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));

        let task_id = match outcome {
            RequestOutcome::Executing { task_id } => task_id,
            other => panic!("expected Executing, got {other:?}"),
        };

        // Poll until the background path completes the task.
        for _ in 0..50 {
            if let Some(t) = orch.get_task(task_id) {
                if t.status == TaskStatus::Completed {
                    assert!(t.output.contains("echo: bg"));
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background task never completed");
    }

    #[tokio::test]
    async fn unknown_tool_fails() {
        let orch = orchestrator();
        let err = orch
            .handle_request("nonexistent", json!({ "prompt": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn unregister_restores_registry_shape() {
        let orch = orchestrator();
        let a = StaticHook::new("a", vec![HookEvent::ExecutionStream], 5, HookResult::Continue);
        let b = StaticHook::new("b", vec![HookEvent::ExecutionStream], 5, HookResult::Continue);
        orch.register_hook(a);
        orch.register_hook(b);
        assert_eq!(orch.hook_count(HookEvent::ExecutionStream), 2);

        let c = StaticHook::new("c", vec![HookEvent::ExecutionStream], 9, HookResult::Continue);
        orch.register_hook(c);
        orch.unregister_hook("c");
        assert_eq!(orch.hook_count(HookEvent::ExecutionStream), 2);
    }

    #[tokio::test]
    async fn monitors_see_stream_chunks() {
        let orch = orchestrator();
        orch.register_executor(EchoExecutor::new());
        let rx = orch.attach_monitor();

        orch.handle_request("spawn", json!({ "prompt": "watched" }))
            .await
            .unwrap();

        let kinds: Vec<String> = rx.try_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&"execution_started".to_string()));
        assert!(kinds.contains(&"execution_stream".to_string()));
        assert!(kinds.contains(&"execution_completed".to_string()));
    }
}
