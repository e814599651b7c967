//! Parallel subtask execution with timeouts, retries, and reserve tasks.
//!
//! Orthogonal tasks run concurrently (bounded), each against its own
//! workspace; a watchdog escalates ESC -> kill on timeout; failed or
//! timed-out attempts retry with doubling backoff. Reserve tasks run after
//! the orthogonal wave, seeded with the union of successful outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use ax_core::types::{now_millis, ExecutionStatus, OrthogonalTask, ReserveTrigger, TaskExecution, TaskId};
use ax_hooks::executor::{ExecutionRequest, Executor, ExecutorError, StreamChunk};

use crate::cleanup::CleanupRegistry;
use crate::decompose::{validate_orthogonality, DecomposeError, Decomposer};
use crate::score::merge_outputs;
use crate::worktree::{WorktreeError, WorktreeManager};

// ---------------------------------------------------------------------------
// Errors / config
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error(transparent)]
    Decompose(#[from] DecomposeError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error("dependency cycle among tasks: {0}")]
    DependencyCycle(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwarmError>;

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub max_parallel: usize,
    pub task_timeout_secs: u64,
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Initial retry delay; doubles each retry.
    pub retry_backoff_ms: u64,
    /// Watchdog poll interval.
    pub watchdog_poll_ms: u64,
    /// Grace after completion detection before the agent is stopped.
    pub settle_ms: u64,
    pub use_worktrees: bool,
    pub base_branch: String,
    pub auto_merge: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            task_timeout_secs: 600,
            max_retries: 2,
            retry_backoff_ms: 1_000,
            watchdog_poll_ms: 10_000,
            settle_ms: 3_000,
            use_worktrees: false,
            base_branch: "main".into(),
            auto_merge: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Completion detection
// ---------------------------------------------------------------------------

const COMPLETION_MARKERS: &[&str] = &[
    "file created:",
    "created file:",
    "successfully created",
    "has been created",
    "wrote to",
];

/// A subtask counts as done when its output carries creation markers, when
/// the agent returned to an idle prompt box, or when fenced code plus the
/// declared files on disk line up.
pub fn detect_completion(output: &str, expected: &[String], workspace: &Path) -> bool {
    let lower = output.to_lowercase();
    if COMPLETION_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    if output.matches("│ >").count() > 1 {
        return true;
    }
    if output.contains("```")
        && !expected.is_empty()
        && expected.iter().all(|f| workspace.join(f).exists())
    {
        return true;
    }
    false
}

// ---------------------------------------------------------------------------
// SwarmEngine
// ---------------------------------------------------------------------------

pub struct SwarmEngine {
    executor: Arc<dyn Executor>,
    config: SwarmConfig,
    worktrees: Option<Arc<WorktreeManager>>,
    cleanup: Arc<CleanupRegistry>,
    next_id: AtomicU64,
}

impl SwarmEngine {
    pub fn new(
        executor: Arc<dyn Executor>,
        config: SwarmConfig,
        worktrees: Option<Arc<WorktreeManager>>,
        cleanup: Arc<CleanupRegistry>,
    ) -> Self {
        Self {
            executor,
            config,
            worktrees,
            cleanup,
            next_id: AtomicU64::new(now_millis()),
        }
    }

    fn alloc_task_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Run a full task set: orthogonal waves first, then reserves.
    pub async fn execute(
        self: Arc<Self>,
        tasks: Vec<OrthogonalTask>,
    ) -> Result<BTreeMap<String, TaskExecution>> {
        validate_orthogonality(&tasks)?;

        let (reserves, orthogonal): (Vec<_>, Vec<_>) =
            tasks.into_iter().partition(|t| t.is_reserve());

        let mut done: BTreeMap<String, TaskExecution> = BTreeMap::new();
        let mut remaining = orthogonal;

        // Dependency waves: a task runs only once everything it depends on
        // is terminal.
        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|t| {
                t.dependencies
                    .iter()
                    .all(|d| done.get(d).map(|e| e.status.is_terminal()).unwrap_or(false))
            });
            if ready.is_empty() {
                let ids: Vec<String> = blocked.iter().map(|t| t.id.clone()).collect();
                return Err(SwarmError::DependencyCycle(ids.join(", ")));
            }

            let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
            let mut handles = Vec::new();
            for task in ready {
                let engine = Arc::clone(&self);
                let semaphore = Arc::clone(&semaphore);
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    engine.run_one(task).await
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok(Ok(exec)) => {
                        done.insert(exec.task.id.clone(), exec);
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "subtask driver panicked");
                    }
                }
            }
            remaining = blocked;
        }

        // Reserve phase.
        let any_roadblock = done
            .values()
            .any(|e| matches!(e.status, ExecutionStatus::Failed | ExecutionStatus::Timeout));
        for reserve in reserves {
            let run = match reserve.trigger {
                Some(ReserveTrigger::AfterOrthogonal) => true,
                Some(ReserveTrigger::Roadblock) => any_roadblock,
                None => true,
            };
            if !run {
                continue;
            }
            let deps_ok = reserve
                .dependencies
                .iter()
                .all(|d| done.get(d).map(|e| e.status.is_terminal()).unwrap_or(true));
            if !deps_ok {
                continue;
            }

            let mut exec = self.run_one_seeded(reserve, &done).await?;
            // Reserve outputs never collide with orthogonal ones.
            if done.contains_key(&exec.task.id) {
                exec.task.id = format!("{}-reserve", exec.task.id);
            }
            done.insert(exec.task.id.clone(), exec);
        }

        Ok(done)
    }

    /// Run a reserve task, first copying every successful sibling's files
    /// into its workspace (orthogonality guarantees no clobbering).
    async fn run_one_seeded(
        &self,
        task: OrthogonalTask,
        done: &BTreeMap<String, TaskExecution>,
    ) -> Result<TaskExecution> {
        let workspace = self.prepare_workspace(&task)?;
        for exec in done.values() {
            if exec.status != ExecutionStatus::Complete {
                continue;
            }
            for (file, content) in &exec.files {
                let dest = workspace.join(file);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, content)?;
            }
        }
        self.run_in_workspace(task, workspace).await
    }

    async fn run_one(&self, task: OrthogonalTask) -> Result<TaskExecution> {
        let workspace = self.prepare_workspace(&task)?;
        self.run_in_workspace(task, workspace).await
    }

    fn prepare_workspace(&self, task: &OrthogonalTask) -> Result<PathBuf> {
        if let Some(manager) = &self.worktrees {
            let info = manager.create(&task.id)?;
            return Ok(info.path);
        }
        let dir = std::env::temp_dir().join(format!(
            "axiom-{}-{}",
            task.id,
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir)?;
        self.cleanup.register_dir(dir.clone());
        Ok(dir)
    }

    async fn run_in_workspace(
        &self,
        task: OrthogonalTask,
        workspace: PathBuf,
    ) -> Result<TaskExecution> {
        let mut exec = TaskExecution::new(task, workspace.display().to_string());

        let attempts_allowed = 1 + self.config.max_retries;
        for attempt in 1..=attempts_allowed {
            let status = self.run_attempt(&mut exec, &workspace).await;
            exec.status = status;
            if status == ExecutionStatus::Complete {
                break;
            }
            if attempt < attempts_allowed {
                let backoff = self.config.retry_backoff_ms << (attempt - 1);
                warn!(
                    task = %exec.task.id,
                    attempt,
                    backoff_ms = backoff,
                    "subtask attempt failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        if exec.status != ExecutionStatus::Complete {
            // Retries exhausted; whatever the last attempt did, the record
            // is a failure.
            exec.status = ExecutionStatus::Failed;
        }

        // Collect the declared outputs that actually exist.
        for file in exec.task.expected_outputs.clone() {
            let path = workspace.join(&file);
            if let Ok(content) = std::fs::read_to_string(&path) {
                exec.files.insert(file, content);
            }
        }

        if let (Some(manager), ExecutionStatus::Complete) = (&self.worktrees, exec.status) {
            let produced: Vec<String> = exec.files.keys().cloned().collect();
            if let Err(e) = manager.commit(&exec.task.id, &produced) {
                warn!(task = %exec.task.id, error = %e, "worktree commit failed");
            } else if self.config.auto_merge {
                if let Err(e) = manager.merge(&exec.task.id) {
                    warn!(task = %exec.task.id, error = %e, "auto-merge failed");
                }
            }
        }

        info!(
            task = %exec.task.id,
            status = ?exec.status,
            attempts = exec.attempts,
            files = exec.files.len(),
            "subtask finished"
        );
        Ok(exec)
    }

    /// One attempt: stream output, watch for completion, enforce the
    /// timeout (ESC, one-second grace, kill).
    async fn run_attempt(&self, exec: &mut TaskExecution, workspace: &Path) -> ExecutionStatus {
        let task_id = self.alloc_task_id();
        exec.attempts += 1;
        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(chrono::Utc::now());

        let (tx, rx) = flume::unbounded::<StreamChunk>();
        let request = ExecutionRequest {
            task_id,
            prompt: exec.task.prompt.clone(),
            system_prompt: None,
            args: json!({ "workdir": exec.workspace }),
        };

        let executor = Arc::clone(&self.executor);
        let driver = tokio::spawn(async move { executor.execute(request, tx).await });

        let deadline = Instant::now() + Duration::from_secs(self.config.task_timeout_secs);
        let poll = Duration::from_millis(self.config.watchdog_poll_ms.max(10));
        let mut detected = false;

        loop {
            match tokio::time::timeout(poll, rx.recv_async()).await {
                Ok(Ok(chunk)) => {
                    exec.output.push_str(&chunk.data);
                    if detect_completion(&exec.output, &exec.task.expected_outputs, workspace) {
                        if self.config.settle_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;
                        }
                        while let Ok(c) = rx.try_recv() {
                            exec.output.push_str(&c.data);
                        }
                        self.executor.kill(task_id);
                        detected = true;
                        break;
                    }
                }
                Ok(Err(_)) => break, // stream closed: the attempt finished
                Err(_) => {}         // poll tick
            }

            if Instant::now() >= deadline {
                warn!(task = %exec.task.id, "subtask timeout: ESC, then kill");
                let _ = self.executor.write(task_id, "\x1b");
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.executor.kill(task_id);
                let _ = driver.await;
                return ExecutionStatus::Timeout;
            }
        }

        match driver.await {
            Ok(Ok(output)) => {
                if exec.output.is_empty() {
                    exec.output = output;
                }
                if detected
                    || detect_completion(&exec.output, &exec.task.expected_outputs, workspace)
                {
                    ExecutionStatus::Complete
                } else {
                    ExecutionStatus::Failed
                }
            }
            Ok(Err(ExecutorError::IdleTimeout(_) | ExecutorError::StartupTimeout(_))) => {
                ExecutionStatus::Timeout
            }
            Ok(Err(e)) => {
                warn!(task = %exec.task.id, error = %e, "subtask attempt errored");
                ExecutionStatus::Failed
            }
            Err(e) => {
                warn!(task = %exec.task.id, error = %e, "subtask driver join error");
                ExecutionStatus::Failed
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SwarmExecutor — the `orchestrate` tool surface
// ---------------------------------------------------------------------------

/// Executor registered for the `orchestrate` tool: decomposes, runs the
/// swarm, merges, and reports as JSON.
pub struct SwarmExecutor {
    agent_executor: Arc<dyn Executor>,
    base_config: SwarmConfig,
    cleanup: Arc<CleanupRegistry>,
    decomposer: Decomposer,
    /// Lazily created on the first worktree-backed run, then reused so
    /// `merge_all` sees every registered worktree.
    worktrees: Mutex<Option<Arc<WorktreeManager>>>,
    repo_root: PathBuf,
}

impl SwarmExecutor {
    pub fn new(
        agent_executor: Arc<dyn Executor>,
        base_config: SwarmConfig,
        cleanup: Arc<CleanupRegistry>,
        repo_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_executor,
            base_config,
            cleanup,
            decomposer: Decomposer::new(),
            worktrees: Mutex::new(None),
            repo_root: repo_root.into(),
        }
    }

    fn worktree_manager(&self, base_branch: &str) -> Arc<WorktreeManager> {
        let mut guard = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get_or_insert_with(|| {
                Arc::new(WorktreeManager::new(self.repo_root.clone(), base_branch))
            })
            .clone()
    }

    fn config_for(&self, args: &Value) -> SwarmConfig {
        let mut config = self.base_config.clone();
        if let Some(v) = args.get("useWorktree").and_then(Value::as_bool) {
            config.use_worktrees = v;
        }
        if let Some(v) = args.get("baseBranch").and_then(Value::as_str) {
            config.base_branch = v.to_string();
        }
        if let Some(v) = args.get("autoMerge").and_then(Value::as_bool) {
            config.auto_merge = v;
        }
        config
    }
}

#[async_trait]
impl Executor for SwarmExecutor {
    fn tool(&self) -> &str {
        "orchestrate"
    }

    async fn execute(
        &self,
        request: ExecutionRequest,
        stream: flume::Sender<StreamChunk>,
    ) -> ax_hooks::executor::Result<String> {
        let action = request
            .args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("execute");

        match action {
            "decompose" => {
                let tasks = self
                    .decomposer
                    .decompose(&request.prompt)
                    .map_err(|e| ExecutorError::Internal(e.to_string()))?;
                Ok(serde_json::to_string_pretty(&tasks)
                    .map_err(|e| ExecutorError::Internal(e.to_string()))?)
            }
            "execute" => {
                let tasks = self
                    .decomposer
                    .decompose(&request.prompt)
                    .map_err(|e| ExecutorError::Internal(e.to_string()))?;
                let _ = stream.send(StreamChunk {
                    task_id: request.task_id,
                    data: format!("decomposed into {} subtasks\n", tasks.len()),
                });

                let config = self.config_for(&request.args);
                let worktrees = config
                    .use_worktrees
                    .then(|| self.worktree_manager(&config.base_branch));
                let engine = Arc::new(SwarmEngine::new(
                    Arc::clone(&self.agent_executor),
                    config,
                    worktrees,
                    Arc::clone(&self.cleanup),
                ));

                let executions = engine
                    .execute(tasks)
                    .await
                    .map_err(|e| ExecutorError::Internal(e.to_string()))?;
                let merged = merge_outputs(&executions);

                let _ = stream.send(StreamChunk {
                    task_id: request.task_id,
                    data: format!(
                        "swarm finished: {} executions, {} merged files\n",
                        executions.len(),
                        merged.len()
                    ),
                });

                let report = json!({
                    "executions": executions,
                    "merged": merged,
                });
                Ok(serde_json::to_string_pretty(&report)
                    .map_err(|e| ExecutorError::Internal(e.to_string()))?)
            }
            "mergeAll" | "merge_all" => {
                let manager = {
                    let guard = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
                    guard.clone()
                };
                let summary = manager
                    .map(|m| m.merge_all())
                    .unwrap_or_default();
                Ok(serde_json::to_string(&summary)
                    .map_err(|e| ExecutorError::Internal(e.to_string()))?)
            }
            "cleanup" => {
                self.cleanup.cleanup_all();
                Ok(json!({ "cleaned": true }).to_string())
            }
            "status" => {
                let worktrees = {
                    let guard = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
                    guard.as_ref().map(|m| m.registered()).unwrap_or_default()
                };
                Ok(serde_json::to_string_pretty(&json!({ "worktrees": worktrees }))
                    .map_err(|e| ExecutorError::Internal(e.to_string()))?)
            }
            other => Err(ExecutorError::Internal(format!(
                "unknown orchestrate action: {other}"
            ))),
        }
    }

    fn inject(&self, _task_id: TaskId, _command: &str) -> ax_hooks::executor::Result<()> {
        Err(ExecutorError::Injection(
            "orchestrate runs have no direct PTY to inject into".into(),
        ))
    }

    fn write(&self, task_id: TaskId, _data: &str) -> ax_hooks::executor::Result<()> {
        Err(ExecutorError::NoSession(task_id))
    }

    fn interrupt(&self, task_id: TaskId) -> ax_hooks::executor::Result<()> {
        Err(ExecutorError::NoSession(task_id))
    }

    fn kill(&self, _task_id: TaskId) {}

    fn running(&self, _task_id: TaskId) -> bool {
        false
    }

    fn output(&self, _task_id: TaskId) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    // -- Mock agent executor --

    type Behaviour = Box<
        dyn Fn(&ExecutionRequest, &flume::Sender<StreamChunk>, &AtomicBool) -> std::result::Result<String, ExecutorError>
            + Send
            + Sync,
    >;

    struct MockAgent {
        behaviour: Behaviour,
        kills: Mutex<HashMap<TaskId, Arc<AtomicBool>>>,
        writes: Mutex<Vec<(TaskId, String)>>,
    }

    impl MockAgent {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                kills: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
            })
        }

        fn writes(&self) -> Vec<(TaskId, String)> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for MockAgent {
        fn tool(&self) -> &str {
            "spawn"
        }
        async fn execute(
            &self,
            request: ExecutionRequest,
            stream: flume::Sender<StreamChunk>,
        ) -> ax_hooks::executor::Result<String> {
            let killed = Arc::new(AtomicBool::new(false));
            self.kills
                .lock()
                .unwrap()
                .insert(request.task_id, Arc::clone(&killed));
            let behaviour = &self.behaviour;
            // Run the scripted behaviour on a blocking thread so it can
            // sleep without starving the runtime.
            let result = tokio::task::block_in_place(|| behaviour(&request, &stream, &killed));
            result
        }
        fn inject(&self, _task_id: TaskId, _command: &str) -> ax_hooks::executor::Result<()> {
            Ok(())
        }
        fn write(&self, task_id: TaskId, data: &str) -> ax_hooks::executor::Result<()> {
            self.writes.lock().unwrap().push((task_id, data.into()));
            Ok(())
        }
        fn interrupt(&self, _task_id: TaskId) -> ax_hooks::executor::Result<()> {
            Ok(())
        }
        fn kill(&self, task_id: TaskId) {
            if let Some(flag) = self.kills.lock().unwrap().get(&task_id) {
                flag.store(true, Ordering::SeqCst);
            }
        }
        fn running(&self, _task_id: TaskId) -> bool {
            false
        }
        fn output(&self, _task_id: TaskId) -> Option<String> {
            None
        }
    }

    fn fast_config() -> SwarmConfig {
        SwarmConfig {
            task_timeout_secs: 2,
            max_retries: 1,
            retry_backoff_ms: 10,
            watchdog_poll_ms: 50,
            settle_ms: 0,
            ..SwarmConfig::default()
        }
    }

    fn task(id: &str, expected: &[&str]) -> OrthogonalTask {
        OrthogonalTask {
            id: id.into(),
            prompt: format!("implement {id}"),
            estimated_secs: 10,
            expected_outputs: expected.iter().map(|s| s.to_string()).collect(),
            dependencies: vec![],
            trigger: None,
        }
    }

    fn engine(agent: Arc<MockAgent>, config: SwarmConfig) -> Arc<SwarmEngine> {
        Arc::new(SwarmEngine::new(
            agent,
            config,
            None,
            Arc::new(CleanupRegistry::new()),
        ))
    }

    /// Behaviour: create the expected file in the workspace and announce it.
    fn productive_agent() -> Arc<MockAgent> {
        MockAgent::new(Box::new(|request, stream, _killed| {
            let workdir = request
                .args
                .get("workdir")
                .and_then(Value::as_str)
                .unwrap()
                .to_string();
            // Derive a file name from the prompt's task id.
            let file = if request.prompt.contains("alpha") {
                "alpha.js"
            } else {
                "beta.js"
            };
            let path = std::path::Path::new(&workdir).join(file);
            std::fs::write(&path, "export async function run() {}").unwrap();
            let _ = stream.send(StreamChunk {
                task_id: request.task_id,
                data: format!("File created: {file}\n"),
            });
            Ok(format!("File created: {file}\n"))
        }))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn productive_tasks_complete_and_collect_files() {
        let agent = productive_agent();
        let engine = engine(agent, fast_config());

        let tasks = vec![task("alpha", &["alpha.js"]), task("beta", &["beta.js"])];
        let done = engine.execute(tasks).await.unwrap();

        assert_eq!(done.len(), 2);
        let alpha = &done["alpha"];
        assert_eq!(alpha.status, ExecutionStatus::Complete);
        assert_eq!(alpha.attempts, 1);
        assert!(alpha.files["alpha.js"].contains("export async"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_sends_esc_retries_and_fails() {
        // Streams noise but never produces a file or marker; ignores kill
        // only until the flag is set.
        let agent = MockAgent::new(Box::new(|request, stream, killed| {
            loop {
                if killed.load(Ordering::SeqCst) {
                    return Ok(String::new());
                }
                let _ = stream.send(StreamChunk {
                    task_id: request.task_id,
                    data: "thinking very hard...\n".into(),
                });
                std::thread::sleep(Duration::from_millis(100));
            }
        }));
        let mut config = fast_config();
        config.task_timeout_secs = 1;
        config.max_retries = 1;
        let engine = engine(agent.clone(), config);

        let done = engine.execute(vec![task("stuck", &["never.js"])]).await.unwrap();
        let exec = &done["stuck"];
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.attempts, 2, "one retry after the first timeout");
        // ESC went to the PTY before the kill on each attempt.
        let escs = agent
            .writes()
            .iter()
            .filter(|(_, data)| data.contains('\u{1b}'))
            .count();
        assert_eq!(escs, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_sibling_triggers_roadblock_reserve() {
        let agent = MockAgent::new(Box::new(|request, stream, _killed| {
            if request.prompt.contains("doomed") {
                return Err(ExecutorError::Internal("agent crashed".into()));
            }
            let _ = stream.send(StreamChunk {
                task_id: request.task_id,
                data: "File created: ok.js\n".into(),
            });
            Ok("File created: ok.js\n".into())
        }));
        let engine = engine(agent, fast_config());

        let mut rescue = task("rescue", &[]);
        rescue.trigger = Some(ReserveTrigger::Roadblock);
        let tasks = vec![task("doomed", &["never.js"]), task("fine", &["ok.js"]), rescue];

        let done = engine.execute(tasks).await.unwrap();
        assert_eq!(done["doomed"].status, ExecutionStatus::Failed);
        assert!(done.contains_key("rescue"), "roadblock reserve must run");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reserve_skipped_when_everything_succeeded() {
        let agent = MockAgent::new(Box::new(|request, stream, _killed| {
            let _ = stream.send(StreamChunk {
                task_id: request.task_id,
                data: "File created: ok.js\n".into(),
            });
            Ok("File created: ok.js\n".into())
        }));
        let engine = engine(agent, fast_config());

        let mut rescue = task("rescue", &[]);
        rescue.trigger = Some(ReserveTrigger::Roadblock);
        let done = engine
            .execute(vec![task("fine", &["ok.js"]), rescue])
            .await
            .unwrap();
        assert!(!done.contains_key("rescue"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn after_orthogonal_reserve_gets_seeded_files() {
        let agent = MockAgent::new(Box::new(|request, stream, _killed| {
            let workdir = request
                .args
                .get("workdir")
                .and_then(Value::as_str)
                .unwrap()
                .to_string();
            if request.prompt.contains("integrate") {
                // The reserve workspace must already hold the sibling's file.
                let seeded = std::path::Path::new(&workdir).join("part.js").exists();
                let _ = stream.send(StreamChunk {
                    task_id: request.task_id,
                    data: format!("seeded={seeded}\nFile created: integration.md\n"),
                });
                return Ok(format!("seeded={seeded}"));
            }
            std::fs::write(std::path::Path::new(&workdir).join("part.js"), "export {}").unwrap();
            let _ = stream.send(StreamChunk {
                task_id: request.task_id,
                data: "File created: part.js\n".into(),
            });
            Ok("done".into())
        }));
        let engine = engine(agent, fast_config());

        let mut integration = OrthogonalTask {
            id: "integration".into(),
            prompt: "integrate everything".into(),
            estimated_secs: 10,
            expected_outputs: vec![],
            dependencies: vec!["part".into()],
            trigger: Some(ReserveTrigger::AfterOrthogonal),
        };
        integration.dependencies = vec!["part".into()];

        let done = engine
            .execute(vec![task("part", &["part.js"]), integration])
            .await
            .unwrap();
        assert!(done["integration"].output.contains("seeded=true"));
    }

    #[test]
    fn completion_detection_variants() {
        let dir = tempfile::tempdir().unwrap();
        let expected = vec!["lib.js".to_string()];

        assert!(detect_completion("... File created: lib.js", &expected, dir.path()));
        assert!(detect_completion("the module has been created", &expected, dir.path()));
        // Two prompt boxes = agent came back to idle.
        assert!(detect_completion("│ > build\n...work...\n│ > ", &expected, dir.path()));
        // A fence alone is not enough without the files on disk.
        assert!(!detect_completion("```js\ncode\n```", &expected, dir.path()));
        std::fs::write(dir.path().join("lib.js"), "x").unwrap();
        assert!(detect_completion("```js\ncode\n```", &expected, dir.path()));
        assert!(!detect_completion("just chatting", &expected, dir.path()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dependency_cycle_is_rejected() {
        let agent = productive_agent();
        let engine = engine(agent, fast_config());

        let mut a = task("a", &["a.js"]);
        a.dependencies = vec!["b".into()];
        let mut b = task("b", &["b.js"]);
        b.dependencies = vec!["a".into()];

        let err = engine.execute(vec![a, b]).await.unwrap_err();
        assert!(matches!(err, SwarmError::DependencyCycle(_)));
    }
}
