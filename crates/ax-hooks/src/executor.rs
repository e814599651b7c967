use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use ax_core::types::TaskId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("agent never became ready within {0}s")]
    StartupTimeout(u64),
    #[error("no output for {0}s, execution cancelled")]
    IdleTimeout(u64),
    #[error("injection failed: {0}")]
    Injection(String),
    #[error("agent exited with code {0}")]
    NonZeroExit(i32),
    #[error("no running session for task {0}")]
    NoSession(TaskId),
    #[error("executor internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

/// Everything an executor needs to run one task.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// The full (possibly hook-modified) tool args, for executor-specific
    /// knobs like `workdir` or `pattern`.
    pub args: Value,
}

/// One chunk of agent output, forwarded to the orchestrator's stream pump.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub task_id: TaskId,
    pub data: String,
}

/// The contract between the orchestrator and anything that can run a task.
///
/// One executor is registered per tool; it may drive several tasks at once,
/// but each running task is bound to exactly one live session inside the
/// executor, addressed by `task_id`. All session access goes through these
/// methods -- the PTY handle itself never escapes the executor.
#[async_trait]
pub trait Executor: Send + Sync {
    /// The tool name this executor serves.
    fn tool(&self) -> &str;

    /// Run one task to completion, sending every output chunk through
    /// `stream` as it arrives. Resolves with the accumulated output on a
    /// clean exit. May run for minutes.
    async fn execute(
        &self,
        request: ExecutionRequest,
        stream: flume::Sender<StreamChunk>,
    ) -> Result<String>;

    /// Enqueue a corrective write to the running session. No-op once the
    /// session is complete (the error is informational, not fatal).
    fn inject(&self, task_id: TaskId, command: &str) -> Result<()>;

    /// Raw input with escape-sequence translation.
    fn write(&self, task_id: TaskId, data: &str) -> Result<()>;

    /// Send ETX (0x03) to the session.
    fn interrupt(&self, task_id: TaskId) -> Result<()>;

    /// Tear down the session: stop timers, close the PTY, mark complete.
    fn kill(&self, task_id: TaskId);

    fn running(&self, task_id: TaskId) -> bool;

    /// Copy of the session's rolling output buffer.
    fn output(&self, task_id: TaskId) -> Option<String>;
}
