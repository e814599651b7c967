use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task identifiers are epoch-millisecond timestamps. Callers receive the id
/// synchronously when a request is admitted, so it doubles as a creation
/// timestamp. The registry bumps the value on collision.
pub type TaskId = u64;

/// Current wall-clock time as a candidate [`TaskId`].
pub fn now_millis() -> TaskId {
    Utc::now().timestamp_millis() as TaskId
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
    Timeout,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Transitions are monotonic except `Running -> Interrupted -> Running`,
    /// which is reserved for hook-originated interrupts that resume.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Interrupted)
                | (TaskStatus::Running, TaskStatus::Timeout)
                | (TaskStatus::Interrupted, TaskStatus::Running)
        )
    }

    /// Terminal states are never left again (Interrupted may resume).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Bookkeeping counters accumulated over a task's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub files_created: Vec<String>,
    pub retries: u32,
    pub interventions: u32,
}

/// A supervised unit of work: one admitted request bound to one executor.
///
/// Owned exclusively by the [`crate::registry::TaskRegistry`]; mutated only
/// through registry methods so status transitions stay totally ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    pub prompt: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Rolling output buffer, capped by the registry.
    pub output: String,
    /// Name of the tool/executor this task is bound to, once started.
    pub executor: Option<String>,
    pub children: Vec<TaskId>,
    pub error: Option<String>,
    pub metadata: TaskMetadata,
}

impl Task {
    pub fn new(id: TaskId, prompt: impl Into<String>, parent_id: Option<TaskId>) -> Self {
        Self {
            id,
            parent_id,
            prompt: prompt.into(),
            status: TaskStatus::Pending,
            started_at: None,
            ended_at: None,
            output: String::new(),
            executor: None,
            children: Vec::new(),
            error: None,
            metadata: TaskMetadata::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskEvent — registry watcher notifications
// ---------------------------------------------------------------------------

/// Emitted on every task status transition, for dashboards and monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

/// Observable lifecycle of one PTY-attached agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Ready,
    Working,
    Complete,
    Error,
}

/// Public view of a live agent instance (PTY session).
///
/// The PTY handle itself stays private to the supervisor; this struct is the
/// copyable snapshot handed to status tools and the swarm engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: Uuid,
    pub state: AgentState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    pub committed: bool,
    pub merged: bool,
    pub intervention_count: u32,
}

impl AgentInstance {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: AgentState::Starting,
            created_at: now,
            last_activity: now,
            worktree_path: None,
            branch: None,
            committed: false,
            merged: false,
            intervention_count: 0,
        }
    }
}

impl Default for AgentInstance {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Orthogonal subtasks
// ---------------------------------------------------------------------------

/// When a reserve task is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveTrigger {
    /// Run unconditionally after all orthogonal tasks reach a terminal state.
    AfterOrthogonal,
    /// Run only when at least one orthogonal task failed or timed out.
    Roadblock,
}

/// A planned subtask whose declared output files are disjoint from every
/// sibling's. Orthogonality is guaranteed at decomposition time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrthogonalTask {
    pub id: String,
    pub prompt: String,
    /// Planner's duration estimate, in seconds.
    pub estimated_secs: u64,
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub trigger: Option<ReserveTrigger>,
}

impl OrthogonalTask {
    pub fn is_reserve(&self) -> bool {
        self.trigger.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Complete | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

/// One attempt-tracked run of an [`OrthogonalTask`] in its own workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task: OrthogonalTask,
    pub status: ExecutionStatus,
    pub workspace: String,
    pub instance_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub output: String,
    /// Declared output files actually produced, filename -> content.
    pub files: std::collections::BTreeMap<String, String>,
    pub attempts: u32,
}

impl TaskExecution {
    pub fn new(task: OrthogonalTask, workspace: impl Into<String>) -> Self {
        Self {
            task,
            status: ExecutionStatus::Pending,
            workspace: workspace.into(),
            instance_id: None,
            started_at: None,
            output: String::new(),
            files: std::collections::BTreeMap::new(),
            attempts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
