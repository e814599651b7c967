//! The shared task table: queried by the orchestrator, presented by status
//! tools, iterated for bulk operations.
//!
//! All methods are safe to call from multiple tasks/threads. Status
//! transitions are validated against [`TaskStatus::can_transition_to`] and
//! broadcast to watchers so dashboards can follow along.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{now_millis, Task, TaskEvent, TaskId, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("invalid transition for task {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// Concurrent map of all tasks the supervisor knows about.
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Task>,
    watchers: Mutex<Vec<flume::Sender<TaskEvent>>>,
    /// Per-task output buffer cap in bytes. When exceeded, the oldest half
    /// of the buffer is discarded.
    output_cap: usize,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_output_cap(64 * 1024)
    }

    pub fn with_output_cap(output_cap: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            watchers: Mutex::new(Vec::new()),
            output_cap,
        }
    }

    /// Subscribe to status-transition events.
    pub fn watch(&self) -> flume::Receiver<TaskEvent> {
        let (tx, rx) = flume::unbounded();
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn emit(&self, task_id: TaskId, status: TaskStatus) {
        let event = TaskEvent {
            task_id,
            status,
            at: Utc::now(),
        };
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Create a pending task and return its id.
    ///
    /// Ids are epoch milliseconds; if two requests land on the same
    /// millisecond the later one is bumped until free, so ids stay unique
    /// and roughly creation-ordered.
    pub fn create(&self, prompt: impl Into<String>, parent_id: Option<TaskId>) -> TaskId {
        let prompt = prompt.into();
        let mut id = now_millis();
        loop {
            let mut inserted = false;
            self.tasks.entry(id).or_insert_with(|| {
                inserted = true;
                Task::new(id, prompt.clone(), parent_id)
            });
            if inserted {
                break;
            }
            id += 1;
        }

        if let Some(parent) = parent_id {
            if let Some(mut p) = self.tasks.get_mut(&parent) {
                p.children.push(id);
            }
        }

        debug!(task_id = id, parent = ?parent_id, "task created");
        self.emit(id, TaskStatus::Pending);
        id
    }

    fn transition(&self, id: TaskId, to: TaskStatus) -> Result<()> {
        let mut task = self.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if !task.status.can_transition_to(&to) {
            return Err(RegistryError::InvalidTransition {
                id,
                from: task.status,
                to,
            });
        }
        task.status = to;
        if to.is_terminal() || to == TaskStatus::Interrupted {
            task.ended_at = Some(Utc::now());
        }
        drop(task);
        self.emit(id, to);
        Ok(())
    }

    /// Bind an executor and mark the task running.
    pub fn start(&self, id: TaskId, executor: impl Into<String>) -> Result<()> {
        {
            let mut task = self.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            task.executor = Some(executor.into());
            task.started_at = Some(Utc::now());
        }
        self.transition(id, TaskStatus::Running)
    }

    /// Append a chunk to the task's rolling output buffer.
    pub fn append_output(&self, id: TaskId, chunk: &str) -> Result<()> {
        let mut task = self.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        task.output.push_str(chunk);
        if task.output.len() > self.output_cap {
            let half = task.output.len() / 2;
            let cut = (0..=half)
                .rev()
                .find(|i| task.output.is_char_boundary(*i))
                .unwrap_or(0);
            task.output.drain(..cut);
        }
        Ok(())
    }

    pub fn complete(&self, id: TaskId, output: Option<String>) -> Result<()> {
        if let Some(out) = output {
            let mut task = self.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            task.output = out;
        }
        info!(task_id = id, "task completed");
        self.transition(id, TaskStatus::Completed)
    }

    pub fn fail(&self, id: TaskId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        {
            let mut task = self.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            task.error = Some(reason.clone());
        }
        warn!(task_id = id, reason = %reason, "task failed");
        self.transition(id, TaskStatus::Failed)
    }

    pub fn timeout(&self, id: TaskId, reason: impl Into<String>) -> Result<()> {
        {
            let mut task = self.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
            task.error = Some(reason.into());
        }
        self.transition(id, TaskStatus::Timeout)
    }

    /// Mark a running task interrupted. Returns `false` when the task is not
    /// in a state that can be interrupted.
    pub fn interrupt(&self, id: TaskId, reason: Option<&str>) -> bool {
        if let Some(reason) = reason {
            if let Some(mut task) = self.tasks.get_mut(&id) {
                task.error = Some(reason.to_string());
            }
        }
        self.transition(id, TaskStatus::Interrupted).is_ok()
    }

    /// Resume an interrupted task (the only non-monotonic transition).
    pub fn resume(&self, id: TaskId) -> Result<()> {
        self.transition(id, TaskStatus::Running)
    }

    pub fn record_intervention(&self, id: TaskId) {
        if let Some(mut task) = self.tasks.get_mut(&id) {
            task.metadata.interventions += 1;
        }
    }

    pub fn record_file_created(&self, id: TaskId, path: impl Into<String>) {
        if let Some(mut task) = self.tasks.get_mut(&id) {
            task.metadata.files_created.push(path.into());
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    pub fn all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn running(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.clone())
            .collect()
    }

    /// All transitive descendants of `parent_id`, depth-first.
    pub fn hierarchy(&self, parent_id: TaskId) -> Vec<Task> {
        let mut out = Vec::new();
        let mut stack = match self.tasks.get(&parent_id) {
            Some(t) => t.children.clone(),
            None => return out,
        };
        while let Some(id) = stack.pop() {
            if let Some(t) = self.tasks.get(&id) {
                stack.extend(t.children.iter().copied());
                out.push(t.clone());
            }
        }
        out.sort_by_key(|t| t.id);
        out
    }

    /// Policy predicate: which running tasks should be pre-empted when a new
    /// high-priority prompt arrives. The default policy pre-empts nothing;
    /// deployments override by wrapping the registry.
    pub fn should_interrupt_for(&self, _new_prompt: &str) -> Vec<Task> {
        Vec::new()
    }

    /// Remove terminal tasks whose end time is older than `max_age`.
    /// Returns the number of removed tasks.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| {
                t.status.is_terminal() && t.ended_at.map(|e| e < cutoff).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();
        for id in &stale {
            self.tasks.remove(id);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "cleaned up terminal tasks");
        }
        stale.len()
    }

    /// Remove every terminal task regardless of age.
    pub fn clear_completed(&self) -> usize {
        let done: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        for id in &done {
            self.tasks.remove(id);
        }
        done.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
