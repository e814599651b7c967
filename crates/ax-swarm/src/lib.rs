//! Orthogonal decomposition and parallel subtask execution.
//!
//! A prompt is split into subtasks whose declared output files are pairwise
//! disjoint; each runs in its own agent instance inside an isolated git
//! worktree; results are committed, scored, and merged back.

pub mod cleanup;
pub mod decompose;
pub mod engine;
pub mod score;
pub mod worktree;

pub use cleanup::CleanupRegistry;
pub use decompose::Decomposer;
pub use engine::{SwarmConfig, SwarmEngine, SwarmError, SwarmExecutor};
pub use score::{merge_outputs, score_execution, MergedFile};
pub use worktree::{
    GitOutput, GitRunner, MergeOutcome, MergeSummary, RealGitRunner, WorktreeInfo,
    WorktreeManager,
};
