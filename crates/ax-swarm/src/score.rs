//! Deterministic scoring and best-of selection when competing subtasks
//! produce the same file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ax_core::types::{ExecutionStatus, TaskExecution};

/// Tokens whose presence nudges a candidate's score up.
const QUALITY_TOKENS: &[&str] = &["test", "error", "async", "export", "import"];

/// Score one produced file in the context of its execution. Deterministic:
/// identical inputs always give the identical score.
pub fn score_execution(exec: &TaskExecution, content: &str) -> f64 {
    let mut score = 0.0_f64;

    if exec.status == ExecutionStatus::Complete {
        score += 0.5;
    }

    let total = exec.task.expected_outputs.len();
    if total > 0 {
        let produced = exec
            .task
            .expected_outputs
            .iter()
            .filter(|f| exec.files.contains_key(*f))
            .count();
        score += 0.3 * (produced as f64 / total as f64);
    }

    for token in QUALITY_TOKENS {
        if content.contains(token) {
            score += 0.05;
        }
    }

    if content.contains("TODO") || content.contains("FIXME") {
        score -= 0.1;
    }

    score -= 0.1 * exec.attempts.saturating_sub(1) as f64;

    score.clamp(0.0, 1.0)
}

/// A merged file with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedFile {
    pub content: String,
    /// Id of the execution whose candidate won.
    pub provenance: String,
    pub score: f64,
}

/// For each file produced by any execution, pick the highest-scoring
/// candidate. Ties break by task id, lexicographically.
pub fn merge_outputs(executions: &BTreeMap<String, TaskExecution>) -> BTreeMap<String, MergedFile> {
    let mut merged: BTreeMap<String, MergedFile> = BTreeMap::new();

    // BTreeMap iteration is id-ascending, so on a tie the first (lowest id)
    // candidate sticks.
    for (task_id, exec) in executions {
        for (file, content) in &exec.files {
            let score = score_execution(exec, content);
            let better = merged
                .get(file)
                .map(|current| score > current.score)
                .unwrap_or(true);
            if better {
                merged.insert(
                    file.clone(),
                    MergedFile {
                        content: content.clone(),
                        provenance: task_id.clone(),
                        score,
                    },
                );
            }
        }
    }

    merged
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ax_core::types::OrthogonalTask;

    fn exec(id: &str, status: ExecutionStatus, attempts: u32) -> TaskExecution {
        let task = OrthogonalTask {
            id: id.into(),
            prompt: "p".into(),
            estimated_secs: 1,
            expected_outputs: vec!["index.js".into()],
            dependencies: vec![],
            trigger: None,
        };
        let mut e = TaskExecution::new(task, "/tmp/ws");
        e.status = status;
        e.attempts = attempts;
        e
    }

    #[test]
    fn complete_beats_incomplete() {
        let mut done = exec("a", ExecutionStatus::Complete, 1);
        done.files.insert("index.js".into(), "plain".into());
        let failed = exec("b", ExecutionStatus::Failed, 1);

        let plain = "plain";
        assert!(score_execution(&done, plain) > score_execution(&failed, plain));
    }

    #[test]
    fn quality_tokens_add_and_todo_subtracts() {
        let mut e = exec("a", ExecutionStatus::Complete, 1);
        e.files.insert("index.js".into(), String::new());

        let base = score_execution(&e, "nothing interesting");
        let tokens = score_execution(&e, "export async function test() {}");
        let stubbed = score_execution(&e, "nothing interesting TODO");

        assert!(tokens > base);
        assert!(stubbed < base);
    }

    #[test]
    fn retries_cost_a_tenth_each() {
        let mut first = exec("a", ExecutionStatus::Complete, 1);
        first.files.insert("index.js".into(), "x".into());
        let mut third = exec("a", ExecutionStatus::Complete, 3);
        third.files.insert("index.js".into(), "x".into());

        let a = score_execution(&first, "x");
        let b = score_execution(&third, "x");
        assert!((a - b - 0.2).abs() < 1e-9);
    }

    #[test]
    fn score_is_deterministic_and_clamped() {
        let e = exec("a", ExecutionStatus::Failed, 9);
        let s1 = score_execution(&e, "TODO");
        let s2 = score_execution(&e, "TODO");
        assert_eq!(s1, s2);
        assert_eq!(s1, 0.0);

        let mut good = exec("b", ExecutionStatus::Complete, 1);
        good.files.insert("index.js".into(), String::new());
        let s = score_execution(&good, "test error async export import");
        assert!(s <= 1.0);
    }

    #[test]
    fn merge_picks_higher_scorer() {
        // Task A: complete with real code. Task B: complete but stubbed.
        let mut a = exec("task-a", ExecutionStatus::Complete, 1);
        a.files
            .insert("index.js".into(), "export async function run() {}".into());
        let mut b = exec("task-b", ExecutionStatus::Complete, 1);
        b.files.insert("index.js".into(), "// TODO write this".into());

        let mut executions = BTreeMap::new();
        executions.insert("task-a".into(), a);
        executions.insert("task-b".into(), b);

        let merged = merge_outputs(&executions);
        let winner = &merged["index.js"];
        assert_eq!(winner.provenance, "task-a");
        assert!(winner.content.contains("export async"));
    }

    #[test]
    fn ties_break_lexicographically() {
        let mut a = exec("alpha", ExecutionStatus::Complete, 1);
        a.files.insert("index.js".into(), "same content".into());
        let mut b = exec("beta", ExecutionStatus::Complete, 1);
        b.files.insert("index.js".into(), "same content".into());

        let mut executions = BTreeMap::new();
        executions.insert("beta".into(), b);
        executions.insert("alpha".into(), a);

        let merged = merge_outputs(&executions);
        assert_eq!(merged["index.js"].provenance, "alpha");
    }
}
