//! Heuristic, rule-table based task decomposition.
//!
//! The planner never calls a model: a keyword table maps prompt families to
//! fixed sets of file-disjoint subtasks, plus a reserve integration task
//! that runs after all of them. Orthogonality is guaranteed by construction
//! and re-checked before anything executes.

use thiserror::Error;
use tracing::debug;

use ax_core::types::{OrthogonalTask, ReserveTrigger};

#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("expected-output collision between '{0}' and '{1}' on {2}")]
    OutputCollision(String, String, String),
}

// ---------------------------------------------------------------------------
// Decomposer
// ---------------------------------------------------------------------------

struct Blueprint {
    keywords: &'static [&'static str],
    subtasks: &'static [(&'static str, &'static str, &'static [&'static str], u64)],
}

/// Keyword table: (id, sub-prompt, expected outputs, estimated seconds).
const BLUEPRINTS: &[Blueprint] = &[
    Blueprint {
        keywords: &["rest api", "rest", "api", "endpoint", "http server", "crud"],
        subtasks: &[
            (
                "models",
                "Create the data models only. Write the model definitions and nothing else.",
                &["models/index.js"],
                120,
            ),
            (
                "routes",
                "Create the route handlers only. Assume models exist at models/index.js.",
                &["routes/index.js"],
                120,
            ),
            (
                "middleware",
                "Create the middleware only: auth, logging, error handling.",
                &["middleware/index.js"],
                90,
            ),
            (
                "tests",
                "Create the API test suite only. Do not implement application code.",
                &["tests/api.test.js"],
                90,
            ),
            (
                "config",
                "Create the configuration module only: env loading and defaults.",
                &["config/index.js"],
                60,
            ),
        ],
    },
    Blueprint {
        keywords: &["cache", "lru", "memoiz"],
        subtasks: &[
            (
                "core",
                "Implement the cache core: storage, get/set, size accounting.",
                &["src/cache.js"],
                120,
            ),
            (
                "eviction",
                "Implement the eviction policy only, against the cache core interface.",
                &["src/eviction.js"],
                90,
            ),
            (
                "ttl",
                "Implement TTL expiry only, against the cache core interface.",
                &["src/ttl.js"],
                90,
            ),
            (
                "tests",
                "Create the cache test suite only.",
                &["tests/cache.test.js"],
                90,
            ),
        ],
    },
];

/// Rule-based prompt splitter.
pub struct Decomposer;

impl Decomposer {
    pub fn new() -> Self {
        Self
    }

    /// Split a prompt into orthogonal subtasks plus one reserve
    /// `integration` task depending on all of them.
    pub fn decompose(&self, prompt: &str) -> Result<Vec<OrthogonalTask>, DecomposeError> {
        let lower = prompt.to_lowercase();

        let mut tasks: Vec<OrthogonalTask> = BLUEPRINTS
            .iter()
            .find(|b| b.keywords.iter().any(|k| lower.contains(k)))
            .map(|b| {
                b.subtasks
                    .iter()
                    .map(|(id, sub, outputs, secs)| OrthogonalTask {
                        id: (*id).to_string(),
                        prompt: format!("{sub}\n\nOverall goal: {prompt}"),
                        estimated_secs: *secs,
                        expected_outputs: outputs.iter().map(|s| s.to_string()).collect(),
                        dependencies: Vec::new(),
                        trigger: None,
                    })
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![OrthogonalTask {
                    id: "implementation".into(),
                    prompt: prompt.to_string(),
                    estimated_secs: 300,
                    expected_outputs: vec!["index.js".into()],
                    dependencies: Vec::new(),
                    trigger: None,
                }]
            });

        validate_orthogonality(&tasks)?;

        let all_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        tasks.push(OrthogonalTask {
            id: "integration".into(),
            prompt: format!(
                "Integrate the results of the completed subtasks into a working whole.\n\nOverall goal: {prompt}"
            ),
            estimated_secs: 120,
            expected_outputs: Vec::new(),
            dependencies: all_ids,
            trigger: Some(ReserveTrigger::AfterOrthogonal),
        });

        debug!(count = tasks.len(), "prompt decomposed");
        Ok(tasks)
    }
}

impl Default for Decomposer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject any pair of non-reserve tasks whose declared outputs overlap.
pub fn validate_orthogonality(tasks: &[OrthogonalTask]) -> Result<(), DecomposeError> {
    for (i, a) in tasks.iter().enumerate() {
        if a.is_reserve() {
            continue;
        }
        for b in tasks.iter().skip(i + 1) {
            if b.is_reserve() {
                continue;
            }
            for file in &a.expected_outputs {
                if b.expected_outputs.contains(file) {
                    return Err(DecomposeError::OutputCollision(
                        a.id.clone(),
                        b.id.clone(),
                        file.clone(),
                    ));
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
