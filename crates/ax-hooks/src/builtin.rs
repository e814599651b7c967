//! Built-in admission hooks: request validation, destructive-command
//! screening, and parallel-intent detection.

use async_trait::async_trait;
use regex::RegexSet;
use serde_json::json;
use tracing::warn;

use crate::hook::{Hook, HookContext, HookError, HookEvent, HookResult};

// ---------------------------------------------------------------------------
// SecurityHook
// ---------------------------------------------------------------------------

const REQUEST_EVENTS: &[HookEvent] = &[HookEvent::RequestReceived];

/// Blocks prompts that ask for destructive filesystem or device operations
/// before any agent is spawned.
pub struct SecurityHook {
    patterns: RegexSet,
}

impl SecurityHook {
    pub fn new() -> Self {
        let patterns = RegexSet::new([
            r"rm\s+-[rf]{1,2}[a-z]*\s+/(\s|$)",
            r"rm\s+-[rf]{1,2}[a-z]*\s+/\*",
            r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:",
            r"mkfs(\.\w+)?\s",
            r"dd\s+.*of=/dev/(sd|hd|nvme|disk)",
            r">\s*/dev/(sd|hd|nvme)",
            r"chmod\s+-R\s+777\s+/(\s|$)",
        ])
        .expect("built-in security patterns must compile");
        Self { patterns }
    }
}

impl Default for SecurityHook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hook for SecurityHook {
    fn name(&self) -> &str {
        "security"
    }

    fn events(&self) -> &[HookEvent] {
        REQUEST_EVENTS
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn handle(&self, ctx: &mut HookContext) -> Result<HookResult, HookError> {
        let Some(request) = &ctx.request else {
            return Ok(HookResult::Continue);
        };
        let prompt = request
            .args
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if let Some(idx) = self.patterns.matches(prompt).iter().next() {
            warn!(tool = %request.tool, pattern = idx, "destructive prompt blocked");
            return Ok(HookResult::Block {
                reason: format!("dangerous path: prompt matches destructive pattern #{idx}"),
            });
        }
        Ok(HookResult::Continue)
    }
}

// ---------------------------------------------------------------------------
// ValidationHook
// ---------------------------------------------------------------------------

/// Rejects requests that cannot possibly execute: a missing or empty prompt
/// on tools that require one.
pub struct ValidationHook;

#[async_trait]
impl Hook for ValidationHook {
    fn name(&self) -> &str {
        "validation"
    }

    fn events(&self) -> &[HookEvent] {
        REQUEST_EVENTS
    }

    fn priority(&self) -> i32 {
        90
    }

    async fn handle(&self, ctx: &mut HookContext) -> Result<HookResult, HookError> {
        let Some(request) = &ctx.request else {
            return Ok(HookResult::Continue);
        };
        if request.tool != "spawn" {
            return Ok(HookResult::Continue);
        }
        let prompt = request.args.get("prompt").and_then(|v| v.as_str());
        match prompt {
            Some(p) if !p.trim().is_empty() => Ok(HookResult::Continue),
            _ => Ok(HookResult::Block {
                reason: "spawn requires a non-empty prompt".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ParallelDetectionHook
// ---------------------------------------------------------------------------

/// Rewrites `spawn` requests that ask for multiple concurrent approaches
/// into an `orchestrate execute`, so they land in the swarm engine instead
/// of a single PTY.
pub struct ParallelDetectionHook {
    markers: regex::Regex,
}

impl ParallelDetectionHook {
    pub fn new() -> Self {
        Self {
            markers: regex::Regex::new(
                r"(?i)\bin parallel\b|\bsimultaneously\b|\b(\d+)\s+(?:different\s+)?(?:ways|approaches|variants)\b",
            )
            .expect("parallel markers must compile"),
        }
    }
}

impl Default for ParallelDetectionHook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hook for ParallelDetectionHook {
    fn name(&self) -> &str {
        "parallel-detection"
    }

    fn events(&self) -> &[HookEvent] {
        REQUEST_EVENTS
    }

    fn priority(&self) -> i32 {
        50
    }

    async fn handle(&self, ctx: &mut HookContext) -> Result<HookResult, HookError> {
        let Some(request) = &ctx.request else {
            return Ok(HookResult::Continue);
        };
        if request.tool != "spawn" {
            return Ok(HookResult::Continue);
        }
        // An explicit pattern wins over heuristics.
        if request.args.get("pattern").and_then(|v| v.as_str()) == Some("single") {
            return Ok(HookResult::Continue);
        }
        let prompt = request
            .args
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if self.markers.is_match(prompt)
            || request.args.get("pattern").and_then(|v| v.as_str()) == Some("parallel")
        {
            return Ok(HookResult::Redirect {
                tool: "orchestrate".into(),
                args: json!({ "action": "execute", "prompt": prompt }),
            });
        }
        Ok(HookResult::Continue)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
