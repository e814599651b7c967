//! The intervention controller: a stream hook that feeds the scanner and
//! decides what to do about each match.
//!
//! Decisions come back to the orchestrator as `Modify { command }` results,
//! which it forwards to the supervisor's `inject`. At most one
//! interrupt-class intervention is in flight per task; further matches queue
//! and coalesce by action. Every (task, action) pair has its own cooldown to
//! prevent flapping.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ax_core::config::InterventionConfig;
use ax_core::types::TaskId;
use ax_hooks::hook::{Hook, HookContext, HookError, HookEvent, HookResult};

use crate::rules::{default_rules, wrong_language_rule, RuleAction};
use crate::scanner::{PatternRule, PatternScanner};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One supervisor-initiated intervention, as recorded in task history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub task_id: TaskId,
    pub rule_id: String,
    pub action: RuleAction,
    pub at: DateTime<Utc>,
    pub handled: bool,
    pub success: bool,
}

/// Aggregate counters across all tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterventionStats {
    pub total_interventions: u64,
    pub successes: u64,
    pub total_response_ms: u64,
}

impl InterventionStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_interventions == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total_interventions as f64
    }

    pub fn avg_response_ms(&self) -> u64 {
        if self.successes == 0 {
            return 0;
        }
        self.total_response_ms / self.successes
    }
}

// ---------------------------------------------------------------------------
// Per-task state
// ---------------------------------------------------------------------------

struct PendingClaim {
    raised_at: Instant,
    context: String,
}

struct TaskState {
    scanner: PatternScanner,
    expected_language: Option<String>,
    last_progress: Instant,
    /// Set while an interrupt-class injection awaits evidence of effect.
    interrupt_in_flight: Option<Instant>,
    /// When the most recent interrupt was issued, for response-time scoring.
    /// Cleared by the first progress evidence that follows it.
    awaiting_effect: Option<Instant>,
    queued: BTreeSet<&'static str>,
    action_cooldowns: HashMap<&'static str, Instant>,
    pending_claims: Vec<PendingClaim>,
    history: Vec<Intervention>,
}

impl TaskState {
    fn new(extra_rules: &[PatternRule]) -> Self {
        let mut rules = default_rules();
        rules.push(wrong_language_rule());
        rules.extend(extra_rules.iter().cloned());
        Self {
            scanner: PatternScanner::with_rules(rules),
            expected_language: None,
            last_progress: Instant::now(),
            interrupt_in_flight: None,
            awaiting_effect: None,
            queued: BTreeSet::new(),
            action_cooldowns: HashMap::new(),
            pending_claims: Vec::new(),
            history: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// InterventionController
// ---------------------------------------------------------------------------

pub struct InterventionController {
    config: InterventionConfig,
    extra_rules: Vec<PatternRule>,
    tasks: Mutex<HashMap<TaskId, TaskState>>,
    stats: Mutex<InterventionStats>,
}

impl InterventionController {
    pub fn new(config: InterventionConfig) -> Self {
        Self {
            config,
            extra_rules: Vec::new(),
            tasks: Mutex::new(HashMap::new()),
            stats: Mutex::new(InterventionStats::default()),
        }
    }

    /// Add rules applied to every task's scanner on top of the defaults.
    pub fn with_rules(mut self, rules: Vec<PatternRule>) -> Self {
        self.extra_rules = rules;
        self
    }

    /// Declare the language the user asked for; fenced code in any other
    /// language triggers a switch instruction.
    pub fn set_expected_language(&self, task_id: TaskId, language: impl Into<String>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let state = tasks
            .entry(task_id)
            .or_insert_with(|| TaskState::new(&self.extra_rules));
        state.expected_language = Some(language.into().to_lowercase());
    }

    pub fn stats(&self) -> InterventionStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn history(&self, task_id: TaskId) -> Vec<Intervention> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// Drop all state for a finished task.
    pub fn forget(&self, task_id: TaskId) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    /// Process one chunk of task output; returns the command to inject, if
    /// any.
    pub fn on_chunk(&self, task_id: TaskId, chunk: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let cooldown = Duration::from_millis(self.config.action_cooldown_ms);
        let verify_window = Duration::from_secs(self.config.verify_window_secs);
        let planning_grace = Duration::from_secs(self.config.planning_grace_secs);

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let state = tasks
            .entry(task_id)
            .or_insert_with(|| TaskState::new(&self.extra_rules));

        let now = Instant::now();

        // An in-flight interrupt is considered settled after its cooldown.
        if let Some(at) = state.interrupt_in_flight {
            if now.duration_since(at) >= cooldown {
                state.interrupt_in_flight = None;
            }
        }

        // Expire claims raised on earlier chunks before scanning this one, so
        // a claim always gets at least one chunk's worth of time to produce
        // evidence.
        let mut claim_failed = false;
        state.pending_claims.retain(|claim| {
            if now.duration_since(claim.raised_at) >= verify_window {
                info!(task_id, context = %claim.context, "claimed file never materialised");
                claim_failed = true;
                false
            } else {
                true
            }
        });

        let matches = state.scanner.scan(chunk);

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let mut decision: Option<(RuleAction, String, String)> = None;

        for m in matches {
            match m.action {
                RuleAction::TrackProgress => {
                    state.last_progress = now;
                    // Progress is the evidence claims wait for, and the
                    // signal that an earlier intervention worked.
                    state.pending_claims.clear();
                    state.interrupt_in_flight = None;
                    if let Some(at) = state.awaiting_effect.take() {
                        stats.successes += 1;
                        stats.total_response_ms += now.duration_since(at).as_millis() as u64;
                        if let Some(last) = state
                            .history
                            .iter_mut()
                            .rev()
                            .find(|i| i.action.is_interrupt())
                        {
                            last.success = true;
                        }
                    }
                    state.history.push(Intervention {
                        task_id,
                        rule_id: m.rule_id.clone(),
                        action: m.action,
                        at: Utc::now(),
                        handled: true,
                        success: true,
                    });
                }
                RuleAction::VerifyClaim => {
                    state.pending_claims.push(PendingClaim {
                        raised_at: now,
                        context: m.context.clone(),
                    });
                    debug!(task_id, "claim pending verification");
                }
                RuleAction::HandleError => {
                    state.history.push(Intervention {
                        task_id,
                        rule_id: m.rule_id.clone(),
                        action: m.action,
                        at: Utc::now(),
                        handled: true,
                        success: false,
                    });
                }
                action if action.is_interrupt() => {
                    // Planning talk only matters once it has gone on past
                    // the grace period with no progress.
                    if action == RuleAction::InterruptStopPlanning
                        && now.duration_since(state.last_progress) < planning_grace
                    {
                        continue;
                    }
                    if action == RuleAction::InterruptWrongLanguage {
                        let Some(expected) = &state.expected_language else {
                            continue;
                        };
                        let seen = m.captures.first().map(|c| c.to_lowercase());
                        if seen.as_deref() == Some(expected.as_str()) {
                            continue;
                        }
                    }
                    if let Some(last) = state.action_cooldowns.get(action.as_str()) {
                        if now.duration_since(*last) < cooldown {
                            continue;
                        }
                    }
                    if decision.is_some() || state.interrupt_in_flight.is_some() {
                        state.queued.insert(action.as_str());
                        continue;
                    }
                    let message = action.message().unwrap_or_default().to_string();
                    decision = Some((action, message, m.rule_id.clone()));
                }
                _ => {}
            }
        }

        // Expired claims flip to failure and demand the real thing.
        if claim_failed && decision.is_none() && state.interrupt_in_flight.is_none() {
            state.history.push(Intervention {
                task_id,
                rule_id: "file-claim".into(),
                action: RuleAction::VerifyClaim,
                at: Utc::now(),
                handled: true,
                success: false,
            });
            decision = Some((
                RuleAction::VerifyClaim,
                "You said a file was created but it does not exist. Create it now.\n".into(),
                "file-claim".into(),
            ));
        }

        // Nothing new this chunk: drain one queued, coalesced action.
        if decision.is_none() && state.interrupt_in_flight.is_none() {
            let ready = state.queued.iter().next().copied().and_then(|name| {
                let on_cooldown = state
                    .action_cooldowns
                    .get(name)
                    .map(|at| now.duration_since(*at) < cooldown)
                    .unwrap_or(false);
                if on_cooldown {
                    None
                } else {
                    Some(name)
                }
            });
            if let Some(name) = ready {
                state.queued.remove(name);
                if let Some(action) = action_from_name(name) {
                    let message = action.message().unwrap_or_default().to_string();
                    decision = Some((action, message, name.to_string()));
                }
            }
        }

        let (action, message, rule_id) = decision?;
        state.interrupt_in_flight = Some(now);
        state.awaiting_effect = Some(now);
        state.action_cooldowns.insert(action.as_str(), now);
        state.history.push(Intervention {
            task_id,
            rule_id,
            action,
            at: Utc::now(),
            handled: true,
            success: false,
        });
        stats.total_interventions += 1;
        info!(task_id, action = action.as_str(), "intervention issued");
        Some(message)
    }
}

fn action_from_name(name: &str) -> Option<RuleAction> {
    match name {
        "interrupt_stop_planning" => Some(RuleAction::InterruptStopPlanning),
        "interrupt_implement_now" => Some(RuleAction::InterruptImplementNow),
        "interrupt_wrong_language" => Some(RuleAction::InterruptWrongLanguage),
        "interrupt_dangerous" => Some(RuleAction::InterruptDangerous),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Hook impl
// ---------------------------------------------------------------------------

const STREAM_EVENTS: &[HookEvent] = &[HookEvent::ExecutionStream];

#[async_trait]
impl Hook for InterventionController {
    fn name(&self) -> &str {
        "intervention-controller"
    }

    fn events(&self) -> &[HookEvent] {
        STREAM_EVENTS
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn handle(&self, ctx: &mut HookContext) -> Result<HookResult, HookError> {
        let Some(stream) = &ctx.stream else {
            return Ok(HookResult::Continue);
        };
        match self.on_chunk(stream.task_id, &stream.chunk) {
            Some(command) => Ok(HookResult::modify_command(command)),
            None => Ok(HookResult::Continue),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
