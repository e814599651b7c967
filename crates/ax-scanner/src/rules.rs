//! Built-in detection rules. These are the compiled-in defaults; the rule
//! set is mutable at runtime through [`crate::scanner::PatternScanner`].

use serde::{Deserialize, Serialize};

use crate::scanner::PatternRule;

// ---------------------------------------------------------------------------
// RuleAction
// ---------------------------------------------------------------------------

/// What the intervention controller should do with a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Agent is stuck describing instead of doing; inject a nudge.
    InterruptStopPlanning,
    /// Stub markers in freshly emitted code; demand a real implementation.
    InterruptImplementNow,
    /// Output language does not match what the user asked for.
    InterruptWrongLanguage,
    /// Destructive shell command on screen; interrupt and ask to confirm.
    InterruptDangerous,
    /// Concrete progress evidence; resets the planning timer.
    TrackProgress,
    /// A success claim that needs on-disk evidence within a window.
    VerifyClaim,
    /// Error text worth recording, no injection.
    HandleError,
}

impl RuleAction {
    /// Interrupt-class actions inject input; at most one may be in flight
    /// per task.
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            RuleAction::InterruptStopPlanning
                | RuleAction::InterruptImplementNow
                | RuleAction::InterruptWrongLanguage
                | RuleAction::InterruptDangerous
        )
    }

    /// The corrective message injected for interrupt-class actions.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            RuleAction::InterruptStopPlanning => {
                Some("Stop planning. Implement the code now, starting with the first file.\n")
            }
            RuleAction::InterruptImplementNow => {
                Some("Do not leave TODO or FIXME stubs. Implement this now.\n")
            }
            RuleAction::InterruptWrongLanguage => {
                Some("You are writing the wrong language. Switch to the language the task asked for.\n")
            }
            RuleAction::InterruptDangerous => Some(
                "\u{3}That command is destructive. Stop and explain what you intended before proceeding.\n",
            ),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::InterruptStopPlanning => "interrupt_stop_planning",
            RuleAction::InterruptImplementNow => "interrupt_implement_now",
            RuleAction::InterruptWrongLanguage => "interrupt_wrong_language",
            RuleAction::InterruptDangerous => "interrupt_dangerous",
            RuleAction::TrackProgress => "track_progress",
            RuleAction::VerifyClaim => "verify_claim",
            RuleAction::HandleError => "handle_error",
        }
    }
}

// ---------------------------------------------------------------------------
// Default rule set
// ---------------------------------------------------------------------------

/// The compiled-in rule set.
pub fn default_rules() -> Vec<PatternRule> {
    vec![
        PatternRule::new(
            "endless-planning",
            r"(?i)\b(analyzing|planning|would implement|let me think|I will first|before implementing)\b",
            RuleAction::InterruptStopPlanning,
            10,
        )
        .expect("built-in pattern")
        .with_cooldown(5_000)
        .with_description("planning talk; the controller gates on the no-progress timer"),
        PatternRule::new(
            "todo-stub",
            r"\b(TODO|FIXME)\b",
            RuleAction::InterruptImplementNow,
            20,
        )
        .expect("built-in pattern")
        .with_cooldown(10_000)
        .with_description("stub markers in emitted code"),
        PatternRule::new(
            "file-created",
            r"(?i)(?:File created|Created file|Wrote to|Successfully created)[:\s]+(\S+)",
            RuleAction::TrackProgress,
            30,
        )
        .expect("built-in pattern")
        .with_description("explicit file-creation evidence"),
        PatternRule::new(
            "file-claim",
            r"(?i)\b(?:has been created|I(?:'ve| have) created|file is now in place)\b",
            RuleAction::VerifyClaim,
            15,
        )
        .expect("built-in pattern")
        .with_cooldown(5_000)
        .with_description("creation claims that need evidence"),
        PatternRule::new(
            "dangerous-op",
            r"rm\s+-[rf]{1,2}[a-z]*\s+[/~]|sudo\s+rm\s|DROP\s+TABLE|git\s+push\s+--force|mkfs",
            RuleAction::InterruptDangerous,
            100,
        )
        .expect("built-in pattern")
        .with_cooldown(5_000)
        .with_description("destructive shell commands"),
        PatternRule::new(
            "error-text",
            r"(?i)\b(error\[|exception|traceback|panicked at)\b",
            RuleAction::HandleError,
            5,
        )
        .expect("built-in pattern")
        .with_cooldown(10_000)
        .with_description("error output worth recording"),
    ]
}

/// Rule that captures the language tag of fenced code blocks; the controller
/// compares the capture against the expected language.
pub fn wrong_language_rule() -> PatternRule {
    PatternRule::new(
        "wrong-language",
        r"```([a-zA-Z][a-zA-Z0-9+#]*)",
        RuleAction::InterruptWrongLanguage,
        25,
    )
    .expect("built-in pattern")
    .with_cooldown(10_000)
    .with_description("fence language tags, checked against the requested language")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::PatternScanner;

    #[test]
    fn default_rules_compile_and_fire() {
        let mut scanner = PatternScanner::with_rules(default_rules());
        let matches = scanner.scan("File created: src/routes.rs\n");
        assert!(matches.iter().any(|m| m.rule_id == "file-created"));
    }

    #[test]
    fn dangerous_has_highest_priority() {
        let mut scanner = PatternScanner::with_rules(default_rules());
        let matches = scanner.scan("I am planning to run rm -rf /tmp/x\n");
        assert_eq!(matches[0].rule_id, "dangerous-op");
    }

    #[test]
    fn interrupt_classification() {
        assert!(RuleAction::InterruptStopPlanning.is_interrupt());
        assert!(RuleAction::InterruptDangerous.is_interrupt());
        assert!(!RuleAction::TrackProgress.is_interrupt());
        assert!(!RuleAction::HandleError.is_interrupt());
    }

    #[test]
    fn language_fence_capture() {
        let mut scanner = PatternScanner::with_rules([wrong_language_rule()]);
        let matches = scanner.scan("```python\nprint('hi')\n```\n");
        assert_eq!(matches[0].captures, vec!["python".to_string()]);
    }
}
