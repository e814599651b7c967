//! Streaming pattern detection over agent terminal output.
//!
//! The scanner consumes chunks as they arrive and finds rule matches even
//! when they straddle chunk boundaries; the intervention controller turns
//! matches into corrective keystrokes injected back into the PTY.

pub mod controller;
pub mod rules;
pub mod scanner;

pub use controller::{InterventionController, InterventionStats};
pub use rules::{default_rules, wrong_language_rule, RuleAction};
pub use scanner::{PatternMatch, PatternRule, PatternScanner};
