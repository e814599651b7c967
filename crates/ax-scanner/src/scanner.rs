//! Incremental regex scanning with per-rule debouncing.
//!
//! `scan` appends the new chunk and searches only the region
//! `[cursor - overlap, end]`, where `overlap` is one less than the longest
//! pattern, so a match split across two chunks is still found exactly once.
//! The buffer is trimmed from the left at a soft cap, preserving the overlap
//! window.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rules::RuleAction;

/// Context preserved around each match.
const CONTEXT_RADIUS: usize = 128;
/// Soft cap on the scan buffer.
const BUFFER_SOFT_CAP: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// PatternRule / PatternMatch
// ---------------------------------------------------------------------------

/// One streaming detection rule. The rule set is mutable at runtime.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub id: String,
    pub regex: Regex,
    pub action: RuleAction,
    pub priority: i32,
    /// Minimum milliseconds between firings of this rule. 0 = no debounce.
    pub cooldown_ms: u64,
    pub description: String,
}

impl PatternRule {
    pub fn new(
        id: impl Into<String>,
        pattern: &str,
        action: RuleAction,
        priority: i32,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.into(),
            regex: Regex::new(pattern)?,
            action,
            priority,
            cooldown_ms: 0,
            description: String::new(),
        })
    }

    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A rule firing, with surrounding context for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    pub rule_id: String,
    pub matched: String,
    pub captures: Vec<String>,
    pub action: RuleAction,
    pub priority: i32,
    pub at: DateTime<Utc>,
    pub context: String,
}

// ---------------------------------------------------------------------------
// PatternScanner
// ---------------------------------------------------------------------------

pub struct PatternScanner {
    rules: HashMap<String, PatternRule>,
    last_fired: HashMap<String, Instant>,
    buffer: String,
    /// Absolute offset (counting trimmed bytes) up to which output has been
    /// scanned. A match only fires when it ends past this cursor.
    cursor: usize,
    /// Bytes trimmed off the left of `buffer` so far.
    trimmed: usize,
    /// Longest pattern source, the basis of the overlap window.
    max_pattern_len: usize,
    soft_cap: usize,
}

impl PatternScanner {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            last_fired: HashMap::new(),
            buffer: String::new(),
            cursor: 0,
            trimmed: 0,
            max_pattern_len: 0,
            soft_cap: BUFFER_SOFT_CAP,
        }
    }

    pub fn with_rules(rules: impl IntoIterator<Item = PatternRule>) -> Self {
        let mut scanner = Self::new();
        for rule in rules {
            scanner.add(rule);
        }
        scanner
    }

    pub fn add(&mut self, rule: PatternRule) {
        self.max_pattern_len = self.max_pattern_len.max(rule.regex.as_str().len());
        self.rules.insert(rule.id.clone(), rule);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.rules.remove(id).is_some();
        self.last_fired.remove(id);
        self.max_pattern_len = self
            .rules
            .values()
            .map(|r| r.regex.as_str().len())
            .max()
            .unwrap_or(0);
        removed
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Clear the buffer, the cursor, and all cooldown state. Rules survive.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.trimmed = 0;
        self.last_fired.clear();
    }

    fn overlap(&self) -> usize {
        self.max_pattern_len.saturating_sub(1)
    }

    /// Append `text` and return all new matches, highest priority first.
    pub fn scan(&mut self, text: &str) -> Vec<PatternMatch> {
        self.buffer.push_str(text);

        // Scan from just before the cursor so boundary-straddling matches
        // are seen, but only accept matches that end past the cursor so
        // nothing fires twice.
        let rel_cursor = self.cursor.saturating_sub(self.trimmed);
        let from = floor_char_boundary(&self.buffer, rel_cursor.saturating_sub(self.overlap()));
        let region = &self.buffer[from..];

        let mut matches = Vec::new();
        for rule in self.rules.values() {
            if let Some(fired) = self.last_fired.get(&rule.id) {
                if rule.cooldown_ms > 0 && fired.elapsed().as_millis() < rule.cooldown_ms as u128 {
                    continue;
                }
            }

            for m in rule.regex.find_iter(region) {
                let abs_end = self.trimmed + from + m.end();
                if abs_end <= self.cursor {
                    continue;
                }
                let captures = rule
                    .regex
                    .captures(&region[m.start()..])
                    .map(|caps| {
                        caps.iter()
                            .skip(1)
                            .flatten()
                            .map(|c| c.as_str().to_string())
                            .collect()
                    })
                    .unwrap_or_default();

                matches.push(PatternMatch {
                    rule_id: rule.id.clone(),
                    matched: m.as_str().to_string(),
                    captures,
                    action: rule.action,
                    priority: rule.priority,
                    at: Utc::now(),
                    context: context_window(region, m.start(), m.end()),
                });

                // A debounced rule fires once per scan; the cooldown gates
                // the rest.
                if rule.cooldown_ms > 0 {
                    break;
                }
            }
        }

        for m in &matches {
            self.last_fired.insert(m.rule_id.clone(), Instant::now());
        }

        self.cursor = self.trimmed + self.buffer.len();
        self.trim_buffer();

        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        if !matches.is_empty() {
            debug!(count = matches.len(), "pattern matches");
        }
        matches
    }

    fn trim_buffer(&mut self) {
        if self.buffer.len() <= self.soft_cap {
            return;
        }
        let keep = (self.soft_cap / 2).max(self.overlap());
        let cut = floor_char_boundary(&self.buffer, self.buffer.len() - keep);
        self.buffer.drain(..cut);
        self.trimmed += cut;
    }
}

impl Default for PatternScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn context_window(region: &str, start: usize, end: usize) -> String {
    let from = floor_char_boundary(region, start.saturating_sub(CONTEXT_RADIUS));
    let mut to = (end + CONTEXT_RADIUS).min(region.len());
    while to < region.len() && !region.is_char_boundary(to) {
        to += 1;
    }
    region[from..to].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn todo_rule() -> PatternRule {
        PatternRule::new("todo", r"\b(TODO|FIXME)\b", RuleAction::InterruptImplementNow, 20)
            .unwrap()
    }

    #[test]
    fn simple_match_with_context() {
        let mut scanner = PatternScanner::with_rules([todo_rule()]);
        let matches = scanner.scan("fn main() { // TODO finish this }");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_id, "todo");
        assert_eq!(matches[0].matched, "TODO");
        assert!(matches[0].context.contains("finish this"));
    }

    #[test]
    fn match_straddling_chunk_boundary_is_found_once() {
        let mut scanner = PatternScanner::with_rules([todo_rule()]);
        assert!(scanner.scan("left half TO").is_empty());
        let matches = scanner.scan("DO right half");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, "TODO");
        // Re-scanning new unrelated text does not re-fire the old match.
        assert!(scanner.scan(" nothing here").is_empty());
    }

    #[test]
    fn already_scanned_region_never_refires() {
        let mut scanner = PatternScanner::with_rules([todo_rule()]);
        assert_eq!(scanner.scan("a TODO here").len(), 1);
        for _ in 0..5 {
            assert!(scanner.scan(" more output").is_empty());
        }
        assert_eq!(scanner.scan(" TODO again").len(), 1);
    }

    #[test]
    fn cooldown_suppresses_until_elapsed() {
        let rule = todo_rule().with_cooldown(10_000);
        let mut scanner = PatternScanner::with_rules([rule]);
        assert_eq!(scanner.scan("TODO one").len(), 1);
        assert!(scanner.scan(" TODO two").is_empty());
        assert!(scanner.scan(" TODO three").is_empty());
    }

    #[test]
    fn cooldown_zero_reports_every_match() {
        let mut scanner = PatternScanner::with_rules([todo_rule()]);
        let matches = scanner.scan("TODO and FIXME and TODO");
        assert_eq!(matches.len(), 3);
    }

    #[test]
    fn priority_orders_results() {
        let low = PatternRule::new("low", r"alpha", RuleAction::TrackProgress, 1).unwrap();
        let high = PatternRule::new("high", r"beta", RuleAction::InterruptDangerous, 100).unwrap();
        let mut scanner = PatternScanner::with_rules([low, high]);

        let matches = scanner.scan("alpha beta");
        assert_eq!(matches[0].rule_id, "high");
        assert_eq!(matches[1].rule_id, "low");
    }

    #[test]
    fn captures_are_extracted() {
        let rule = PatternRule::new(
            "file-created",
            r"File created: (\S+)",
            RuleAction::TrackProgress,
            30,
        )
        .unwrap();
        let mut scanner = PatternScanner::with_rules([rule]);
        let matches = scanner.scan("... File created: src/models.rs\n");
        assert_eq!(matches[0].captures, vec!["src/models.rs".to_string()]);
    }

    #[test]
    fn buffer_stays_bounded_under_flood() {
        let mut scanner = PatternScanner::with_rules([todo_rule()]);
        for _ in 0..10_000 {
            scanner.scan("the quick brown fox jumps over the lazy dog. ");
        }
        assert!(scanner.buffer.len() <= BUFFER_SOFT_CAP);
        // Matches still work after heavy trimming.
        assert_eq!(scanner.scan("and a TODO at the end").len(), 1);
    }

    #[test]
    fn remove_and_reset() {
        let mut scanner = PatternScanner::with_rules([todo_rule()]);
        assert_eq!(scanner.rule_count(), 1);
        assert!(scanner.remove("todo"));
        assert!(!scanner.remove("todo"));
        assert!(scanner.scan("TODO").is_empty());

        scanner.add(todo_rule());
        scanner.scan("TODO");
        scanner.reset();
        // After reset the same text is new again.
        assert_eq!(scanner.scan("TODO").len(), 1);
    }

    #[test]
    fn empty_scan_is_a_no_op() {
        let mut scanner = PatternScanner::with_rules([todo_rule()]);
        scanner.scan("TODO");
        assert!(scanner.scan("").is_empty());
    }
}
