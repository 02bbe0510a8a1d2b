//! Structured, mergeable record of what a conversation has accomplished.
//!
//! Text summaries of summaries lose detail every time history is compressed
//! again. A [`ContextState`] instead holds facts as data: file sets, task
//! lists, symbol locations, and the current goal. Compressing more turns
//! merges their states into the existing one, so a fact recorded once stays
//! recorded.
//!
//! Merge rules:
//!
//! 1. **Sets** (files, tools) take the union. Commutative, associative,
//!    idempotent.
//! 2. **Lists** (tasks, errors, blockers, decisions) append in argument
//!    order, without dedup. Repeated merges of the same entry keep every
//!    occurrence.
//! 3. **Maps** (key functions and classes) are right-biased.
//! 4. **Goal** is replaced only when the incoming goal is non-empty.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::turn::{Event, Turn, TurnSummary};
use crate::error::{ContextError, Result};

/// Digest shows at most this many of the most recent completed tasks.
const DIGEST_RECENT_TASKS: usize = 5;
/// Digest shows at most this many fixed errors and decisions.
const DIGEST_RECENT_NOTES: usize = 3;
/// User sentences longer than this are not treated as task descriptions.
const MAX_TASK_CHARS: usize = 200;

const TASK_VERBS: [&str; 4] = ["implement", "create", "add", "fix"];

static GOAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)goal:\s*(.*)").expect("goal pattern is valid"));

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ContextState {
    pub files_modified: BTreeSet<String>,
    pub files_created: BTreeSet<String>,
    pub files_read: BTreeSet<String>,

    pub tasks_completed: Vec<String>,
    pub tasks_pending: Vec<String>,

    /// Function name → location.
    pub key_functions: BTreeMap<String, String>,
    /// Class or type name → location.
    pub key_classes: BTreeMap<String, String>,

    pub errors_fixed: Vec<String>,

    pub main_goal: String,
    pub blockers: Vec<String>,
    pub decisions_made: Vec<String>,

    pub tools_used: BTreeSet<String>,
}

/// Per-field entry counts of a [`ContextState`].
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateStats {
    pub files_modified: usize,
    pub files_created: usize,
    pub files_read: usize,
    pub tasks_completed: usize,
    pub tasks_pending: usize,
    pub key_functions: usize,
    pub key_classes: usize,
    pub errors_fixed: usize,
    pub blockers: usize,
    pub decisions_made: usize,
    pub tools_used: usize,
}

impl ContextState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine `self` with `other` into a new state. Neither input changes.
    pub fn merge(&self, other: &ContextState) -> ContextState {
        let mut merged = self.clone();
        merged.absorb(other.clone());
        merged
    }

    /// In-place form of [`merge`](Self::merge), consuming `other`.
    pub fn absorb(&mut self, other: ContextState) {
        self.files_modified.extend(other.files_modified);
        self.files_created.extend(other.files_created);
        self.files_read.extend(other.files_read);
        self.tools_used.extend(other.tools_used);

        self.tasks_completed.extend(other.tasks_completed);
        self.tasks_pending.extend(other.tasks_pending);
        self.errors_fixed.extend(other.errors_fixed);
        self.blockers.extend(other.blockers);
        self.decisions_made.extend(other.decisions_made);

        self.key_functions.extend(other.key_functions);
        self.key_classes.extend(other.key_classes);

        if !other.main_goal.is_empty() {
            self.main_goal = other.main_goal;
        }
    }

    /// Heuristic extraction from a finalized turn.
    ///
    /// Files and tools come from the turn's metadata. The summary and the
    /// user's request are scanned for completed work, fixed errors, a
    /// `goal:` marker, and imperative requests that become pending tasks.
    /// A turn already carrying a structured summary contributes that state
    /// as-is.
    pub fn from_turn(turn: &Turn) -> ContextState {
        let mut state = ContextState {
            files_modified: turn.files_modified.clone(),
            files_created: turn.files_created.clone(),
            files_read: turn.files_read.clone(),
            tools_used: turn.tools_used.clone(),
            ..Default::default()
        };

        match &turn.summary {
            Some(TurnSummary::State(existing)) => state.absorb(existing.clone()),
            Some(TurnSummary::Text(summary)) => state.scan_summary(summary),
            None => {}
        }

        for event in &turn.events {
            if let Event::UserMessage { content } = event {
                state.scan_request(content);
            }
        }
        state
    }

    fn scan_summary(&mut self, summary: &str) {
        let lower = summary.to_lowercase();
        if lower.contains("completed") || lower.contains("fixed") {
            self.tasks_completed.push(summary.to_string());
        }
        if lower.contains("error") && (lower.contains("fixed") || lower.contains("resolved")) {
            self.errors_fixed.push(summary.to_string());
        }
        if let Some(goal) = GOAL_RE.captures(summary).and_then(|c| c.get(1)) {
            let goal = goal.as_str().trim();
            if !goal.is_empty() {
                self.main_goal = goal.to_string();
            }
        }
    }

    fn scan_request(&mut self, request: &str) {
        let lower = request.to_lowercase();
        if !TASK_VERBS.iter().any(|verb| lower.contains(verb)) {
            return;
        }
        let first_sentence = request.split('.').next().unwrap_or_default().trim();
        if !first_sentence.is_empty() && first_sentence.chars().count() < MAX_TASK_CHARS {
            self.tasks_pending.push(first_sentence.to_string());
        }
    }

    /// Deterministic Markdown-like rendering for prompt injection.
    ///
    /// The same state always renders to the same string, so cache hashes
    /// over a digest stay stable across rebuilds.
    pub fn to_digest(&self) -> String {
        let mut sections: Vec<String> = Vec::new();

        if !self.main_goal.is_empty() {
            sections.push(format!("## Current Objective\n{}", self.main_goal));
        }

        if !self.files_modified.is_empty() || !self.files_created.is_empty() {
            let mut lines = vec!["## Modified Codebase".to_string()];
            lines.extend(self.files_modified.iter().map(|f| format!("  - {f} (modified)")));
            lines.extend(self.files_created.iter().map(|f| format!("  - {f} (created)")));
            sections.push(lines.join("\n"));
        }

        if !self.files_read.is_empty() {
            let files: Vec<&str> = self.files_read.iter().map(String::as_str).collect();
            sections.push(format!(
                "## Files Read ({})\n  {}",
                files.len(),
                files.join(", ")
            ));
        }

        if !self.tasks_completed.is_empty() {
            sections.push(recent_section(
                &format!("## Completed Tasks ({})", self.tasks_completed.len()),
                &self.tasks_completed,
                DIGEST_RECENT_TASKS,
                "✓",
            ));
        }

        if !self.tasks_pending.is_empty() {
            sections.push(recent_section(
                "## Pending Tasks",
                &self.tasks_pending,
                self.tasks_pending.len(),
                "-",
            ));
        }

        if !self.key_functions.is_empty() || !self.key_classes.is_empty() {
            let mut lines = vec!["## Key Code Locations".to_string()];
            lines.extend(
                self.key_functions
                    .iter()
                    .map(|(name, loc)| format!("  - Function: {name} in {loc}")),
            );
            lines.extend(
                self.key_classes
                    .iter()
                    .map(|(name, loc)| format!("  - Class: {name} in {loc}")),
            );
            sections.push(lines.join("\n"));
        }

        if !self.errors_fixed.is_empty() {
            sections.push(recent_section(
                &format!("## Errors Fixed ({})", self.errors_fixed.len()),
                &self.errors_fixed,
                DIGEST_RECENT_NOTES,
                "✓",
            ));
        }

        if !self.blockers.is_empty() {
            sections.push(recent_section(
                "## Current Blockers",
                &self.blockers,
                self.blockers.len(),
                "!",
            ));
        }

        if !self.decisions_made.is_empty() {
            sections.push(recent_section(
                "## Key Decisions",
                &self.decisions_made,
                DIGEST_RECENT_NOTES,
                "•",
            ));
        }

        if !self.tools_used.is_empty() {
            let tools: Vec<&str> = self.tools_used.iter().map(String::as_str).collect();
            sections.push(format!("## Tools Used: {}", tools.join(", ")));
        }

        sections.join("\n\n")
    }

    /// True when no field carries information.
    pub fn is_empty(&self) -> bool {
        self.files_modified.is_empty()
            && self.files_created.is_empty()
            && self.files_read.is_empty()
            && self.tasks_completed.is_empty()
            && self.tasks_pending.is_empty()
            && self.key_functions.is_empty()
            && self.key_classes.is_empty()
            && self.errors_fixed.is_empty()
            && self.main_goal.is_empty()
            && self.blockers.is_empty()
            && self.decisions_made.is_empty()
            && self.tools_used.is_empty()
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            files_modified: self.files_modified.len(),
            files_created: self.files_created.len(),
            files_read: self.files_read.len(),
            tasks_completed: self.tasks_completed.len(),
            tasks_pending: self.tasks_pending.len(),
            key_functions: self.key_functions.len(),
            key_classes: self.key_classes.len(),
            errors_fixed: self.errors_fixed.len(),
            blockers: self.blockers.len(),
            decisions_made: self.decisions_made.len(),
            tools_used: self.tools_used.len(),
        }
    }

    // ── Serialization ──────────────────────────────────────────────

    pub fn to_record(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Parse a persisted record. Malformed input is an error, never an
    /// empty state.
    pub fn from_record(record: serde_json::Value) -> Result<Self> {
        serde_json::from_value(record).map_err(ContextError::MalformedState)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(ContextError::MalformedState)
    }
}

/// Header plus the last `keep` entries, with an "and N more" tail.
fn recent_section(header: &str, entries: &[String], keep: usize, bullet: &str) -> String {
    let skipped = entries.len().saturating_sub(keep);
    let mut lines = vec![header.to_string()];
    lines.extend(entries[skipped..].iter().map(|e| format!("  {bullet} {e}")));
    if skipped > 0 {
        lines.push(format!("  ... and {skipped} more"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn files(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_unions_modified_files() {
        let a = ContextState {
            files_modified: files(&["a.py"]),
            ..Default::default()
        };
        let b = ContextState {
            files_modified: files(&["a.py", "b.py"]),
            ..Default::default()
        };
        let merged = a.merge(&b);
        assert_eq!(merged.files_modified, files(&["a.py", "b.py"]));
        // Inputs untouched.
        assert_eq!(a.files_modified.len(), 1);
    }

    #[test]
    fn merge_appends_lists_without_dedup() {
        let a = ContextState {
            tasks_completed: vec!["wrote parser".into()],
            ..Default::default()
        };
        let merged = a.merge(&a);
        assert_eq!(merged.tasks_completed, vec!["wrote parser", "wrote parser"]);
    }

    #[test]
    fn merge_keeps_goal_unless_other_has_one() {
        let a = ContextState {
            main_goal: "ship v1".into(),
            ..Default::default()
        };
        assert_eq!(a.merge(&ContextState::new()).main_goal, "ship v1");
        let b = ContextState {
            main_goal: "ship v2".into(),
            ..Default::default()
        };
        assert_eq!(a.merge(&b).main_goal, "ship v2");
    }

    #[test]
    fn merge_maps_are_right_biased() {
        let mut a = ContextState::new();
        a.key_functions.insert("parse".into(), "src/old.rs".into());
        let mut b = ContextState::new();
        b.key_functions.insert("parse".into(), "src/new.rs".into());
        assert_eq!(a.merge(&b).key_functions["parse"], "src/new.rs");
    }

    #[test]
    fn empty_state_is_empty() {
        assert!(ContextState::new().is_empty());
        assert_eq!(ContextState::new().to_digest(), "");
        let state = ContextState {
            main_goal: "x".into(),
            ..Default::default()
        };
        assert!(!state.is_empty());
    }

    #[test]
    fn digest_sections_and_tails() {
        let mut state = ContextState {
            main_goal: "Port the lexer".into(),
            files_modified: files(&["src/lexer.rs"]),
            files_created: files(&["src/token.rs"]),
            tasks_completed: (1..=7).map(|i| format!("task {i}")).collect(),
            blockers: vec!["CI is red".into()],
            tools_used: files(&["edit_file", "read_file"]),
            ..Default::default()
        };
        state.key_classes.insert("Lexer".into(), "src/lexer.rs".into());

        let digest = state.to_digest();
        assert!(digest.starts_with("## Current Objective\nPort the lexer"));
        assert!(digest.contains("  - src/lexer.rs (modified)\n  - src/token.rs (created)"));
        assert!(digest.contains("## Completed Tasks (7)"));
        assert!(!digest.contains("task 2\n"));
        assert!(digest.contains("  ✓ task 7"));
        assert!(digest.contains("  ... and 2 more"));
        assert!(digest.contains("  - Class: Lexer in src/lexer.rs"));
        assert!(digest.contains("  ! CI is red"));
        assert!(digest.ends_with("## Tools Used: edit_file, read_file"));
        assert_eq!(digest, state.clone().to_digest());
    }

    #[test]
    fn from_record_rejects_malformed_input() {
        let err = ContextState::from_record(serde_json::json!({"files_read": 42})).unwrap_err();
        assert!(matches!(err, ContextError::MalformedState(_)));
        assert!(ContextState::from_json("{not json").is_err());
    }

    #[test]
    fn from_record_fills_missing_fields() {
        let state =
            ContextState::from_record(serde_json::json!({"main_goal": "refactor"})).unwrap();
        assert_eq!(state.main_goal, "refactor");
        assert!(state.files_read.is_empty());
    }

    #[test]
    fn stats_count_entries() {
        let state = ContextState {
            files_read: files(&["a", "b"]),
            decisions_made: vec!["use sqlite".into()],
            ..Default::default()
        };
        let stats = state.stats();
        assert_eq!(stats.files_read, 2);
        assert_eq!(stats.decisions_made, 1);
        assert_eq!(stats.tools_used, 0);
    }

    #[test]
    fn summary_heuristics() {
        let mut state = ContextState::new();
        state.scan_summary("Fixed the import error. Goal: green test suite");
        assert_eq!(state.tasks_completed.len(), 1);
        assert_eq!(state.errors_fixed.len(), 1);
        assert_eq!(state.main_goal, "green test suite");
    }

    #[test]
    fn request_heuristics_take_first_sentence() {
        let mut state = ContextState::new();
        state.scan_request("Please add a retry loop. It should back off.");
        state.scan_request("What time is it?");
        assert_eq!(state.tasks_pending, vec!["Please add a retry loop"]);
    }

    // ── Properties ─────────────────────────────────────────────────

    fn arb_state() -> impl Strategy<Value = ContextState> {
        let set = || prop::collection::btree_set("[a-d]{1,2}", 0..4);
        let list = || prop::collection::vec("[a-z]{1,4}", 0..3);
        let map = || prop::collection::btree_map("[a-c]", "[x-z]", 0..3);
        (
            (set(), set(), set(), set()),
            (list(), list(), list(), list(), list()),
            (map(), map()),
            "[a-z]{0,3}",
        )
            .prop_map(
                |(
                    (files_modified, files_created, files_read, tools_used),
                    (tasks_completed, tasks_pending, errors_fixed, blockers, decisions_made),
                    (key_functions, key_classes),
                    main_goal,
                )| ContextState {
                    files_modified,
                    files_created,
                    files_read,
                    tasks_completed,
                    tasks_pending,
                    key_functions,
                    key_classes,
                    errors_fixed,
                    main_goal,
                    blockers,
                    decisions_made,
                    tools_used,
                },
            )
    }

    fn sets(state: &ContextState) -> [&BTreeSet<String>; 4] {
        [
            &state.files_modified,
            &state.files_created,
            &state.files_read,
            &state.tools_used,
        ]
    }

    proptest! {
        #[test]
        fn merge_sets_are_associative(a in arb_state(), b in arb_state(), c in arb_state()) {
            let left = a.merge(&b.merge(&c));
            let right = a.merge(&b).merge(&c);
            prop_assert_eq!(sets(&left), sets(&right));
            // Lists append in order either way.
            prop_assert_eq!(left.tasks_completed, right.tasks_completed);
        }

        #[test]
        fn merge_sets_are_commutative(a in arb_state(), b in arb_state()) {
            let (ab, ba) = (a.merge(&b), b.merge(&a));
            prop_assert_eq!(sets(&ab), sets(&ba));
        }

        #[test]
        fn merge_sets_are_idempotent(a in arb_state()) {
            let aa = a.merge(&a);
            prop_assert_eq!(sets(&aa), sets(&a));
        }

        #[test]
        fn record_round_trips(a in arb_state()) {
            prop_assert_eq!(ContextState::from_record(a.to_record()).unwrap(), a.clone());
            prop_assert_eq!(ContextState::from_json(&a.to_json()).unwrap(), a);
        }
    }
}
