//! Sliding-window truncation of turn history.
//!
//! When the rendered history exceeds a target, the oldest turns are folded
//! into a single placeholder turn and the most recent `min_preserved_turns`
//! stay verbatim:
//!
//! ```text
//! [t1, t2, t3, t4, t5, t6]      window = 3, over target
//!   ─────────┬────────
//!   [P(t1..t3), t4, t5, t6]
//! ```
//!
//! On later passes an existing placeholder at the head is merged with the
//! newly evicted turns instead of being summarized again. If the result is
//! still over target, panic mode folds everything except the last turn into
//! the placeholder. The algorithm never loops, and a lone oversized turn is
//! returned unchanged.
//!
//! How evicted turns become a placeholder is a [`CompressionStrategy`],
//! chosen once when the engine is built: [`TextDigest`] joins one-line turn
//! summaries, [`StateDigest`] merges [`ContextState`]s.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::budget::TokenEstimator;
use super::state::ContextState;
use super::turn::{COMPRESSED_HISTORY_ID, COMPRESSED_STATE_ID, Turn, TurnSummary};
use crate::Message;
use crate::config::ContextConfig;

/// Separator placed between an existing text digest and a newly compressed batch.
pub const DIGEST_MERGE_SEPARATOR: &str = "\n[...]\n";

/// Flatten turns into the messages they render to.
pub fn turns_to_messages(turns: &[Turn]) -> Vec<Message> {
    turns.iter().flat_map(Turn::to_messages).collect()
}

// ── Strategies ─────────────────────────────────────────────────────

/// Folds evicted turns into a placeholder turn.
pub trait CompressionStrategy: std::fmt::Debug {
    /// Sentinel id of the placeholders this strategy writes.
    fn placeholder_id(&self) -> &'static str;

    /// Build a placeholder from an optional existing one plus `turns`.
    ///
    /// `existing` may come from either strategy. `turns` never contains a
    /// placeholder.
    fn compress(&self, existing: Option<&Turn>, turns: &[Turn]) -> Turn;
}

/// Placeholder time span: from the earliest input to the latest.
fn span(existing: Option<&Turn>, turns: &[Turn]) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
    let started_at = existing
        .map(|p| p.started_at)
        .or_else(|| turns.first().map(|t| t.started_at))
        .unwrap_or_default();
    let ended_at = turns
        .last()
        .and_then(|t| t.ended_at)
        .or_else(|| existing.and_then(|p| p.ended_at));
    (started_at, ended_at)
}

/// Joins per-turn summaries into a text digest.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextDigest;

impl CompressionStrategy for TextDigest {
    fn placeholder_id(&self) -> &'static str {
        COMPRESSED_HISTORY_ID
    }

    fn compress(&self, existing: Option<&Turn>, turns: &[Turn]) -> Turn {
        if let Some(prior) = existing
            && prior.id == COMPRESSED_HISTORY_ID
            && turns.is_empty()
        {
            return prior.clone();
        }

        let batch: Vec<String> = turns
            .iter()
            .map(|turn| {
                let summary = turn.summary_text();
                if summary.is_empty() {
                    format!("Turn {}: User interaction completed", turn.id)
                } else {
                    format!("Turn {}: {summary}", turn.id)
                }
            })
            .collect();
        let batch = batch.join("; ");
        let prior = existing.map(Turn::summary_text).unwrap_or_default();

        let digest = match (prior.is_empty(), batch.is_empty()) {
            (false, false) => format!("{prior}{DIGEST_MERGE_SEPARATOR}{batch}"),
            (false, true) => prior,
            (true, false) => batch,
            (true, true) => "History compressed".to_string(),
        };

        let (started_at, ended_at) = span(existing, turns);
        let mut placeholder = Turn::placeholder(
            COMPRESSED_HISTORY_ID,
            TurnSummary::Text(digest),
            started_at,
            ended_at,
        );
        for turn in existing.into_iter().chain(turns) {
            placeholder.files_read.extend(turn.files_read.iter().cloned());
            placeholder.files_modified.extend(turn.files_modified.iter().cloned());
            placeholder.files_created.extend(turn.files_created.iter().cloned());
            placeholder.tools_used.extend(turn.tools_used.iter().cloned());
        }
        placeholder
    }
}

/// Merges structured states extracted from each turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct StateDigest;

impl CompressionStrategy for StateDigest {
    fn placeholder_id(&self) -> &'static str {
        COMPRESSED_STATE_ID
    }

    fn compress(&self, existing: Option<&Turn>, turns: &[Turn]) -> Turn {
        if let Some(prior) = existing
            && prior.id == COMPRESSED_STATE_ID
            && turns.is_empty()
        {
            return prior.clone();
        }

        // A state placeholder yields its own state; a text placeholder is
        // mined like any other turn.
        let mut state = existing.map(ContextState::from_turn).unwrap_or_default();
        for turn in turns {
            state.absorb(ContextState::from_turn(turn));
        }

        let (started_at, ended_at) = span(existing, turns);
        let mut placeholder = Turn::placeholder(
            COMPRESSED_STATE_ID,
            TurnSummary::State(state.clone()),
            started_at,
            ended_at,
        );
        placeholder.files_read = state.files_read;
        placeholder.files_modified = state.files_modified;
        placeholder.files_created = state.files_created;
        placeholder.tools_used = state.tools_used;
        placeholder
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// What a truncation pass did.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncationOutcome {
    pub turns: Vec<Turn>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Real turns folded into the placeholder by this pass.
    pub turns_compressed: usize,
    pub panic_mode: bool,
}

impl TruncationOutcome {
    fn unchanged(turns: &[Turn], tokens: usize) -> Self {
        Self {
            turns: turns.to_vec(),
            tokens_before: tokens,
            tokens_after: tokens,
            turns_compressed: 0,
            panic_mode: false,
        }
    }

    pub fn changed(&self) -> bool {
        self.turns_compressed > 0 || self.panic_mode
    }
}

/// Sliding-window eviction over turn history.
#[derive(Debug)]
pub struct TruncationEngine {
    min_preserved_turns: usize,
    strategy: Box<dyn CompressionStrategy>,
}

impl Default for TruncationEngine {
    fn default() -> Self {
        Self::new(3, false)
    }
}

impl TruncationEngine {
    /// `structured` selects [`StateDigest`] over [`TextDigest`].
    pub fn new(min_preserved_turns: usize, structured: bool) -> Self {
        let strategy: Box<dyn CompressionStrategy> = if structured {
            Box::new(StateDigest)
        } else {
            Box::new(TextDigest)
        };
        Self::with_strategy(min_preserved_turns, strategy)
    }

    pub fn with_strategy(min_preserved_turns: usize, strategy: Box<dyn CompressionStrategy>) -> Self {
        Self {
            min_preserved_turns,
            strategy,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.min_preserved_turns, config.use_structured_state)
    }

    pub fn min_preserved_turns(&self) -> usize {
        self.min_preserved_turns
    }

    /// Sentinel id this engine writes.
    pub fn placeholder_id(&self) -> &'static str {
        self.strategy.placeholder_id()
    }

    /// Truncate `turns` toward `target_tokens`. See [`run`](Self::run).
    pub fn truncate(
        &self,
        turns: &[Turn],
        target_tokens: usize,
        estimator: &dyn TokenEstimator,
    ) -> Vec<Turn> {
        self.run(turns, target_tokens, estimator).turns
    }

    /// Truncate and report what happened.
    pub fn run(
        &self,
        turns: &[Turn],
        target_tokens: usize,
        estimator: &dyn TokenEstimator,
    ) -> TruncationOutcome {
        let tokens_before = estimator.count(&turns_to_messages(turns));
        if turns.is_empty() || tokens_before <= target_tokens {
            return TruncationOutcome::unchanged(turns, tokens_before);
        }

        let split = self.split_point(turns.len());
        let (older, recent) = turns.split_at(split);
        let mut compressed = 0;

        let mut result = Vec::with_capacity(recent.len() + 1);
        if !older.is_empty() {
            let (existing, fresh) = split_placeholder(older);
            compressed += fresh.len();
            result.push(self.strategy.compress(existing, fresh));
        }
        result.extend_from_slice(recent);

        let mut tokens_after = estimator.count(&turns_to_messages(&result));
        let mut panic_mode = false;

        // An already-collapsed `[placeholder, last]` has nothing left to fold.
        if tokens_after > target_tokens
            && let Some((last_turn, head)) = result.split_last()
        {
            let (existing, fresh) = split_placeholder(head);
            if !fresh.is_empty() {
                compressed += fresh.len();
                let placeholder = self.strategy.compress(existing, fresh);
                let last_turn = last_turn.clone();
                result = vec![placeholder, last_turn];
                tokens_after = estimator.count(&turns_to_messages(&result));
                panic_mode = true;
                warn!(
                    "Truncation panic mode: kept only the last turn ({tokens_after} tokens, target {target_tokens})"
                );
            }
        }

        if tokens_after > target_tokens {
            debug!(
                tokens_after,
                target_tokens, "history still over target after truncation"
            );
        }
        if compressed > 0 {
            info!(
                "Truncated history: {} → {} turns, ~{tokens_before} → ~{tokens_after} tokens",
                turns.len(),
                result.len()
            );
        } else {
            debug!(tokens_before, "history over target but nothing left to compress");
        }

        TruncationOutcome {
            turns: result,
            tokens_before,
            tokens_after,
            turns_compressed: compressed,
            panic_mode,
        }
    }

    /// Index of the first preserved turn. At least the final turn is kept
    /// whenever there is more than one.
    fn split_point(&self, len: usize) -> usize {
        let split = if len <= self.min_preserved_turns {
            len.saturating_sub(1)
        } else {
            len - self.min_preserved_turns
        };
        split.min(len.saturating_sub(1))
    }
}

/// Separate a leading placeholder from the real turns after it.
fn split_placeholder(turns: &[Turn]) -> (Option<&Turn>, &[Turn]) {
    match turns.split_first() {
        Some((head, rest)) if head.is_placeholder() => (Some(head), rest),
        _ => (None, turns),
    }
}
