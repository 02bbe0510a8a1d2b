//! Token budget: eviction thresholds derived from the model window.
//!
//! A [`TokenBudget`] is a plain value computed from `(max_tokens, buffer)`.
//! The manager builds a fresh one from the live config on every call, so a
//! model switch or an extended-context toggle is reflected immediately.
//!
//! ```text
//! max_tokens ──(1 - buffer)──▶ effective
//!                                ├── × 0.9 ▶ cache-optimized threshold
//!                                └── × 0.7 ▶ smart-truncation threshold
//!                                               └── × 0.9 ▶ post-truncation target
//! ```
//!
//! The post-truncation target deliberately undershoots the smart threshold
//! so a truncated context does not cross it again on the very next turn.
//!
//! Token counting is not done here. A [`TokenEstimator`] is injected by the
//! caller; [`CharRatioEstimator`] is the default approximation.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{ContextConfig, ContextMode};
use crate::{Message, MessageRole};

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; 3.5 sits in the middle.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

const CACHE_THRESHOLD_RATIO: f64 = 0.9;
const SMART_THRESHOLD_RATIO: f64 = 0.7;
const TARGET_RATIO: f64 = 0.9;

// ── Estimation ─────────────────────────────────────────────────────

/// Result of estimating a message list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenEstimate {
    pub total: usize,
    pub by_role: BTreeMap<MessageRole, usize>,
}

/// Opaque token counter injected into the engine.
///
/// Any `Fn(&[Message]) -> TokenEstimate` closure is an estimator, which keeps
/// tests and real tokenizers equally easy to plug in.
pub trait TokenEstimator {
    fn estimate(&self, messages: &[Message]) -> TokenEstimate;

    /// Shorthand for `estimate(messages).total`.
    fn count(&self, messages: &[Message]) -> usize {
        self.estimate(messages).total
    }
}

impl<F> TokenEstimator for F
where
    F: Fn(&[Message]) -> TokenEstimate,
{
    fn estimate(&self, messages: &[Message]) -> TokenEstimate {
        self(messages)
    }
}

/// Estimates tokens as `ceil(bytes / chars_per_token)` per message.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl CharRatioEstimator {
    /// Use a calibrated ratio. Non-positive ratios fall back to the default.
    pub fn with_ratio(chars_per_token: f64) -> Self {
        if chars_per_token > 0.0 {
            Self { chars_per_token }
        } else {
            Self::default()
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    fn tokens_for(&self, text: &str) -> usize {
        (text.len() as f64 / self.chars_per_token).ceil() as usize
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, messages: &[Message]) -> TokenEstimate {
        let mut estimate = TokenEstimate::default();
        for msg in messages {
            let tokens = self.tokens_for(&msg.content);
            estimate.total += tokens;
            *estimate.by_role.entry(msg.role).or_default() += tokens;
        }
        estimate
    }
}

// ── Budget ─────────────────────────────────────────────────────────

/// Thresholds for one `(max_tokens, buffer)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBudget {
    max_tokens: usize,
    buffer_fraction: f64,
}

impl TokenBudget {
    /// `buffer_fraction` is clamped into `[0, 1]`.
    pub fn new(max_tokens: usize, buffer_fraction: f64) -> Self {
        Self {
            max_tokens,
            buffer_fraction: buffer_fraction.clamp(0.0, 1.0),
        }
    }

    /// Budget for the config's active model, as configured right now.
    pub fn for_config(config: &ContextConfig) -> Self {
        Self::new(config.max_tokens(), config.token_buffer_fraction)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn buffer_fraction(&self) -> f64 {
        self.buffer_fraction
    }

    /// The window minus the safety buffer.
    pub fn effective_max_tokens(&self) -> usize {
        scale(self.max_tokens, 1.0 - self.buffer_fraction)
    }

    /// Eviction trigger in cache-optimized mode.
    pub fn cache_threshold(&self) -> usize {
        scale(self.effective_max_tokens(), CACHE_THRESHOLD_RATIO)
    }

    /// Eviction trigger in smart-truncation mode.
    pub fn smart_threshold(&self) -> usize {
        scale(self.effective_max_tokens(), SMART_THRESHOLD_RATIO)
    }

    /// Size a truncation pass aims for, below either trigger.
    pub fn target_after_truncation(&self) -> usize {
        scale(self.smart_threshold(), TARGET_RATIO)
    }

    /// Trigger for `mode`.
    pub fn threshold(&self, mode: ContextMode) -> usize {
        match mode {
            ContextMode::CacheOptimized => self.cache_threshold(),
            ContextMode::SmartTruncation => self.smart_threshold(),
        }
    }

    /// Usage snapshot for an estimate, flagged against the given fractions
    /// of the effective window.
    pub fn usage(&self, estimate: &TokenEstimate, warning: f64, critical: f64) -> ContextUsage {
        let effective = self.effective_max_tokens();
        let usage_pct = if effective > 0 {
            estimate.total as f64 / effective as f64
        } else {
            1.0
        };
        ContextUsage {
            estimated_tokens: estimate.total,
            max_tokens: self.max_tokens,
            effective_max_tokens: effective,
            usage_pct,
            by_role: estimate.by_role.clone(),
            approaching_limit: usage_pct >= warning,
            critical_limit: usage_pct >= critical,
        }
    }
}

/// Nearest whole token; plain truncation turns `90_000 × 0.7` into 62_999.
fn scale(tokens: usize, ratio: f64) -> usize {
    (tokens as f64 * ratio).round() as usize
}

/// Snapshot of context usage at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextUsage {
    pub estimated_tokens: usize,
    pub max_tokens: usize,
    pub effective_max_tokens: usize,
    /// Usage as a fraction of the effective window (0.0 to 1.0+).
    pub usage_pct: f64,
    pub by_role: BTreeMap<MessageRole, usize>,
    pub approaching_limit: bool,
    pub critical_limit: bool,
}

impl ContextUsage {
    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let flag = if self.critical_limit {
            " [critical]"
        } else if self.approaching_limit {
            " [approaching limit]"
        } else {
            ""
        };
        format!(
            "context: ~{} tokens ({:.0}% of {}){flag}",
            self.estimated_tokens,
            self.usage_pct * 100.0,
            self.effective_max_tokens,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_follow_the_ratio_chain() {
        let budget = TokenBudget::new(100_000, 0.10);
        assert_eq!(budget.effective_max_tokens(), 90_000);
        assert_eq!(budget.cache_threshold(), 81_000);
        assert_eq!(budget.smart_threshold(), 63_000);
        assert_eq!(budget.target_after_truncation(), 56_700);
    }

    #[test]
    fn target_undershoots_both_triggers() {
        let budget = TokenBudget::new(128_000, 0.10);
        assert!(budget.target_after_truncation() < budget.smart_threshold());
        assert!(budget.smart_threshold() < budget.cache_threshold());
    }

    #[test]
    fn threshold_selects_by_mode() {
        let budget = TokenBudget::new(128_000, 0.10);
        assert_eq!(
            budget.threshold(ContextMode::CacheOptimized),
            budget.cache_threshold()
        );
        assert_eq!(
            budget.threshold(ContextMode::SmartTruncation),
            budget.smart_threshold()
        );
    }

    #[test]
    fn for_config_tracks_model_changes() {
        let config = ContextConfig::default().with_model("grok-4");
        let before = TokenBudget::for_config(&config);
        let config = config.with_extended_context(true);
        let after = TokenBudget::for_config(&config);
        assert_eq!(before.max_tokens(), 128_000);
        assert_eq!(after.max_tokens(), 256_000);
        assert!(after.smart_threshold() > before.smart_threshold());
    }

    #[test]
    fn buffer_is_clamped() {
        assert_eq!(TokenBudget::new(1000, 2.0).effective_max_tokens(), 0);
        assert_eq!(TokenBudget::new(1000, -1.0).effective_max_tokens(), 1000);
    }

    #[test]
    fn char_ratio_estimator_groups_by_role() {
        let messages = vec![
            Message::system("x".repeat(35)),
            Message::user("y".repeat(7)),
            Message::user("z".repeat(8)),
        ];
        let estimate = CharRatioEstimator::default().estimate(&messages);
        assert_eq!(estimate.by_role[&MessageRole::System], 10);
        // 7 bytes → 2 tokens, 8 bytes → 3 tokens.
        assert_eq!(estimate.by_role[&MessageRole::User], 5);
        assert_eq!(estimate.total, 15);
    }

    #[test]
    fn calibrated_ratio_counts_fewer_tokens() {
        let messages = vec![Message::user("a".repeat(40_000))];
        let default = CharRatioEstimator::default().count(&messages);
        let calibrated = CharRatioEstimator::with_ratio(4.0).count(&messages);
        assert!(calibrated < default);
        assert_eq!(CharRatioEstimator::with_ratio(0.0).chars_per_token(), 3.5);
    }

    #[test]
    fn closures_are_estimators() {
        let per_message = |messages: &[Message]| TokenEstimate {
            total: messages.len() * 10,
            by_role: BTreeMap::new(),
        };
        assert_eq!(per_message.count(&[Message::user("a"), Message::user("b")]), 20);
    }

    #[test]
    fn usage_flags_and_log_string() {
        let budget = TokenBudget::new(1000, 0.0);
        let estimate = TokenEstimate {
            total: 800,
            by_role: BTreeMap::new(),
        };
        let usage = budget.usage(&estimate, 0.7, 0.85);
        assert!(usage.approaching_limit);
        assert!(!usage.critical_limit);
        assert_eq!(
            usage.to_log_string(),
            "context: ~800 tokens (80% of 1000) [approaching limit]"
        );
    }

    #[test]
    fn zero_window_reports_full_usage() {
        let budget = TokenBudget::new(0, 0.1);
        let usage = budget.usage(&TokenEstimate::default(), 0.7, 0.85);
        assert!(usage.critical_limit);
    }
}
