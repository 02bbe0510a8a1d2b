//! Configuration for the [`ContextManager`](crate::context::manager::ContextManager).
//!
//! Every field has a default, so a config file only needs the keys it wants
//! to override. Builder methods cover the common settings.
//!
//! # Examples
//!
//! ```
//! use turnwise::config::{ContextConfig, ContextMode};
//!
//! let config = ContextConfig::default()
//!     .with_model("grok-4")
//!     .with_extended_context(true)
//!     .with_mode(ContextMode::CacheOptimized)
//!     .with_min_preserved_turns(5);
//!
//! assert_eq!(config.max_tokens_for_model("grok-4"), 256_000);
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, Result};

/// Default limit for models missing from both limit tables.
pub const DEFAULT_CONTEXT_LIMIT: usize = 128_000;

/// Fraction of the model window held back as a safety margin.
pub const DEFAULT_TOKEN_BUFFER: f64 = 0.10;

// ── Mode ───────────────────────────────────────────────────────────

/// How aggressively history is evicted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Defer eviction until a high threshold; keeps the prefix stable longer.
    CacheOptimized,
    /// Evict after every completed turn once a lower threshold is crossed.
    #[default]
    SmartTruncation,
}

impl std::fmt::Display for ContextMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextMode::CacheOptimized => write!(f, "cache_optimized"),
            ContextMode::SmartTruncation => write!(f, "smart_truncation"),
        }
    }
}

impl std::str::FromStr for ContextMode {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cache_optimized" | "cache" => Ok(ContextMode::CacheOptimized),
            "smart_truncation" | "smart" => Ok(ContextMode::SmartTruncation),
            other => Err(ContextError::InvalidConfig(format!(
                "unknown context mode '{other}'"
            ))),
        }
    }
}

// ── Config ─────────────────────────────────────────────────────────

/// Inputs consumed by the context engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    /// Active model name; looked up in the limit tables.
    pub model: String,
    /// Standard context window per model, in tokens.
    pub model_context_limits: BTreeMap<String, usize>,
    /// Larger windows used when `use_extended_context` is on.
    pub extended_context_limits: BTreeMap<String, usize>,
    pub use_extended_context: bool,
    /// Fallback for unknown models.
    pub default_context_limit: usize,
    /// Safety margin as a fraction of the window, in `[0, 1)`.
    pub token_buffer_fraction: f64,
    pub mode: ContextMode,
    /// Number of most recent turns never compressed.
    pub min_preserved_turns: usize,
    /// Render memories as `[type] content` lines instead of Markdown bullets.
    pub compact_memory_format: bool,
    /// Compress evicted turns into a structured state instead of a text digest.
    pub use_structured_state: bool,
    /// Tag the stable prefix with cache annotations and emit cache metadata.
    pub enable_cache_hints: bool,
    /// Track files already in context so tools can skip re-emitting them.
    pub deduplicate_file_content: bool,
    /// Usage fraction at which statistics report "approaching limit".
    pub context_warning_threshold: f64,
    /// Usage fraction at which statistics report "critical".
    pub critical_threshold: f64,
    /// Base system prompt.
    pub system_prompt: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let model_context_limits = [("grok-3", 128_000), ("grok-4", 128_000)]
            .into_iter()
            .map(|(name, limit)| (name.to_string(), limit))
            .collect();
        let extended_context_limits = [("grok-4".to_string(), 256_000)].into_iter().collect();

        Self {
            model: "grok-3".into(),
            model_context_limits,
            extended_context_limits,
            use_extended_context: false,
            default_context_limit: DEFAULT_CONTEXT_LIMIT,
            token_buffer_fraction: DEFAULT_TOKEN_BUFFER,
            mode: ContextMode::default(),
            min_preserved_turns: 3,
            compact_memory_format: false,
            use_structured_state: false,
            enable_cache_hints: false,
            deduplicate_file_content: true,
            context_warning_threshold: 0.70,
            critical_threshold: 0.85,
            system_prompt: String::new(),
        }
    }
}

impl ContextConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ContextError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw).map_err(ContextError::MalformedRecord)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the budget arithmetic cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.token_buffer_fraction) {
            return Err(ContextError::InvalidConfig(format!(
                "token_buffer_fraction must be in [0, 1), got {}",
                self.token_buffer_fraction
            )));
        }
        if self.context_warning_threshold <= 0.0 || self.critical_threshold <= 0.0 {
            return Err(ContextError::InvalidConfig(
                "usage thresholds must be positive".into(),
            ));
        }
        if self.default_context_limit == 0 {
            return Err(ContextError::InvalidConfig(
                "default_context_limit must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Context window for `model`: extended table first (when enabled), then
    /// the standard table, then the default.
    pub fn max_tokens_for_model(&self, model: &str) -> usize {
        if self.use_extended_context
            && let Some(&limit) = self.extended_context_limits.get(model)
        {
            return limit;
        }
        self.model_context_limits
            .get(model)
            .copied()
            .unwrap_or(self.default_context_limit)
    }

    /// Context window for the active model.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens_for_model(&self.model)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_mode(mut self, mode: ContextMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_extended_context(mut self, enabled: bool) -> Self {
        self.use_extended_context = enabled;
        self
    }

    pub fn with_min_preserved_turns(mut self, turns: usize) -> Self {
        self.min_preserved_turns = turns;
        self
    }

    pub fn with_structured_state(mut self, enabled: bool) -> Self {
        self.use_structured_state = enabled;
        self
    }

    pub fn with_cache_hints(mut self, enabled: bool) -> Self {
        self.enable_cache_hints = enabled;
        self
    }

    pub fn with_compact_memory(mut self, enabled: bool) -> Self {
        self.compact_memory_format = enabled;
        self
    }

    pub fn with_token_buffer(mut self, fraction: f64) -> Self {
        self.token_buffer_fraction = fraction;
        self
    }

    /// Register (or override) the standard window for a model.
    pub fn with_model_limit(mut self, model: impl Into<String>, tokens: usize) -> Self {
        self.model_context_limits.insert(model.into(), tokens);
        self
    }
}
