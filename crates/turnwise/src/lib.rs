//! Turn-aware conversation context engine for LLM-driven tool-using agents.
//!
//! `turnwise` owns everything between "the agent loop produced another
//! event" and "here is the ordered message list to send to the model". The
//! core abstraction is the [`ContextManager`](context::manager::ContextManager):
//! it records each user request → assistant response cycle as a
//! [`Turn`](context::turn::Turn), keeps the finalized turns as the single
//! source of truth for history, evicts old turns when the token budget runs
//! low, and assembles a cache-friendly message list on demand.
//!
//! The engine is synchronous and single-threaded. Token estimation is an
//! injected black box ([`TokenEstimator`](context::budget::TokenEstimator)),
//! and the LLM transport is the caller's business.
//!
//! # Getting started
//!
//! ```
//! use turnwise::prelude::*;
//!
//! # fn main() -> turnwise::Result<()> {
//! let config = ContextConfig::default()
//!     .with_system_prompt("You are a careful coding assistant.")
//!     .with_mode(ContextMode::SmartTruncation);
//! let mut ctx = ContextManager::new(config);
//!
//! ctx.mount_file("src/main.rs", "fn main() {}");
//! ctx.start_turn("Explain src/main.rs")?;
//! ctx.add_tool_call("read_file", serde_json::json!({"path": "src/main.rs"}))?;
//! ctx.add_tool_response("read_file", "File: src/main.rs\nfn main() {}")?;
//! ctx.add_assistant_message("It is an empty entry point.")?;
//! ctx.complete_turn(None)?;
//!
//! let messages = ctx.get_context_for_api();
//! assert_eq!(messages[0].role, MessageRole::System);
//! # Ok(())
//! # }
//! ```
//!
//! # Where to find things
//!
//! If you're looking for how to...
//!
//! - **Record a conversation:** see [`TurnLog`](context::turn::TurnLog) for the
//!   idle/active state machine and [`ContextManager`](context::manager::ContextManager)
//!   for the orchestrating facade (`start_turn`, `add_*`, `complete_turn`).
//!
//! - **Size the context:** see [`TokenBudget`](context::budget::TokenBudget).
//!   Thresholds are recomputed from the active model on every call, so a
//!   model switch takes effect immediately.
//!
//! - **Evict old turns:** see [`TruncationEngine`](context::truncation::TruncationEngine)
//!   and its two [`CompressionStrategy`](context::truncation::CompressionStrategy)
//!   implementations (text digest, structured state).
//!
//! - **Keep facts across compressions:** see [`ContextState`](context::state::ContextState),
//!   a mergeable record that replaces natural-language summaries.
//!
//! - **Produce the API message list:** see [`ContextAssembler`](context::layout::ContextAssembler)
//!   and [`CacheMetadata`](context::layout::CacheMetadata).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Budget, turn log, structured state, truncation, assembly, mounted files, manager |
//! | [`config`] | [`ContextConfig`](config::ContextConfig): model limits, mode, window, formatting flags |
//! | [`error`] | [`ContextError`] and the crate [`Result`] alias |
//!
//! # Design principles
//!
//! 1. **One source of truth.** Finalized turns are the only stored history.
//!    Every flat message view is derived on demand.
//!
//! 2. **Stable prefix first.** The system prompt and mounted files always
//!    precede the dialogue, so repeated requests land on the provider's cache.
//!
//! 3. **Compress once.** Previously compressed history is merged, never
//!    re-summarized, so information loss does not compound across cycles.
//!
//! 4. **Fail loudly on misuse.** Starting a turn while one is active, or
//!    appending without one, is an error, not a silent no-op.

pub mod config;
pub mod context;
pub mod error;
pub mod prelude;

use serde::{Deserialize, Serialize};

pub use error::{ContextError, Result};

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    /// Every role, in wire order.
    pub const ALL: [MessageRole; 4] = [
        MessageRole::System,
        MessageRole::User,
        MessageRole::Assistant,
        MessageRole::Tool,
    ];
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Kind of provider-side cache annotation. Currently always `Ephemeral`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheControlType {
    Ephemeral,
}

/// Marks a message as a cache breakpoint candidate.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: CacheControlType,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: CacheControlType::Ephemeral,
        }
    }
}

/// A role-tagged message ready for the LLM transport.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Tool that produced a `Tool` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl Message {
    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_name: None,
            cache_control: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    pub fn tool_result(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            ..Self::with_role(MessageRole::Tool, content)
        }
    }

    /// Annotate this message as cacheable.
    pub fn cached(mut self) -> Self {
        self.cache_control = Some(CacheControl::ephemeral());
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache_control.is_some()
    }
}
