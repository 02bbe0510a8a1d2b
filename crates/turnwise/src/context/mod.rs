//! Conversation context: turns, budgets, eviction, and assembly.
//!
//! The pieces layer bottom-up:
//!
//! 1. **[`budget`]**: [`TokenEstimator`] (injected) and [`TokenBudget`],
//!    which derives the cache and smart thresholds from the active model's
//!    window.
//!
//! 2. **[`turn`]**: [`Turn`] records and the [`TurnLog`] state machine
//!    (idle ↔ active) that builds them from agent events.
//!
//! 3. **[`state`]**: [`ContextState`], the mergeable structured record that
//!    survives repeated compression without compounding loss.
//!
//! 4. **[`truncation`]**: [`TruncationEngine`], the sliding window that folds
//!    old turns into a single placeholder.
//!
//! 5. **[`layout`]**: three-layer message assembly:
//!    - **System prompt**: base prompt, task summary, memories.
//!    - **Stable messages**: system notices and mounted files. Together with
//!      the prompt this is the cacheable prefix.
//!    - **Dialogue**: finalized history, then the active turn.
//!
//! 6. **[`manager`]**: [`ContextManager`], which owns all of the above and
//!    decides when eviction runs.
//!
//! [`mounts`] and [`memory`] hold the stable-layer inputs.

pub mod budget;
pub mod layout;
pub mod manager;
pub mod memory;
pub mod mounts;
pub mod state;
pub mod truncation;
pub mod turn;

pub use budget::{
    CharRatioEstimator, ContextUsage, DEFAULT_CHARS_PER_TOKEN, TokenBudget, TokenEstimate,
    TokenEstimator,
};
pub use layout::{AssembledContext, CacheMetadata, ContextAssembler, ContextBreakdown};
pub use manager::{AddOutcome, ClearOptions, ContextExport, ContextManager, ContextStats};
pub use memory::Memory;
pub use mounts::MountedFile;
pub use state::ContextState;
pub use truncation::{CompressionStrategy, StateDigest, TextDigest, TruncationEngine};
pub use turn::{Event, FileOperation, Turn, TurnLog, TurnSummary};
