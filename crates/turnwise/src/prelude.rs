//! Convenience re-exports for common `turnwise` types.
//!
//! Meant to be glob-imported by agent loops:
//!
//! ```
//! use turnwise::prelude::*;
//! ```
//!
//! This pulls in the manager, its configuration, the message types it
//! produces, and the estimator seam. Strategy internals (placeholder
//! constants, digest headers) are left out; import those from their modules
//! directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ContextError, Message, MessageRole, Result};

// ── Configuration ───────────────────────────────────────────────────
pub use crate::config::{ContextConfig, ContextMode};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{
    AddOutcome, CacheMetadata, CharRatioEstimator, ClearOptions, ContextManager, ContextState,
    ContextStats, ContextUsage, FileOperation, Memory, TokenBudget, TokenEstimate,
    TokenEstimator, Turn,
};
