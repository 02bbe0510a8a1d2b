//! Error types for the context engine.
//!
//! State-machine misuse (starting a turn twice, appending while idle) is a
//! caller bug and surfaces as an explicit variant. Budget overruns are never
//! errors: the truncation engine returns its best result instead.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by context operations.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("cannot start a new turn while turn '{turn_id}' is active")]
    TurnAlreadyActive { turn_id: String },

    #[error("no active turn for {operation}; call start_turn first")]
    NoActiveTurn { operation: &'static str },

    #[error("malformed context state record: {0}")]
    MalformedState(#[source] serde_json::Error),

    #[error("malformed record: {0}")]
    MalformedRecord(#[source] serde_json::Error),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ContextError {
    pub(crate) fn no_active_turn(operation: &'static str) -> Self {
        Self::NoActiveTurn { operation }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for state-machine misuse, as opposed to data or I/O failures.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::TurnAlreadyActive { .. } | Self::NoActiveTurn { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T, E = ContextError> = std::result::Result<T, E>;
