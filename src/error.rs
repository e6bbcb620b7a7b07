//! Error types for the capture engine
//!
//! None of these ever reach the traced program: the dispatch boundary in
//! [`crate::filter::EventFilter`] logs them and drops the offending event.

use thiserror::Error;

/// Failure while deciding whether a file is code of interest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatcherError {
    #[error("Invalid include pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Cannot normalize path '{0}'")]
    UnreadablePath(String),
}

/// Failure while updating the call tree for one event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuilderError {
    #[error("No open call for frame {frame} on thread {thread}")]
    NoOpenCall { frame: u64, thread: u64 },

    #[error("Session is already finalized")]
    Finalized,
}

/// Invalid trace configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Line range {start}-{end} for '{file}' is inverted")]
    InvertedRange { file: String, start: u32, end: u32 },

    #[error("Start trigger needs a file name")]
    EmptyTriggerFile,

    #[error("Start trigger line must be >= 1")]
    ZeroTriggerLine,

    #[error(transparent)]
    Pattern(#[from] MatcherError),
}
