//! Typed failures that callers branch on.
//!
//! Everything else travels as `anyhow::Error`; these variants are the ones a caller
//! is expected to `downcast_ref` and turn into a specific user-visible answer.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CairnError {
    /// A write was rejected before anything touched the disk.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The workspace lock is held by someone else.
    #[error("workspace is locked by {holder}")]
    LockContention { holder: String },

    /// Waiting for the workspace lock exceeded the bounded timeout.
    #[error("timed out after {waited:?} waiting for the workspace lock")]
    LockTimeout { waited: Duration },

    /// A full rebuild failed; the previous index is still authoritative.
    #[error("index rebuild failed, previous index kept: {0}")]
    RebuildFailed(String),

    /// A bounded step (embedding, generation, heartbeat task) ran past its deadline.
    #[error("{step} timed out after {after:?}")]
    Timeout { step: String, after: Duration },
}

impl CairnError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
