//! Error types for iSER transport operations

use crate::verbs::{VerbsError, WcStatus};
use thiserror::Error;

/// iSER transport errors
#[derive(Debug, Error)]
pub enum IsertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Verbs error: {0}")]
    Verbs(#[from] VerbsError),

    /// No free registration descriptor, command slot or buffer
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Work request submission rejected by the adapter
    #[error("Post failed: {0}")]
    PostFailed(String),

    /// A work request completed with an error status
    #[error("Completion error: {status:?} (wr_id {wr_id:#x})")]
    Completion { wr_id: u64, status: WcStatus },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid transport header: {0}")]
    InvalidHeader(String),

    /// DMA mapping failed part way through setup
    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IsertError {
    /// Whether this error escalates the owning connection to `Terminating`
    pub fn is_fatal(&self) -> bool {
        matches!(self, IsertError::Completion { status, .. } if !status.is_flush())
    }
}

/// Result type for iSER transport operations
pub type IsertResult<T> = Result<T, IsertError>;

// ============================================================================
// Unit Tests
// ============================================================================
