use std::time::Duration;

use aeroschema_store::StoreError;
use thiserror::Error;

/// Failure of the fact-extraction collaborator for one subtree.
///
/// Never fatal to a Run: the coordinator records it against the subtree and
/// carries on.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("extractor returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("malformed extractor output: {0}")]
    Malformed(String),
}

impl ExtractionError {
    /// Worth another attempt: timeouts, transport failures, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Server { status, .. } => *status == 429 || *status >= 500,
            Self::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pattern {signature} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { signature: String, attempts: u32 },

    #[error("fact at {section_path}#{ordinal} has not been stored")]
    UnsavedFact { section_path: String, ordinal: u32 },
}
