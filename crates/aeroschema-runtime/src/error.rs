use aeroschema_engine::EngineError;
use aeroschema_store::StoreError;
use thiserror::Error;

/// Infrastructure failure that stopped a Run.
///
/// Malformed documents and per-subtree extraction failures are not errors
/// here: they are Run outcomes, reported through the returned summary.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("document parser stopped unexpectedly: {0}")]
    Parser(String),
}
