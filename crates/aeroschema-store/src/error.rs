use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Two writers raced on the same pattern signature. Callers retry.
    #[error("pattern signature {signature} conflicted with a concurrent write")]
    CatalogConflict { signature: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("match for fact {node_fact_id} already recorded in run {run_id}")]
    DuplicateMatch {
        run_id: uuid::Uuid,
        node_fact_id: u64,
    },

    #[error("record belongs to workspace {found}, store serves {expected}")]
    WorkspaceMismatch { expected: String, found: String },

    #[error("invalid workspace id: {0:?}")]
    InvalidWorkspace(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] ::duckdb::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
