use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed XML at byte {position}: {message}")]
    Parse { position: u64, message: String },

    #[error("document ended inside <{open}>")]
    UnexpectedEof { open: String },

    #[error("document has no root element")]
    EmptyDocument,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub(crate) fn parse(position: u64, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }
}
