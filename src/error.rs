use thiserror::Error;

/// Failures of the ingestion and chat pipelines.
///
/// The HTTP gateway maps each kind to a status code in one place
/// (`server::ApiError`); everything below it only returns these.
#[derive(Error, Debug)]
pub enum RagError {
    /// The document is missing, unreadable or not a PDF
    #[error("Failed to load document: {0}")]
    Load(String),

    /// The embedding model or API failed to vectorize text
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// No valid vector index exists at the configured path
    #[error("Vector index not found at {0}")]
    IndexNotFound(String),

    /// The vector database rejected a read or write
    #[error("Vector store error: {0}")]
    Store(String),

    /// The generation model or API failed to produce an answer
    #[error("Answer generation failed: {0}")]
    Generation(String),

    /// The upload was rejected before anything was written
    #[error("{0}")]
    InvalidUpload(String),

    /// A model backend did not answer within the request timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    /// Classify a `reqwest` failure from an embedding call
    pub fn embedding(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RagError::Timeout(err.to_string())
        } else {
            RagError::Embedding(err.to_string())
        }
    }

    /// Classify a `reqwest` failure from a generation call.
    ///
    /// Timeouts stay `Generation` errors: the chat pipeline degrades every
    /// generation failure to an apology, whatever the cause.
    pub fn generation(err: reqwest::Error) -> Self {
        RagError::Generation(err.to_string())
    }

    pub fn store(err: lancedb::Error) -> Self {
        RagError::Store(err.to_string())
    }
}
