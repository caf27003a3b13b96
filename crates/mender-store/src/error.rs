use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
