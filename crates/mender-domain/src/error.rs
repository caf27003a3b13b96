use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("malformed key/value list: {0}")]
    MalformedKeyValueList(String),
}
