use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("malformed artifact stream: {0}")]
    Malformed(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    Integrity { file: String, expected: String, actual: String },

    #[error("artifact is not compatible with device type {device_type}: supports {supported:?}")]
    IncompatibleArtifact { device_type: String, supported: Vec<String> },

    #[error("unsupported artifact format version: {0}")]
    UnsupportedVersion(u32),

    #[error("no update module registered for payload type: {0}")]
    UnknownPayloadType(String),

    #[error("depends not satisfied: {key} expected one of {expected:?}, device provides {actual:?}")]
    DependsNotSatisfied { key: String, expected: Vec<String>, actual: Vec<String> },

    #[error("artifact exceeds the configured maximum entry size: {0} bytes")]
    OutOfMemory(usize),

    #[error(transparent)]
    Update(#[from] mender_update::UpdateError),
}
