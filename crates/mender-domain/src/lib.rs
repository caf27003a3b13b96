pub mod error;
pub mod types;

pub use error::DomainError;
pub use types::{
    begins_with, ends_with, http_status_phrase, identity_to_json, strrstr, ArtifactName,
    ClientConfig, DeploymentDescriptor, DeploymentState, DeploymentStatus, Identity, KeyValueList,
    Keystore, SessionToken,
};
