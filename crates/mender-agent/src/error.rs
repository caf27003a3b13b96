use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] mender_domain::DomainError),

    #[error("store error: {0}")]
    Store(#[from] mender_store::StoreError),

    #[error("update-module error: {0}")]
    Update(#[from] mender_update::UpdateError),

    #[error("artifact error: {0}")]
    Artifact(#[from] mender_artifact::ArtifactError),

    #[error("deployment service error: {0}")]
    Api(#[from] mender_api::ApiError),

    #[error("platform capability failed: {0}")]
    Capability(String),

    #[error("no update available")]
    NoUpdate,

    #[error("deployment already installed: {0}")]
    AlreadyInstalled(String),

    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether this error should drive the state machine into the
    /// terminal `failure` report (§7: "everything else surfaces to the
    /// state machine, which maps to a terminal status publish"). `NoUpdate`
    /// and `AlreadyInstalled` are not failures — they're distinct,
    /// non-fatal outcomes handled by their own transitions.
    pub fn is_deployment_failure(&self) -> bool {
        !matches!(self, AgentError::NoUpdate | AgentError::AlreadyInstalled(_))
    }
}
