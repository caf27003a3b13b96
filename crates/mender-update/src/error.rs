use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("no update module registered for payload type: {0}")]
    ModuleNotConfigured(String),

    #[error("a payload type may only be registered once: {0}")]
    AlreadyRegistered(String),

    #[error("internal update-module error: {0}")]
    Internal(String),
}
