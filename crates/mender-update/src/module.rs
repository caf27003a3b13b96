use async_trait::async_trait;

use crate::error::UpdateError;

/// A payload handler registered against one artifact payload type (§4.4).
///
/// `download_artifact_flash` is called once per buffered chunk, in stream
/// order, as the artifact parser (C3) drains the payload's data file(s);
/// `end_of_payload` closes out the current file. The remaining lifecycle
/// calls are optional — most modules that write directly to their final
/// destination during download have nothing to do at install/commit time,
/// so they inherit the no-op defaults below.
#[async_trait]
pub trait UpdateModule: Send + Sync + 'static {
    fn type_name(&self) -> &str;

    /// Whether a successful install of this payload requires a reboot
    /// before it can be verified.
    fn needs_reboot(&self) -> bool;

    /// Whether `artifact_rollback` can undo a failed install.
    fn supports_rollback(&self) -> bool;

    async fn download_artifact_flash(
        &self,
        chunk: &[u8],
        offset: u64,
        total: u64,
        filename: &str,
    ) -> Result<(), UpdateError>;

    async fn end_of_payload(&self) -> Result<(), UpdateError>;

    async fn artifact_install(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn artifact_commit(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn artifact_rollback(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn artifact_failure(&self) -> Result<(), UpdateError> {
        Ok(())
    }
}
