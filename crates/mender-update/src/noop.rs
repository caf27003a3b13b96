use async_trait::async_trait;
use tracing::debug;

use crate::error::UpdateError;
use crate::module::UpdateModule;

/// A stub update module that discards every chunk it's handed.
///
/// Used in tests and the simulator binary where no concrete payload
/// handler (a flash-writer, a container puller, ...) is available.
#[derive(Debug, Clone)]
pub struct NoopUpdateModule {
    type_name: String,
}

impl NoopUpdateModule {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self { type_name: type_name.into() }
    }
}

#[async_trait]
impl UpdateModule for NoopUpdateModule {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn needs_reboot(&self) -> bool {
        false
    }

    fn supports_rollback(&self) -> bool {
        false
    }

    async fn download_artifact_flash(
        &self,
        chunk: &[u8],
        offset: u64,
        total: u64,
        filename: &str,
    ) -> Result<(), UpdateError> {
        debug!(
            type_name = %self.type_name,
            filename,
            offset,
            total,
            chunk_len = chunk.len(),
            "NoopUpdateModule: discarding chunk"
        );
        Ok(())
    }

    async fn end_of_payload(&self) -> Result<(), UpdateError> {
        debug!(type_name = %self.type_name, "NoopUpdateModule: end_of_payload");
        Ok(())
    }
}
