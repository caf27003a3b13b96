use async_trait::async_trait;
use mender_domain::DeploymentStatus;

pub use mender_api::{CapabilityError, CryptoBackend, IdentityProvider};

/// §6 platform hooks: the device-specific side effects the state machine
/// triggers but never implements itself — bringing up networking around a
/// work unit, rebooting, and surfacing deployment status for observability
/// or UI. All methods are notifications/actions, not queries; failures are
/// logged by the caller rather than aborting the deployment, except
/// `restart` which is expected to not return.
#[async_trait]
pub trait PlatformHooks: Send + Sync + 'static {
    async fn network_connect(&self) -> Result<(), CapabilityError>;
    async fn network_release(&self) -> Result<(), CapabilityError>;

    /// Request a device reboot. On real hardware this does not return; in
    /// tests/simulation it may return `Ok(())` to let the process continue
    /// so `run_post_reboot_verification` can be exercised in-process.
    async fn restart(&self) -> Result<(), CapabilityError>;

    async fn deployment_status(&self, status: DeploymentStatus, deployment_id: &str);
    async fn authentication_success(&self);
    async fn authentication_failure(&self);
}
