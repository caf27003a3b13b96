use std::collections::HashMap;
use std::sync::Arc;

use mender_api::{ApiError, CryptoBackend, DeploymentCheckOutcome, IdentityProvider, MenderApiClient};
#[cfg(feature = "inventory")]
use mender_api::InventoryAttribute;
use mender_artifact::ArtifactParser;
use mender_domain::{
    ArtifactName, ClientConfig, DeploymentDescriptor, DeploymentState, DeploymentStatus, SessionToken,
};
use mender_store::{keys, StateStore, StateStoreExt};
use mender_update::UpdateModuleRegistry;
use tracing::{debug, info, warn};

use crate::capability::PlatformHooks;
use crate::crypto_adapter::CryptoBackendVerifier;
use crate::error::AgentError;
use crate::sink::ParserSink;

/// Conservative default entry-size ceiling for a constrained device (§4.3).
const MAX_ARTIFACT_ENTRY_SIZE: u64 = 64 * 1024 * 1024;
const STREAM_BLOCK: usize = 512;
const RECV_BUF_HINT: usize = 64 * 1024;

/// States exactly per §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Unauthenticated,
    Authenticated,
    Polling,
    Downloading,
    Installing,
    RebootRequested,
    PostRebootVerifying,
    Committed,
}

/// Orchestrates the full authenticate -> poll -> download -> install ->
/// reboot -> verify -> report flow (§4.5). Owns everything the agent needs
/// across that flow as plain fields rather than process globals.
pub struct DeploymentMachine {
    config: ClientConfig,
    store: Arc<dyn StateStore>,
    api: MenderApiClient,
    registry: Arc<UpdateModuleRegistry>,
    platform: Arc<dyn PlatformHooks>,
    crypto: Arc<dyn CryptoBackend>,
    #[allow(dead_code)]
    identity_provider: Arc<dyn IdentityProvider>,

    state: MachineState,
    token: Option<SessionToken>,
    artifact_name: ArtifactName,
    provides: HashMap<String, String>,
    /// Payload types declared by the artifact currently being installed.
    /// Scopes `artifact_install`/`artifact_commit`/`artifact_rollback`/
    /// `artifact_failure` calls to modules actually involved in this
    /// deployment rather than every registered module.
    active_payload_types: Vec<String>,
}

impl DeploymentMachine {
    pub async fn load(
        config: ClientConfig,
        store: Arc<dyn StateStore>,
        identity_provider: Arc<dyn IdentityProvider>,
        crypto: Arc<dyn CryptoBackend>,
        registry: Arc<UpdateModuleRegistry>,
        platform: Arc<dyn PlatformHooks>,
    ) -> Result<Self, AgentError> {
        let artifact_name = match store.get(keys::ARTIFACT_NAME).await? {
            Some(bytes) => ArtifactName(String::from_utf8_lossy(&bytes).into_owned()),
            None => ArtifactName::unknown(),
        };
        let provides: HashMap<String, String> = store.get_json(keys::PROVIDES).await?.unwrap_or_default();
        let api = MenderApiClient::new(config.clone(), identity_provider.clone(), crypto.clone());

        Ok(Self {
            config,
            store,
            api,
            registry,
            platform,
            crypto,
            identity_provider,
            state: MachineState::Unauthenticated,
            token: None,
            artifact_name,
            provides,
            active_payload_types: Vec::new(),
        })
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn artifact_name(&self) -> &ArtifactName {
        &self.artifact_name
    }

    /// Whether a persisted, in-flight deployment exists — checked at
    /// startup to decide whether to enter `PostRebootVerifying` (§4.5).
    pub async fn pending_deployment(&self) -> Result<Option<DeploymentState>, AgentError> {
        Ok(self.store.get_json(keys::DEPLOYMENT_DATA).await?)
    }

    // ── UNAUTHENTICATED -> AUTHENTICATED ─────────────────────────────────

    pub async fn run_authentication(&mut self) -> Result<(), AgentError> {
        self.network(true).await?;
        let result = self.api.authenticate().await;
        self.network(false).await?;

        match result {
            Ok(token) => {
                self.token = Some(token);
                self.state = MachineState::Authenticated;
                self.platform.authentication_success().await;
                info!("mender-agent: authentication succeeded");
                Ok(())
            }
            Err(e) => {
                self.platform.authentication_failure().await;
                warn!(error = %e, "mender-agent: authentication failed");
                Err(AgentError::Api(e))
            }
        }
    }

    /// Discards the current token and re-authenticates once. Used by every
    /// call site that can see a 401 mid-cycle (§4.5 "retry exactly once").
    async fn reauthenticate(&mut self) -> Result<SessionToken, ApiError> {
        warn!("mender-agent: session token rejected, re-authenticating");
        self.token = None;
        self.state = MachineState::Unauthenticated;
        self.run_authentication().await.map_err(|e| match e {
            AgentError::Api(api_err) => api_err,
            other => ApiError::MalformedResponse(other.to_string()),
        })?;
        self.token.clone().ok_or(ApiError::Unauthorized)
    }

    fn current_token(&self) -> Result<SessionToken, AgentError> {
        self.token.clone().ok_or_else(|| AgentError::Internal("no session token available".into()))
    }

    // ── AUTHENTICATED -> POLLING -> DOWNLOADING -> INSTALLING -> REBOOT? ─

    /// Drives one full update-check cycle (§4.5, §4.6 "update work").
    /// Returns `Err(AgentError::NoUpdate)` on a clean 204 and
    /// `Err(AgentError::AlreadyInstalled(..))` on the already-installed
    /// short-circuit — neither is a deployment failure, see
    /// `AgentError::is_deployment_failure`.
    pub async fn run_update_check(&mut self) -> Result<(), AgentError> {
        if self.state == MachineState::Unauthenticated {
            self.run_authentication().await?;
        }
        self.state = MachineState::Polling;

        let descriptor = match self.check_for_deployment().await {
            Ok(Some(d)) => d,
            Ok(None) => {
                debug!("mender-agent: no update available");
                self.state = MachineState::Authenticated;
                return Err(AgentError::NoUpdate);
            }
            Err(e) => {
                self.state = MachineState::Authenticated;
                return Err(e);
            }
        };

        // §4.5: an artifact_name match alone is treated as already-installed
        // and short-circuits the download — this workspace's
        // DeploymentDescriptor (§3) carries no separate "payload set" field
        // to additionally check (see DESIGN.md).
        if descriptor.artifact_name == self.artifact_name.as_str() {
            self.report_status(&descriptor.id, DeploymentStatus::AlreadyInstalled).await?;
            self.state = MachineState::Authenticated;
            return Err(AgentError::AlreadyInstalled(descriptor.id));
        }

        if !descriptor.device_types_compatible.iter().any(|d| d == &self.config.device_type) {
            let err = mender_artifact::ArtifactError::IncompatibleArtifact {
                device_type: self.config.device_type.clone(),
                supported: descriptor.device_types_compatible.clone(),
            };
            warn!(
                device_type = %self.config.device_type,
                supported = ?descriptor.device_types_compatible,
                "mender-agent: artifact incompatible with this device type"
            );
            self.fail_deployment(&descriptor.id, AgentError::Artifact(err)).await?;
            return Err(AgentError::Internal("incompatible artifact".into()));
        }

        match self.run_download_and_install(&descriptor).await {
            Ok(needs_reboot) if needs_reboot => {
                self.report_status(&descriptor.id, DeploymentStatus::Rebooting).await?;
                self.state = MachineState::RebootRequested;
                self.platform.restart().await.map_err(|e| AgentError::Capability(e.to_string()))?;
                Ok(())
            }
            Ok(_) => self.run_commit(&descriptor).await,
            Err(e) => {
                let message = e.to_string();
                self.fail_deployment(&descriptor.id, e).await?;
                Err(AgentError::Internal(message))
            }
        }
    }

    async fn check_for_deployment(&mut self) -> Result<Option<DeploymentDescriptor>, AgentError> {
        self.network(true).await?;
        let token = self.current_token()?;
        let artifact_name = self.artifact_name.as_str().to_string();
        let provides = self.provides.clone();

        let mut result = self.api.check_for_deployment(&token, &artifact_name, &provides).await;
        if matches!(result, Err(ApiError::Unauthorized)) {
            let token = self.reauthenticate().await?;
            result = self.api.check_for_deployment(&token, &artifact_name, &provides).await;
        }
        self.network(false).await?;

        match result? {
            DeploymentCheckOutcome::Available(d) => Ok(Some(d)),
            DeploymentCheckOutcome::NoUpdate => Ok(None),
        }
    }

    async fn run_download_and_install(&mut self, descriptor: &DeploymentDescriptor) -> Result<bool, AgentError> {
        self.report_status(&descriptor.id, DeploymentStatus::Downloading).await?;
        self.persist_deployment_state(descriptor, DeploymentStatus::Downloading).await?;
        self.state = MachineState::Downloading;

        let verifier = Arc::new(CryptoBackendVerifier::new(self.crypto.clone()));
        let mut parser = ArtifactParser::new(
            self.config.device_type.clone(),
            MAX_ARTIFACT_ENTRY_SIZE,
            STREAM_BLOCK,
            RECV_BUF_HINT,
            self.registry.clone(),
            self.provides.clone(),
            Some(verifier),
        );

        self.network(true).await?;
        let download_result = {
            let mut sink = ParserSink::new(&mut parser);
            self.api.download_artifact(&descriptor.uri, &mut sink).await.map(|_| sink.new_provides)
        };
        self.network(false).await?;
        let new_provides = download_result?;

        self.active_payload_types = parser.header_info().map(|h| h.payload_types.clone()).unwrap_or_default();

        self.report_status(&descriptor.id, DeploymentStatus::Installing).await?;
        let mut state = self.persist_deployment_state(descriptor, DeploymentStatus::Installing).await?;
        state.pending_provides = new_provides;
        // Recorded so `run_post_reboot_verification` can recover exactly the
        // payload types this deployment touched after a real reboot drops
        // `active_payload_types` from memory — without it, recovery would
        // have to fall back to every registered module.
        state.payload_state = self
            .active_payload_types
            .iter()
            .map(|ty| (ty.clone(), serde_json::Value::Null))
            .collect();
        self.store.set_json(keys::DEPLOYMENT_DATA, &state).await?;
        self.state = MachineState::Installing;

        let mut needs_reboot = false;
        for ty in &self.active_payload_types.clone() {
            let module = self.registry.resolve(ty)?;
            module.artifact_install().await?;
            needs_reboot |= module.needs_reboot();
        }
        Ok(needs_reboot)
    }

    // ── POST_REBOOT_VERIFYING -> COMMITTED ───────────────────────────────

    /// Entered at next boot when persisted state indicates an in-flight
    /// deployment (§4.5).
    pub async fn run_post_reboot_verification(&mut self) -> Result<(), AgentError> {
        let Some(deployment) = self.pending_deployment().await? else {
            return Ok(());
        };
        self.state = MachineState::PostRebootVerifying;

        self.active_payload_types = if !deployment.payload_state.is_empty() {
            deployment.payload_state.keys().cloned().collect()
        } else {
            // No module recorded per-type carry-over state; fall back to
            // every module this device has registered.
            self.registry.registered_types().iter().map(|s| s.to_string()).collect()
        };

        let mut commit_err: Option<AgentError> = None;
        for ty in &self.active_payload_types.clone() {
            if let Ok(module) = self.registry.resolve(ty) {
                if let Err(e) = module.artifact_commit().await {
                    commit_err = Some(AgentError::Update(e));
                    break;
                }
            }
        }

        if self.token.is_none() {
            self.run_authentication().await?;
        }

        match commit_err {
            None => {
                self.provides.extend(deployment.pending_provides.clone());
                self.store.set_json(keys::PROVIDES, &self.provides).await?;
                self.artifact_name = ArtifactName(deployment.artifact_name.clone());
                self.store.set(keys::ARTIFACT_NAME, self.artifact_name.as_str().as_bytes()).await?;
                self.state = MachineState::Committed;
                self.report_status(&deployment.id, DeploymentStatus::Success).await?;
                self.clear_deployment_state().await?;
                info!(artifact_name = %self.artifact_name, "mender-agent: deployment committed");
                Ok(())
            }
            Some(e) => {
                warn!(error = %e, "mender-agent: commit failed, rolling back");
                for ty in &self.active_payload_types.clone() {
                    if let Ok(module) = self.registry.resolve(ty) {
                        if module.supports_rollback() {
                            let _ = module.artifact_rollback().await;
                        }
                    }
                }
                self.report_status(&deployment.id, DeploymentStatus::Failure).await?;
                self.clear_deployment_state().await?;
                Err(e)
            }
        }
    }

    async fn run_commit(&mut self, descriptor: &DeploymentDescriptor) -> Result<(), AgentError> {
        for ty in &self.active_payload_types.clone() {
            let module = self.registry.resolve(ty)?;
            module.artifact_commit().await?;
        }
        let pending_provides = self
            .store
            .get_json::<DeploymentState>(keys::DEPLOYMENT_DATA)
            .await?
            .map(|s| s.pending_provides)
            .unwrap_or_default();
        self.provides.extend(pending_provides);
        self.store.set_json(keys::PROVIDES, &self.provides).await?;
        self.artifact_name = ArtifactName(descriptor.artifact_name.clone());
        self.store.set(keys::ARTIFACT_NAME, self.artifact_name.as_str().as_bytes()).await?;
        self.state = MachineState::Committed;
        self.report_status(&descriptor.id, DeploymentStatus::Success).await?;
        self.clear_deployment_state().await?;
        info!(artifact_name = %self.artifact_name, "mender-agent: deployment committed (no reboot required)");
        Ok(())
    }

    async fn fail_deployment(&mut self, deployment_id: &str, err: AgentError) -> Result<(), AgentError> {
        warn!(error = %err, deployment_id, "mender-agent: deployment failed");
        for ty in &self.active_payload_types.clone() {
            if let Ok(module) = self.registry.resolve(ty) {
                let _ = module.artifact_failure().await;
            }
        }
        self.report_status(deployment_id, DeploymentStatus::Failure).await?;
        self.clear_deployment_state().await?;
        self.state = MachineState::Authenticated;
        self.active_payload_types.clear();
        Ok(())
    }

    // ── inventory (§4.6 third work unit, `inventory` feature) ────────────

    #[cfg(feature = "inventory")]
    pub async fn run_inventory_publish(&mut self, extra: Vec<InventoryAttribute>) -> Result<(), AgentError> {
        if self.state == MachineState::Unauthenticated {
            self.run_authentication().await?;
        }
        self.network(true).await?;
        let token = self.current_token()?;
        let artifact_name = self.artifact_name.as_str().to_string();

        let mut result = self.api.publish_inventory(&token, &artifact_name, &extra).await;
        if matches!(result, Err(ApiError::Unauthorized)) {
            let token = self.reauthenticate().await?;
            result = self.api.publish_inventory(&token, &artifact_name, &extra).await;
        }
        self.network(false).await?;
        result.map_err(AgentError::Api)
    }

    // ── shared helpers ────────────────────────────────────────────────────

    async fn network(&self, connect: bool) -> Result<(), AgentError> {
        let result = if connect { self.platform.network_connect().await } else { self.platform.network_release().await };
        result.map_err(|e| AgentError::Capability(e.to_string()))
    }

    /// Publishes a status transition, guarded by the persisted
    /// `DeploymentState.last_reported_status` so the same status is never
    /// reported twice for one deployment id (§8 invariant).
    async fn report_status(&mut self, deployment_id: &str, status: DeploymentStatus) -> Result<(), AgentError> {
        let mut deployment: Option<DeploymentState> = self.store.get_json(keys::DEPLOYMENT_DATA).await?;
        if let Some(d) = &deployment {
            if d.id == deployment_id && !d.can_report(status) {
                debug!(deployment_id, status = %status, "mender-agent: status already reported, skipping");
                return Ok(());
            }
        }

        self.platform.deployment_status(status, deployment_id).await;

        self.network(true).await?;
        let token = self.current_token()?;
        let mut result = self.api.publish_status(&token, deployment_id, status).await;
        if matches!(result, Err(ApiError::Unauthorized)) {
            let token = self.reauthenticate().await?;
            result = self.api.publish_status(&token, deployment_id, status).await;
        }
        self.network(false).await?;
        result.map_err(AgentError::Api)?;

        if let Some(d) = &mut deployment {
            if d.id == deployment_id {
                d.mark_reported(status);
                self.store.set_json(keys::DEPLOYMENT_DATA, d).await?;
            }
        }
        Ok(())
    }

    async fn persist_deployment_state(
        &mut self,
        descriptor: &DeploymentDescriptor,
        status: DeploymentStatus,
    ) -> Result<DeploymentState, AgentError> {
        let mut state = self
            .store
            .get_json::<DeploymentState>(keys::DEPLOYMENT_DATA)
            .await?
            .filter(|s| s.id == descriptor.id)
            .unwrap_or_else(|| DeploymentState::new(descriptor.id.clone(), descriptor.artifact_name.clone()));
        state.mark_reported(status);
        self.store.set_json(keys::DEPLOYMENT_DATA, &state).await?;
        Ok(state)
    }

    async fn clear_deployment_state(&mut self) -> Result<(), AgentError> {
        self.store.delete(keys::DEPLOYMENT_DATA).await?;
        Ok(())
    }
}
