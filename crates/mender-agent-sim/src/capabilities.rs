use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use mender_agent::PlatformHooks;
use mender_api::{CapabilityError, CryptoBackend, IdentityProvider};
use mender_domain::{DeploymentStatus, Identity};
use mender_store::{keys, StateStore};
use sha2::{Digest, Sha256};
use tracing::info;

/// Demo identity provider: a single `mac`-style attribute, generated once
/// and persisted so repeated runs against the same store look like the
/// same device (§6 "queried fresh at every authentication attempt" still
/// holds — this just always answers with the same value once seeded).
pub struct SimIdentityProvider {
    identity: Identity,
}

impl SimIdentityProvider {
    pub fn new(device_id: &str) -> Self {
        Self { identity: Identity { name: "mac".into(), value: device_id.into() } }
    }
}

#[async_trait]
impl IdentityProvider for SimIdentityProvider {
    async fn get_identity(&self) -> Result<Identity, CapabilityError> {
        Ok(self.identity.clone())
    }
}

/// Demo crypto backend (§6). Real devices sign with an asymmetric keypair
/// held in a TPM or PKCS#11 module; this stand-in persists a symmetric
/// secret through the same `StateStore` the rest of the agent uses and
/// derives a "signature" as a keyed SHA-256 digest. It satisfies the
/// `CryptoBackend` contract (byte-exact PEM/signature output, `verify_signature`
/// agreeing with `sign`) without pulling in a real asymmetric-crypto crate
/// for a demo binary that only ever talks to itself or a trusted test server.
pub struct SimCryptoBackend {
    store: Arc<dyn StateStore>,
}

impl SimCryptoBackend {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    async fn secret(&self) -> Result<Vec<u8>, CapabilityError> {
        if let Some(existing) = self.store.get(keys::PRIVATE_KEY).await.map_err(|e| CapabilityError(e.to_string()))? {
            return Ok(existing);
        }
        let generated: Vec<u8> = uuid::Uuid::new_v4().as_bytes().to_vec();
        self.store
            .set(keys::PRIVATE_KEY, &generated)
            .await
            .map_err(|e| CapabilityError(e.to_string()))?;
        Ok(generated)
    }
}

#[async_trait]
impl CryptoBackend for SimCryptoBackend {
    async fn public_key_pem(&self) -> Result<String, CapabilityError> {
        let secret = self.secret().await?;
        let digest = Sha256::digest(&secret);
        let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
        Ok(format!("-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n", encoded))
    }

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        let secret = self.secret().await?;
        let mut hasher = Sha256::new();
        hasher.update(&secret);
        hasher.update(payload);
        Ok(hasher.finalize().to_vec())
    }

    async fn verify_signature(&self, data: &[u8], signature: &[u8]) -> Result<bool, CapabilityError> {
        let expected = self.sign(data).await?;
        Ok(expected == signature)
    }

    async fn generate_keys(&self) -> Result<(), CapabilityError> {
        let generated: Vec<u8> = uuid::Uuid::new_v4().as_bytes().to_vec();
        self.store.set(keys::PRIVATE_KEY, &generated).await.map_err(|e| CapabilityError(e.to_string()))?;
        Ok(())
    }
}

/// Demo platform hooks: logs every notification instead of touching real
/// networking/reboot hardware (§6). `restart()` returns `Ok(())` rather
/// than terminating the process, so `run_post_reboot_verification` can be
/// exercised in the same run — see `commands::run_once`.
pub struct SimPlatformHooks;

#[async_trait]
impl PlatformHooks for SimPlatformHooks {
    async fn network_connect(&self) -> Result<(), CapabilityError> {
        info!("mender-agent-sim: network up");
        Ok(())
    }

    async fn network_release(&self) -> Result<(), CapabilityError> {
        info!("mender-agent-sim: network down");
        Ok(())
    }

    async fn restart(&self) -> Result<(), CapabilityError> {
        info!("mender-agent-sim: simulated restart (process continues)");
        Ok(())
    }

    async fn deployment_status(&self, status: DeploymentStatus, deployment_id: &str) {
        info!(deployment_id, status = %status, "mender-agent-sim: deployment status");
    }

    async fn authentication_success(&self) {
        info!("mender-agent-sim: authentication succeeded");
    }

    async fn authentication_failure(&self) {
        info!("mender-agent-sim: authentication failed");
    }
}
