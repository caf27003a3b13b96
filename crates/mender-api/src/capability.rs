use async_trait::async_trait;
use mender_domain::Identity;

use crate::error::CapabilityError;

/// §6 device-identity provider. Queried fresh at every authentication
/// attempt — the spec treats identity as ephemeral input, not agent state.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn get_identity(&self) -> Result<Identity, CapabilityError>;
}

/// §6 cryptographic backend: key material and signing live outside the
/// core (a TPM, a PKCS#11 module, a plain on-disk PEM file — the client
/// doesn't care). `verify_signature` backs the optional `manifest.sig`
/// check in the artifact parser (§9 open question), reusing the same
/// backend authentication already depends on rather than inventing a
/// second crypto capability.
#[async_trait]
pub trait CryptoBackend: Send + Sync + 'static {
    async fn public_key_pem(&self) -> Result<String, CapabilityError>;
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CapabilityError>;
    async fn verify_signature(&self, data: &[u8], signature: &[u8]) -> Result<bool, CapabilityError>;

    /// Generate a fresh device keypair, persisting it through whatever
    /// store the backend itself uses. Optional: most backends are
    /// provisioned with a key out of band.
    async fn generate_keys(&self) -> Result<(), CapabilityError> {
        Err(CapabilityError("key generation not supported by this backend".into()))
    }

    /// Load a user-provided key (e.g. supplied out of band at provisioning
    /// time) instead of generating one.
    async fn load_user_provided_key(&self, _pem: &str) -> Result<(), CapabilityError> {
        Err(CapabilityError("loading a user-provided key is not supported by this backend".into()))
    }
}

/// Destination for downloaded artifact bytes (§4.2 "Download"). The HTTP
/// client streams the response body through this sink in receive order;
/// it never buffers the whole artifact itself. `mender-agent` wires an
/// `ArtifactParser` behind this trait so `mender-api` never needs to
/// depend on `mender-artifact` directly.
pub trait ArtifactSink: Send {
    /// Feed the next chunk of downloaded bytes. Returns `Ok(true)` once the
    /// sink has reached a terminal, successful state (no more bytes are
    /// expected); `Ok(false)` if more bytes are needed.
    fn feed(&mut self, bytes: &[u8]) -> Result<bool, String>;
}
