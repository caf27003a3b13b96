use std::sync::Arc;

use base64::Engine;
use mender_domain::{ClientConfig, DeploymentDescriptor, DeploymentStatus, Identity, SessionToken};
use serde_json::json;
use tracing::{debug, warn};

use crate::capability::{ArtifactSink, CryptoBackend, IdentityProvider};
use crate::error::ApiError;

/// Header carrying the base64-encoded signature over the authentication
/// request body. Real device fleets agree on this name out of band with
/// the deployment service (§4.2 calls it "part of the external HTTP
/// contract, not this spec"); this workspace standardizes on the name the
/// upstream Mender project itself uses.
pub const SIGNATURE_HEADER: &str = "X-MEN-Signature";

/// Outcome of [`MenderApiClient::check_for_deployment`] (§4.2).
#[derive(Debug)]
pub enum DeploymentCheckOutcome {
    Available(DeploymentDescriptor),
    NoUpdate,
}

/// A single attribute published to the inventory endpoint.
#[derive(Debug, Clone)]
pub struct InventoryAttribute {
    pub name: String,
    pub value: String,
}

/// Deployment-service protocol client (C2). Owns the `reqwest::Client`
/// transport and the live session token; everything else it needs
/// (identity, signing) comes in through the capability traits injected at
/// construction, per §6.
pub struct MenderApiClient {
    http: reqwest::Client,
    config: ClientConfig,
    identity_provider: Arc<dyn IdentityProvider>,
    crypto: Arc<dyn CryptoBackend>,
}

impl MenderApiClient {
    pub fn new(
        config: ClientConfig,
        identity_provider: Arc<dyn IdentityProvider>,
        crypto: Arc<dyn CryptoBackend>,
    ) -> Self {
        Self { http: reqwest::Client::new(), config, identity_provider, crypto }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.host.trim_end_matches('/'), path)
        }
    }

    /// POST /api/devices/v1/authentication/auth_requests (§4.2).
    ///
    /// On success the bearer token travels back verbatim in the response
    /// body; this call never inspects or transforms it.
    pub async fn authenticate(&self) -> Result<SessionToken, ApiError> {
        let identity: Identity = self
            .identity_provider
            .get_identity()
            .await
            .map_err(ApiError::from)?;
        let pubkey = self.crypto.public_key_pem().await.map_err(ApiError::from)?;

        let id_data = mender_domain::identity_to_json(std::slice::from_ref(&identity)).to_string();
        let mut payload = json!({ "id_data": id_data, "pubkey": pubkey });
        if let Some(tenant) = &self.config.tenant_token {
            payload["tenant_token"] = json!(tenant);
        }
        let body = serde_json::to_vec(&payload).map_err(|e| ApiError::MalformedResponse(e.to_string()))?;

        let signature = self.crypto.sign(&body).await.map_err(ApiError::from)?;
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature);

        let url = self.url("/api/devices/v1/authentication/auth_requests");
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature_b64)
            .body(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if status != 200 {
            warn!(status, "mender-api: authentication rejected");
            return Err(ApiError::from_status(status, text.as_bytes()));
        }
        Ok(SessionToken::new(text))
    }

    /// Checks for a pending deployment (§4.2): tries the v2 POST first,
    /// falling back to the v1 GET on 404.
    pub async fn check_for_deployment(
        &self,
        token: &SessionToken,
        artifact_name: &str,
        provides: &std::collections::HashMap<String, String>,
    ) -> Result<DeploymentCheckOutcome, ApiError> {
        let v2_url = self.url("/api/devices/v2/deployments/device/deployments/next");
        let mut device_provides = json!({
            "device_type": self.config.device_type,
            "artifact_name": artifact_name,
        });
        if !provides.is_empty() {
            device_provides["provides"] = json!(provides);
        }
        let body = json!({ "device_provides": device_provides });

        let resp = self
            .http
            .post(&v2_url)
            .bearer_auth(&token.0)
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();

        if status == 404 {
            debug!("mender-api: v2 deployment check returned 404, falling back to v1");
            return self.check_for_deployment_v1(token, artifact_name).await;
        }

        self.handle_deployment_response(status, resp).await
    }

    async fn check_for_deployment_v1(
        &self,
        token: &SessionToken,
        artifact_name: &str,
    ) -> Result<DeploymentCheckOutcome, ApiError> {
        let url = format!(
            "{}?artifact_name={}&device_type={}",
            self.url("/api/devices/v1/deployments/device/deployments/next"),
            urlencode(artifact_name),
            urlencode(&self.config.device_type),
        );
        let resp = self.http.get(&url).bearer_auth(&token.0).send().await?;
        let status = resp.status().as_u16();
        self.handle_deployment_response(status, resp).await
    }

    async fn handle_deployment_response(
        &self,
        status: u16,
        resp: reqwest::Response,
    ) -> Result<DeploymentCheckOutcome, ApiError> {
        match status {
            200 => {
                let body: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| ApiError::MalformedResponse(e.to_string()))?;
                parse_deployment_descriptor(&body).map(DeploymentCheckOutcome::Available)
            }
            204 => Ok(DeploymentCheckOutcome::NoUpdate),
            401 => Err(ApiError::Unauthorized),
            other => {
                let text = resp.text().await.unwrap_or_default();
                warn!(status = other, "mender-api: deployment check failed");
                Err(ApiError::from_status(other, text.as_bytes()))
            }
        }
    }

    /// PUT /api/devices/v1/deployments/device/deployments/{id}/status (§4.2).
    pub async fn publish_status(
        &self,
        token: &SessionToken,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!(
            "/api/devices/v1/deployments/device/deployments/{}/status",
            deployment_id
        ));
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&token.0)
            .json(&json!({ "status": status.as_str() }))
            .send()
            .await?;
        let code = resp.status().as_u16();
        match code {
            204 => Ok(()),
            401 => Err(ApiError::Unauthorized),
            other => {
                let text = resp.text().await.unwrap_or_default();
                warn!(status = other, deployment_id, "mender-api: status publish failed");
                Err(ApiError::from_status(other, text.as_bytes()))
            }
        }
    }

    /// PUT /api/devices/v1/inventory/device/attributes (§4.2).
    pub async fn publish_inventory(
        &self,
        token: &SessionToken,
        artifact_name: &str,
        extra: &[InventoryAttribute],
    ) -> Result<(), ApiError> {
        let url = self.url("/api/devices/v1/inventory/device/attributes");
        let mut items = vec![
            json!({ "name": "artifact_name", "value": artifact_name }),
            json!({ "name": "rootfs-image.version", "value": artifact_name }),
            json!({ "name": "device_type", "value": self.config.device_type }),
        ];
        for attr in extra {
            items.push(json!({ "name": attr.name, "value": attr.value }));
        }

        let resp = self.http.put(&url).bearer_auth(&token.0).json(&items).send().await?;
        let code = resp.status().as_u16();
        match code {
            200 => Ok(()),
            401 => Err(ApiError::Unauthorized),
            other => {
                let text = resp.text().await.unwrap_or_default();
                warn!(status = other, "mender-api: inventory publish failed");
                Err(ApiError::from_status(other, text.as_bytes()))
            }
        }
    }

    /// GET the artifact at `uri` (a pre-signed URL, so no session token is
    /// attached) and stream its body through `sink` in receive order (§4.2
    /// "Download", §5 ordering guarantees).
    pub async fn download_artifact(
        &self,
        uri: &str,
        sink: &mut dyn ArtifactSink,
    ) -> Result<(), ApiError> {
        use futures_util::StreamExt;

        let resp = self.http.get(uri).send().await?;
        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "mender-api: artifact download failed");
            return Err(ApiError::from_status(status, text.as_bytes()));
        }

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            sink.feed(&chunk).map_err(ApiError::MalformedResponse)?;
        }
        Ok(())
    }
}

fn parse_deployment_descriptor(body: &serde_json::Value) -> Result<DeploymentDescriptor, ApiError> {
    let id = body
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::MalformedResponse("deployment response missing id".into()))?
        .to_string();
    let artifact = body
        .get("artifact")
        .ok_or_else(|| ApiError::MalformedResponse("deployment response missing artifact".into()))?;
    let artifact_name = artifact
        .get("artifact_name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::MalformedResponse("deployment response missing artifact_name".into()))?
        .to_string();
    let uri = artifact
        .get("source")
        .and_then(|s| s.get("uri"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::MalformedResponse("deployment response missing source.uri".into()))?
        .to_string();
    let device_types_compatible = artifact
        .get("device_types_compatible")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            ApiError::MalformedResponse("deployment response missing device_types_compatible".into())
        })?
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();

    Ok(DeploymentDescriptor { id, artifact_name, uri, device_types_compatible })
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
