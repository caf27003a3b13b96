use std::sync::Arc;

use async_trait::async_trait;
use mender_api::{ApiError, CapabilityError, CryptoBackend, DeploymentCheckOutcome, IdentityProvider, MenderApiClient};
use mender_domain::{ClientConfig, DeploymentStatus, Identity};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct StubIdentity;

#[async_trait]
impl IdentityProvider for StubIdentity {
    async fn get_identity(&self) -> Result<Identity, CapabilityError> {
        Ok(Identity { name: "mac".into(), value: "00:11:22:33:44:55".into() })
    }
}

struct StubCrypto;

#[async_trait]
impl CryptoBackend for StubCrypto {
    async fn public_key_pem(&self) -> Result<String, CapabilityError> {
        Ok("-----BEGIN PUBLIC KEY-----\nstub\n-----END PUBLIC KEY-----\n".into())
    }

    async fn sign(&self, _payload: &[u8]) -> Result<Vec<u8>, CapabilityError> {
        Ok(vec![1, 2, 3, 4])
    }

    async fn verify_signature(&self, _data: &[u8], _signature: &[u8]) -> Result<bool, CapabilityError> {
        Ok(true)
    }
}

fn test_config(host: &str) -> ClientConfig {
    ClientConfig {
        device_type: "raspberrypi4".into(),
        host: host.into(),
        tenant_token: None,
        auth_poll_interval: 600,
        update_poll_interval: 1800,
        inventory_poll_interval: 28800,
        recommissioning: false,
    }
}

fn client_for(server: &MockServer) -> MenderApiClient {
    MenderApiClient::new(test_config(&server.uri()), Arc::new(StubIdentity), Arc::new(StubCrypto))
}

#[tokio::test]
async fn authenticate_returns_bearer_token_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/devices/v1/authentication/auth_requests"))
        .respond_with(ResponseTemplate::new(200).set_body_string("opaque-token-xyz"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let token = client.authenticate().await.unwrap();
    assert_eq!(token.as_str(), "opaque-token-xyz");
}

#[tokio::test]
async fn authenticate_non_200_is_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/devices/v1/authentication/auth_requests"))
        .respond_with(ResponseTemplate::new(401).set_body_string(""))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.authenticate().await.unwrap_err();
    assert!(matches!(err, ApiError::Failure { status: 401, .. }));
}

#[tokio::test]
async fn check_for_deployment_happy_path_v2() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/devices/v2/deployments/device/deployments/next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "d1",
            "artifact": {
                "artifact_name": "fw-2",
                "source": { "uri": "https://a/x" },
                "device_types_compatible": ["raspberrypi4"],
            }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let token = mender_domain::SessionToken::new("tok");
    let outcome = client
        .check_for_deployment(&token, "fw-1", &std::collections::HashMap::new())
        .await
        .unwrap();

    match outcome {
        DeploymentCheckOutcome::Available(desc) => {
            assert_eq!(desc.id, "d1");
            assert_eq!(desc.artifact_name, "fw-2");
            assert_eq!(desc.uri, "https://a/x");
            assert_eq!(desc.device_types_compatible, vec!["raspberrypi4".to_string()]);
        }
        DeploymentCheckOutcome::NoUpdate => panic!("expected a deployment"),
    }
}

#[tokio::test]
async fn check_for_deployment_no_update_on_204() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/devices/v2/deployments/device/deployments/next"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let token = mender_domain::SessionToken::new("tok");
    let outcome = client
        .check_for_deployment(&token, "fw-1", &std::collections::HashMap::new())
        .await
        .unwrap();
    assert!(matches!(outcome, DeploymentCheckOutcome::NoUpdate));
}

#[tokio::test]
async fn check_for_deployment_falls_back_to_v1_on_404() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/devices/v2/deployments/device/deployments/next"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/devices/v1/deployments/device/deployments/next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "d1",
            "artifact": {
                "artifact_name": "fw-2",
                "source": { "uri": "https://a/x" },
                "device_types_compatible": ["raspberrypi4"],
            }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let token = mender_domain::SessionToken::new("tok");
    let outcome = client
        .check_for_deployment(&token, "fw-1", &std::collections::HashMap::new())
        .await
        .unwrap();
    assert!(matches!(outcome, DeploymentCheckOutcome::Available(_)));
}

#[tokio::test]
async fn publish_status_expects_204() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d1/status"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let token = mender_domain::SessionToken::new("tok");
    client.publish_status(&token, "d1", DeploymentStatus::Downloading).await.unwrap();
}

#[tokio::test]
async fn publish_status_401_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d1/status"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let token = mender_domain::SessionToken::new("tok");
    let err = client.publish_status(&token, "d1", DeploymentStatus::Downloading).await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
}

#[tokio::test]
async fn publish_inventory_expects_200() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/inventory/device/attributes"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let token = mender_domain::SessionToken::new("tok");
    client.publish_inventory(&token, "fw-1", &[]).await.unwrap();
}

struct CollectingSink {
    bytes: Vec<u8>,
    target_len: usize,
}

impl mender_api::ArtifactSink for CollectingSink {
    fn feed(&mut self, bytes: &[u8]) -> Result<bool, String> {
        self.bytes.extend_from_slice(bytes);
        Ok(self.bytes.len() >= self.target_len)
    }
}

#[tokio::test]
async fn download_artifact_streams_body_into_sink() {
    let server = MockServer::start().await;
    let payload = b"the quick brown fox".to_vec();
    Mock::given(method("GET"))
        .and(path("/artifacts/fw-2.mender"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let uri = format!("{}/artifacts/fw-2.mender", server.uri());
    let mut sink = CollectingSink { bytes: Vec::new(), target_len: payload.len() };
    client.download_artifact(&uri, &mut sink).await.unwrap();
    assert_eq!(sink.bytes, payload);
}
