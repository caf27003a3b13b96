//! End-to-end boundary scenarios from spec §8, driving `DeploymentMachine`
//! against a mocked deployment service and a real `ArtifactParser` download.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mender_agent::{DeploymentMachine, MachineState, PlatformHooks};
use mender_api::{CapabilityError, CryptoBackend, IdentityProvider};
use mender_artifact::tar;
use mender_domain::{ClientConfig, DeploymentStatus, Identity};
use mender_store::{InMemoryStore, StateStore};
use mender_update::{NoopUpdateModule, UpdateError, UpdateModule, UpdateModuleRegistry};
use sha2::{Digest, Sha256};
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

/// Records every status transition and dispatch notification the machine
/// reports, so each scenario can assert on the exact sequence the server
/// would have observed (§8 "status sequence ... no status reported twice").
#[derive(Default)]
struct RecordingPlatform {
    statuses: Mutex<Vec<(String, DeploymentStatus)>>,
    restarts: Mutex<u32>,
}

#[async_trait]
impl PlatformHooks for RecordingPlatform {
    async fn network_connect(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn network_release(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn restart(&self) -> Result<(), CapabilityError> {
        *self.restarts.lock().unwrap() += 1;
        Ok(())
    }

    async fn deployment_status(&self, status: DeploymentStatus, deployment_id: &str) {
        self.statuses.lock().unwrap().push((deployment_id.to_string(), status));
    }

    async fn authentication_success(&self) {}
    async fn authentication_failure(&self) {}
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

async fn mount_auth(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/devices/v1/authentication/auth_requests"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok-1"))
        .mount(server)
        .await;
}

// ── minimal valid artifact construction (mirrors mender-artifact's own
// test helper; duplicated rather than shared across a test-only crate
// boundary) ──────────────────────────────────────────────────────────────

fn pack_entry(name: &str, content: &[u8]) -> Vec<u8> {
    let mut block = [0u8; tar::BLOCK_SIZE];
    block[0..name.len()].copy_from_slice(name.as_bytes());
    let octal = format!("{:011o}\0", content.len());
    block[124..124 + octal.len()].copy_from_slice(octal.as_bytes());
    block[156] = b'0';
    let mut out = block.to_vec();
    out.extend_from_slice(content);
    let padded = tar::blocks_for(content.len() as u64) as usize * tar::BLOCK_SIZE;
    out.resize(out.len() + (padded - content.len()), 0);
    out
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// A single-payload `rootfs-image` artifact, version 3, targeting
/// `device_type`, advertising `artifact_name`.
fn build_artifact(device_type: &str, artifact_name: &str, payload: &[u8]) -> Vec<u8> {
    let header_info_json = format!(
        r#"{{"artifact_name":"{}","device_types_compatible":["{}"],"payloads":[{{"type":"rootfs-image"}}]}}"#,
        artifact_name, device_type
    );
    let header_tar = pack_entry("header-info", header_info_json.as_bytes());
    let inner_data_tar = pack_entry("payload.bin", payload);

    let manifest_text = format!(
        "{}  version\n{}  header.tar\n{}  data/0000.tar/payload.bin\n",
        sha256_hex(b"3"),
        sha256_hex(&header_tar),
        sha256_hex(payload),
    );

    let mut artifact = Vec::new();
    artifact.extend(pack_entry("version", b"3"));
    artifact.extend(pack_entry("manifest", manifest_text.as_bytes()));
    artifact.extend(pack_entry("header.tar", &header_tar));
    artifact.extend(pack_entry("data/0000.tar", &inner_data_tar));
    artifact.extend([0u8; tar::BLOCK_SIZE]);
    artifact
}

async fn mount_descriptor(server: &MockServer, id: &str, artifact_name: &str, uri: &str, device_types: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/api/devices/v2/deployments/device/deployments/next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": id,
            "artifact": {
                "artifact_name": artifact_name,
                "source": { "uri": uri },
                "device_types_compatible": device_types,
            }
        })))
        .mount(server)
        .await;
}

async fn mount_artifact_download(server: &MockServer, route: &str, bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .mount(server)
        .await;
}

/// A lifecycle-recording module: which calls were made, in what order, and
/// whether a reboot is required.
#[derive(Default)]
struct RecordingModule {
    needs_reboot: bool,
    bytes_received: Mutex<usize>,
    calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl UpdateModule for RecordingModule {
    fn type_name(&self) -> &str {
        "rootfs-image"
    }

    fn needs_reboot(&self) -> bool {
        self.needs_reboot
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn download_artifact_flash(
        &self,
        chunk: &[u8],
        _offset: u64,
        _total: u64,
        _filename: &str,
    ) -> Result<(), UpdateError> {
        *self.bytes_received.lock().unwrap() += chunk.len();
        Ok(())
    }

    async fn end_of_payload(&self) -> Result<(), UpdateError> {
        self.calls.lock().unwrap().push("end_of_payload");
        Ok(())
    }

    async fn artifact_install(&self) -> Result<(), UpdateError> {
        self.calls.lock().unwrap().push("install");
        Ok(())
    }

    async fn artifact_commit(&self) -> Result<(), UpdateError> {
        self.calls.lock().unwrap().push("commit");
        Ok(())
    }

    async fn artifact_rollback(&self) -> Result<(), UpdateError> {
        self.calls.lock().unwrap().push("rollback");
        Ok(())
    }

    async fn artifact_failure(&self) -> Result<(), UpdateError> {
        self.calls.lock().unwrap().push("failure");
        Ok(())
    }
}

// ── scenario 1: happy path, no reboot required ───────────────────────────

#[tokio::test]
async fn happy_path_downloads_installs_and_commits_without_reboot() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    let artifact = build_artifact("raspberrypi4", "fw-2", b"firmware bytes");
    mount_descriptor(&server, "d1", "fw-2", &format!("{}/artifacts/fw-2", server.uri()), &["raspberrypi4"]).await;
    mount_artifact_download(&server, "/artifacts/fw-2", artifact).await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d1/status"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let module = Arc::new(RecordingModule::default());
    let mut registry = UpdateModuleRegistry::new();
    registry.register(module.clone()).unwrap();

    let platform = Arc::new(RecordingPlatform::default());
    let mut machine = DeploymentMachine::load(
        test_config(&server.uri()),
        Arc::new(InMemoryStore::new()),
        Arc::new(StubIdentity),
        Arc::new(StubCrypto),
        Arc::new(registry),
        platform.clone(),
    )
    .await
    .unwrap();

    machine.run_update_check().await.unwrap();

    assert_eq!(machine.state(), MachineState::Committed);
    assert_eq!(machine.artifact_name().as_str(), "fw-2");
    assert_eq!(*module.bytes_received.lock().unwrap(), b"firmware bytes".len());
    assert_eq!(*module.calls.lock().unwrap(), vec!["end_of_payload", "install", "commit"]);

    let statuses: Vec<DeploymentStatus> = platform.statuses.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(statuses, vec![DeploymentStatus::Downloading, DeploymentStatus::Installing, DeploymentStatus::Success]);
    assert_eq!(*platform.restarts.lock().unwrap(), 0);
}

// ── scenario 2: a module needing reboot suspends the flow, then a fresh
// machine loaded from the same store completes the commit after "reboot" ──

#[tokio::test]
async fn reboot_required_persists_state_and_commits_after_restart() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    let artifact = build_artifact("raspberrypi4", "fw-3", b"kernel image bytes");
    mount_descriptor(&server, "d2", "fw-3", &format!("{}/artifacts/fw-3", server.uri()), &["raspberrypi4"]).await;
    mount_artifact_download(&server, "/artifacts/fw-3", artifact).await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d2/status"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    let module = Arc::new(RecordingModule { needs_reboot: true, ..Default::default() });
    let mut registry = UpdateModuleRegistry::new();
    registry.register(module.clone()).unwrap();
    let platform = Arc::new(RecordingPlatform::default());

    let mut machine = DeploymentMachine::load(
        test_config(&server.uri()),
        store.clone(),
        Arc::new(StubIdentity),
        Arc::new(StubCrypto),
        Arc::new(registry),
        platform.clone(),
    )
    .await
    .unwrap();

    machine.run_update_check().await.unwrap();
    assert_eq!(machine.state(), MachineState::RebootRequested);
    assert_eq!(*platform.restarts.lock().unwrap(), 1);
    assert_eq!(machine.artifact_name().as_str(), "unknown", "artifact_name not yet committed before reboot");

    // Deployment state must have survived in the store across the
    // simulated reboot (§4.5 persistence, §8 round-trip law).
    let pending = machine.pending_deployment().await.unwrap();
    assert!(pending.is_some());

    // Simulate the reboot: a fresh machine loaded from the same store.
    let mut registry2 = UpdateModuleRegistry::new();
    registry2.register(module.clone()).unwrap();
    let mut rebooted = DeploymentMachine::load(
        test_config(&server.uri()),
        store.clone(),
        Arc::new(StubIdentity),
        Arc::new(StubCrypto),
        Arc::new(registry2),
        platform.clone(),
    )
    .await
    .unwrap();

    rebooted.run_post_reboot_verification().await.unwrap();

    assert_eq!(rebooted.state(), MachineState::Committed);
    assert_eq!(rebooted.artifact_name().as_str(), "fw-3");
    assert!(rebooted.pending_deployment().await.unwrap().is_none(), "deployment state cleared after commit");
    assert_eq!(*module.calls.lock().unwrap(), vec!["end_of_payload", "install", "commit"]);
}

// ── scenario 3: already installed short-circuits the download ───────────

#[tokio::test]
async fn already_installed_skips_download_and_reports_once() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_descriptor(&server, "d3", "fw-2", "https://unused/should-not-be-fetched", &["raspberrypi4"]).await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d3/status"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store.set(mender_store::keys::ARTIFACT_NAME, b"fw-2").await.unwrap();

    let module = Arc::new(RecordingModule::default());
    let mut registry = UpdateModuleRegistry::new();
    registry.register(module.clone()).unwrap();
    let platform = Arc::new(RecordingPlatform::default());

    let mut machine = DeploymentMachine::load(
        test_config(&server.uri()),
        store,
        Arc::new(StubIdentity),
        Arc::new(StubCrypto),
        Arc::new(registry),
        platform.clone(),
    )
    .await
    .unwrap();

    let err = machine.run_update_check().await.unwrap_err();
    assert!(matches!(err, mender_agent::AgentError::AlreadyInstalled(ref id) if id == "d3"));

    let statuses = platform.statuses.lock().unwrap();
    assert_eq!(statuses.as_slice(), &[("d3".to_string(), DeploymentStatus::AlreadyInstalled)]);
    assert_eq!(*module.bytes_received.lock().unwrap(), 0, "no bytes should reach the update module");
}

// ── scenario 4: incompatible device type reports failure, no dispatch ───

#[tokio::test]
async fn incompatible_device_type_reports_failure_without_dispatching_bytes() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_descriptor(&server, "d4", "fw-2", "https://unused/should-not-be-fetched", &["dev-A"]).await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d4/status"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let module = Arc::new(RecordingModule::default());
    let mut registry = UpdateModuleRegistry::new();
    registry.register(module.clone()).unwrap();
    let platform = Arc::new(RecordingPlatform::default());

    // Configured device_type ("raspberrypi4") is not in the descriptor's
    // compatible list ("dev-A").
    let mut machine = DeploymentMachine::load(
        test_config(&server.uri()),
        Arc::new(InMemoryStore::new()),
        Arc::new(StubIdentity),
        Arc::new(StubCrypto),
        Arc::new(registry),
        platform.clone(),
    )
    .await
    .unwrap();

    assert!(machine.run_update_check().await.is_err());

    let statuses: Vec<DeploymentStatus> = platform.statuses.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(statuses, vec![DeploymentStatus::Failure]);
    assert_eq!(*module.bytes_received.lock().unwrap(), 0);
    assert!(module.calls.lock().unwrap().is_empty(), "module never registered for this payload, no failure callback to fire");
}

// ── scenario 6: 401 on status publish triggers a single re-authentication
// and the original call is retried exactly once ─────────────────────────

#[tokio::test]
async fn reauthenticates_once_on_401_during_status_publish() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    let artifact = build_artifact("raspberrypi4", "fw-2", b"abc");
    mount_descriptor(&server, "d6", "fw-2", &format!("{}/artifacts/fw-2", server.uri()), &["raspberrypi4"]).await;
    mount_artifact_download(&server, "/artifacts/fw-2", artifact).await;

    // First status PUT (downloading) is rejected once with 401, then every
    // subsequent PUT succeeds with 204. Explicit priorities (lower runs
    // first) make the ordering deterministic regardless of mount order;
    // the 401 mock drops out of contention once `up_to_n_times` is spent,
    // so later PUTs fall through to the always-204 mock.
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d6/status"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d6/status"))
        .respond_with(ResponseTemplate::new(204))
        .with_priority(2)
        .mount(&server)
        .await;

    let module = Arc::new(RecordingModule::default());
    let mut registry = UpdateModuleRegistry::new();
    registry.register(module.clone()).unwrap();
    let platform = Arc::new(RecordingPlatform::default());

    let mut machine = DeploymentMachine::load(
        test_config(&server.uri()),
        Arc::new(InMemoryStore::new()),
        Arc::new(StubIdentity),
        Arc::new(StubCrypto),
        Arc::new(registry),
        platform.clone(),
    )
    .await
    .unwrap();

    machine.run_update_check().await.unwrap();

    assert_eq!(machine.state(), MachineState::Committed);
    let statuses: Vec<DeploymentStatus> = platform.statuses.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(statuses, vec![DeploymentStatus::Downloading, DeploymentStatus::Installing, DeploymentStatus::Success]);
}

// ── a module with no rollback support still reports failure and clears
// state on a commit-time error ──────────────────────────────────────────

#[tokio::test]
async fn noop_module_survives_a_full_cycle() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    let artifact = build_artifact("raspberrypi4", "fw-9", b"noop payload");
    mount_descriptor(&server, "d9", "fw-9", &format!("{}/artifacts/fw-9", server.uri()), &["raspberrypi4"]).await;
    mount_artifact_download(&server, "/artifacts/fw-9", artifact).await;
    Mock::given(method("PUT"))
        .and(path("/api/devices/v1/deployments/device/deployments/d9/status"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let mut registry = UpdateModuleRegistry::new();
    registry.register(Arc::new(NoopUpdateModule::new("rootfs-image"))).unwrap();
    let platform = Arc::new(RecordingPlatform::default());

    let mut machine = DeploymentMachine::load(
        test_config(&server.uri()),
        Arc::new(InMemoryStore::new()),
        Arc::new(StubIdentity),
        Arc::new(StubCrypto),
        Arc::new(registry),
        platform,
    )
    .await
    .unwrap();

    machine.run_update_check().await.unwrap();
    assert_eq!(machine.state(), MachineState::Committed);
}
