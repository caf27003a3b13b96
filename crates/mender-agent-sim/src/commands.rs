use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use mender_agent::{DeploymentMachine, Scheduler, WorkKind};
use mender_domain::ClientConfig;
use mender_store::{InMemoryStore, RedbStore, StateStore};
use mender_update::{NoopUpdateModule, UpdateModuleRegistry};
use tracing::info;

use crate::capabilities::{SimCryptoBackend, SimIdentityProvider, SimPlatformHooks};

fn build_store(ephemeral: bool, store_path: &Path) -> Result<Arc<dyn StateStore>> {
    if ephemeral {
        info!("mender-agent-sim: using in-memory (ephemeral) store");
        Ok(Arc::new(InMemoryStore::new()))
    } else {
        info!(path = %store_path.display(), "mender-agent-sim: using persistent redb store");
        Ok(Arc::new(
            RedbStore::open(store_path)
                .with_context(|| format!("failed to open store at {}", store_path.display()))?,
        ))
    }
}

/// The registry is unconditionally wired with a `NoopUpdateModule` for
/// `rootfs-image` — concrete update modules (a flash-writer, etc.) are out
/// of scope (spec §1); this is the stand-in demo double the scheduler
/// dispatches to.
fn build_registry() -> Arc<UpdateModuleRegistry> {
    let mut registry = UpdateModuleRegistry::new();
    registry
        .register(Arc::new(NoopUpdateModule::new("rootfs-image")))
        .expect("rootfs-image registered exactly once");
    Arc::new(registry)
}

async fn build_machine(
    config: ClientConfig,
    store: Arc<dyn StateStore>,
    device_id: &str,
) -> Result<DeploymentMachine> {
    let identity_provider = Arc::new(SimIdentityProvider::new(device_id));
    let crypto = Arc::new(SimCryptoBackend::new(store.clone()));
    let platform = Arc::new(SimPlatformHooks);
    let registry = build_registry();

    DeploymentMachine::load(config, store, identity_provider, crypto, registry, platform)
        .await
        .context("failed to initialize the deployment state machine")
}

pub async fn run_once(config_path: &Path, ephemeral: bool, store_path: &Path, device_id: &str) -> Result<()> {
    let config = mender_config::load_client_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let store = build_store(ephemeral, store_path)?;
    let mut machine = build_machine(config, store, device_id).await?;

    if machine.pending_deployment().await?.is_some() {
        info!("mender-agent-sim: resuming in-flight deployment (post-reboot verification)");
        machine.run_post_reboot_verification().await.context("post-reboot verification failed")?;
        return Ok(());
    }

    machine.run_authentication().await.context("authentication failed")?;

    match machine.run_update_check().await {
        Ok(()) => info!(artifact_name = %machine.artifact_name(), "mender-agent-sim: deployment committed without reboot"),
        Err(e) if !e.is_deployment_failure() => {
            info!(reason = %e, "mender-agent-sim: no deployment to apply");
        }
        Err(e) => return Err(e).context("update check failed"),
    }

    // A module reporting `needs_reboot` leaves the machine in
    // `RebootRequested`; the simulator's `restart()` hook doesn't actually
    // terminate the process, so immediately drive the post-reboot
    // verification step here to complete the cycle end to end.
    if machine.pending_deployment().await?.is_some() {
        machine.run_post_reboot_verification().await.context("post-reboot verification failed")?;
    }

    Ok(())
}

pub async fn serve(config_path: &Path, ephemeral: bool, store_path: &Path, device_id: &str) -> Result<()> {
    let config = mender_config::load_client_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let store = build_store(ephemeral, store_path)?;
    let with_inventory = config.inventory_poll_interval >= 0;
    let cfg_for_scheduler = config.clone();
    let machine = build_machine(config, store, device_id).await?;

    let scheduler = Scheduler::new(machine, &cfg_for_scheduler, with_inventory);
    scheduler.execute(WorkKind::Authentication).await;
    scheduler.execute(WorkKind::Update).await;

    info!("mender-agent-sim: scheduler running, press Ctrl+C to stop");
    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("mender-agent-sim: shutdown requested");
        }
    }
    Ok(())
}

pub async fn status(config_path: &Path, ephemeral: bool, store_path: &Path, device_id: &str) -> Result<()> {
    let config = mender_config::load_client_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let store = build_store(ephemeral, store_path)?;
    let machine = build_machine(config, store, device_id).await?;

    println!("artifact_name: {}", machine.artifact_name());
    println!("state: {:?}", machine.state());
    match machine.pending_deployment().await? {
        Some(d) => println!("pending deployment: {} ({})", d.id, d.artifact_name),
        None => println!("pending deployment: none"),
    }
    Ok(())
}
