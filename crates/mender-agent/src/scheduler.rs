use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[cfg(feature = "inventory")]
use mender_api::InventoryAttribute;
use mender_domain::ClientConfig;

use crate::error::AgentError;
use crate::state_machine::DeploymentMachine;

/// Which work unit an explicit [`Scheduler::execute`] call should run
/// (§4.6, mapped from the original `mender_client_execute()` entry point).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Authentication,
    Update,
    #[cfg(feature = "inventory")]
    Inventory,
}

/// One periodic/on-demand work unit. A negative or absent interval (§3
/// `update_poll_interval < 0`) disables periodic firing but the unit still
/// runs on an explicit trigger — the interval is simply `None` in that case
/// rather than encoding "disabled" as a sentinel duration.
struct WorkUnit {
    kind: WorkKind,
    interval: Option<Duration>,
    trigger: mpsc::Receiver<()>,
}

/// Cooperative, single-threaded scheduler (C6) driving the three
/// `DeploymentMachine` transition entry points on their own timers.
///
/// The teacher's reconciler never spawns work of its own — concurrency, if
/// any, lives one layer down (here, in `reqwest`'s connection pool, not in
/// this crate). This scheduler keeps that property: work units run as
/// independent `tokio::spawn`ed loops, but every one of them calls through
/// the same `Arc<Mutex<DeploymentMachine>>`, so acquiring that lock *is*
/// the "single permit" §5 requires ("at most one executes at a time per
/// agent") — a separate `Mutex<()>` token would only duplicate what the
/// machine's own lock already guarantees.
pub struct Scheduler {
    machine: Arc<Mutex<DeploymentMachine>>,
    units: Vec<WorkUnit>,
    active: Arc<tokio::sync::Notify>,
    deactivated: Arc<std::sync::atomic::AtomicBool>,
    triggers: Triggers,
}

/// Sender handles kept alongside the scheduler so callers (the CLI, a
/// platform timer interrupt, a test) can invoke [`Scheduler::execute`]
/// without holding a reference to the spawned work-unit tasks themselves.
#[derive(Clone)]
struct Triggers {
    authentication: mpsc::Sender<()>,
    update: mpsc::Sender<()>,
    #[cfg(feature = "inventory")]
    inventory: mpsc::Sender<()>,
}

fn poll_interval(seconds: i64) -> Option<Duration> {
    if seconds < 0 {
        None
    } else {
        Some(Duration::from_secs(seconds as u64))
    }
}

impl Scheduler {
    /// Builds the two always-on work units (authentication, update) and,
    /// when compiled with the `inventory` feature _and_ `with_inventory` is
    /// set at the call site, the third (§4.6 "when inventory support is
    /// compiled in, a third work unit publishes inventory on its own
    /// interval"). `with_inventory` has no effect without the feature —
    /// there is no `WorkKind::Inventory` to dispatch to in that build.
    pub fn new(machine: DeploymentMachine, config: &ClientConfig, with_inventory: bool) -> Self {
        let (auth_tx, auth_rx) = mpsc::channel(1);
        let (update_tx, update_rx) = mpsc::channel(1);

        let mut units = vec![
            WorkUnit { kind: WorkKind::Authentication, interval: poll_interval(config.auth_poll_interval), trigger: auth_rx },
            WorkUnit { kind: WorkKind::Update, interval: poll_interval(config.update_poll_interval), trigger: update_rx },
        ];

        #[cfg(feature = "inventory")]
        let inventory_tx = {
            let (inventory_tx, inventory_rx) = mpsc::channel(1);
            if with_inventory {
                units.push(WorkUnit {
                    kind: WorkKind::Inventory,
                    interval: poll_interval(config.inventory_poll_interval),
                    trigger: inventory_rx,
                });
            }
            inventory_tx
        };
        #[cfg(not(feature = "inventory"))]
        let _ = with_inventory;

        Self {
            machine: Arc::new(Mutex::new(machine)),
            units,
            active: Arc::new(tokio::sync::Notify::new()),
            deactivated: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            triggers: Triggers {
                authentication: auth_tx,
                update: update_tx,
                #[cfg(feature = "inventory")]
                inventory: inventory_tx,
            },
        }
    }

    /// Explicitly fire a work unit out of band, independent of its
    /// interval (§4.6). A full trigger channel (a run already queued)
    /// silently coalesces, matching the "at most one executes at a time"
    /// rule — a second concurrent request for the same work is a no-op,
    /// not a queued second run.
    pub async fn execute(&self, kind: WorkKind) {
        let tx = match kind {
            WorkKind::Authentication => &self.triggers.authentication,
            WorkKind::Update => &self.triggers.update,
            #[cfg(feature = "inventory")]
            WorkKind::Inventory => &self.triggers.inventory,
        };
        let _ = tx.try_send(());
    }

    /// Marks the agent inactive (§5 cancellation). The next cooperative
    /// suspension point in each work-unit loop observes this and stops
    /// scheduling further runs; an in-flight run is allowed to finish so
    /// the state machine's own persistence-on-transition logic has
    /// already saved any mid-deployment progress.
    pub fn deactivate(&self) {
        self.deactivated.store(true, std::sync::atomic::Ordering::SeqCst);
        self.active.notify_waiters();
    }

    pub fn is_active(&self) -> bool {
        !self.deactivated.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Runs every configured work unit to completion of the process (or
    /// until `deactivate`). Consumes the scheduler since each unit's
    /// trigger receiver is moved into its own task.
    pub async fn run(self) {
        let Scheduler { machine, units, deactivated, active, .. } = self;
        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            let machine = machine.clone();
            let deactivated = deactivated.clone();
            let active = active.clone();
            handles.push(tokio::spawn(run_work_unit(unit, machine, deactivated, active)));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_work_unit(
    mut unit: WorkUnit,
    machine: Arc<Mutex<DeploymentMachine>>,
    deactivated: Arc<std::sync::atomic::AtomicBool>,
    active: Arc<tokio::sync::Notify>,
) {
    let mut ticker = unit.interval.map(|period| {
        let mut t = tokio::time::interval(period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    loop {
        tokio::select! {
            _ = async {
                match ticker.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
            triggered = unit.trigger.recv() => {
                if triggered.is_none() {
                    // Sender side dropped — scheduler itself was torn down.
                    break;
                }
            }
            // Wakes a unit blocked on a long (or absent) interval as soon as
            // `Scheduler::deactivate` runs, instead of leaving it parked
            // until its next natural tick.
            _ = active.notified() => {}
        }

        if deactivated.load(std::sync::atomic::Ordering::SeqCst) {
            debug!(kind = ?unit.kind, "mender-agent: scheduler deactivated, stopping work unit");
            break;
        }

        let mut guard = machine.lock().await;
        let result = run_once(unit.kind, &mut guard).await;
        drop(guard);

        match result {
            Ok(()) => info!(kind = ?unit.kind, "mender-agent: work unit completed"),
            Err(e) if !e.is_deployment_failure() => {
                debug!(kind = ?unit.kind, reason = %e, "mender-agent: work unit returned a non-fatal outcome");
            }
            Err(e) => warn!(kind = ?unit.kind, error = %e, "mender-agent: work unit failed"),
        }
    }
}

async fn run_once(kind: WorkKind, machine: &mut DeploymentMachine) -> Result<(), AgentError> {
    match kind {
        WorkKind::Authentication => machine.run_authentication().await,
        WorkKind::Update => machine.run_update_check().await,
        #[cfg(feature = "inventory")]
        WorkKind::Inventory => machine.run_inventory_publish(Vec::<InventoryAttribute>::new()).await,
    }
}
