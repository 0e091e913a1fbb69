//! Per-node automation scheduler.
//!
//! The scheduler:
//! - Reacts to credential events from the login collaborator
//! - Runs one automation task per authenticated node (settle delay, then a
//!   recurring cycle at the configured interval)
//! - Hands nodes whose credential was rejected to the reset controller
//!
//! Every node task is started for one session epoch. Logout, version change,
//! reset and shutdown all end the epoch and signal the task's cancellation
//! channel in the same critical section that clears the credential, so a
//! cycle that is already running may finish but can never re-arm itself or
//! bring the credential back. A per-node gate keeps cycles for the same node
//! from overlapping.

use std::sync::Arc;
use std::time::Duration;

use fluxwarden_events::{InboundEvent, Token};
use fluxwarden_id::NodeId;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::{RemoveOutcome, RunningWorkload, WorkloadApi};
use crate::collaborator::Collaborator;
use crate::config::Config;
use crate::logging::Subsystem;
use crate::policy::PolicyMatcher;
use crate::registry::{AutomationState, CycleHandle, NodeEntry, NodeRegistry};
use crate::reset::{ResetController, ResetTrigger};
use crate::vault::{CredentialVault, VaultError};

/// Delay between a login and the first cycle.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// How long shutdown waits for node tasks to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Scheduler timing.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Delay before the first cycle of a session.
    pub settle_delay: Duration,

    /// Interval between cycles.
    pub interval: Duration,

    /// Log raw listings.
    pub debug: bool,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            interval: config.automation_interval,
            debug: config.debug,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("blank credential for node {0}")]
    BlankCredential(NodeId),

    #[error("node {0} has no credential")]
    NotAuthenticated(NodeId),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Effect of an event on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A new session started; the first cycle is pending.
    Scheduled,
    /// A session was already running; only the credential was replaced.
    CredentialUpdated,
    /// The event does not apply in the node's current state.
    Ignored,
    /// The session ended.
    Stopped,
    /// There was no session to end.
    AlreadyIdle,
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed {
        listed: usize,
        targets: usize,
        removed: usize,
        failed: usize,
    },
    /// The listing failed; nothing was removed.
    ListUnavailable,
    /// A removal was rejected for authorization; the node was reset.
    AuthRejected,
    /// The session ended while the cycle was running.
    Abandoned,
}

/// Collaborators the scheduler drives.
pub struct SchedulerContext {
    pub registry: Arc<NodeRegistry>,
    pub vault: Arc<CredentialVault>,
    pub api: Arc<dyn WorkloadApi>,
    pub policy: PolicyMatcher,
    pub collaborator: Arc<dyn Collaborator>,
}

struct Shared {
    registry: Arc<NodeRegistry>,
    vault: Arc<CredentialVault>,
    api: Arc<dyn WorkloadApi>,
    policy: PolicyMatcher,
    collaborator: Arc<dyn Collaborator>,
    reset: ResetController,
    config: SchedulerConfig,
}

/// Automation scheduler for every discovered node.
#[derive(Clone)]
pub struct AutomationScheduler {
    shared: Arc<Shared>,
}

impl AutomationScheduler {
    pub fn new(context: SchedulerContext, config: SchedulerConfig) -> Self {
        let reset = ResetController::new(context.collaborator.clone());
        Self {
            shared: Arc::new(Shared {
                registry: context.registry,
                vault: context.vault,
                api: context.api,
                policy: context.policy,
                collaborator: context.collaborator,
                reset,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.shared.registry
    }

    /// Current automation state of a node.
    pub async fn state(&self, node_id: NodeId) -> Option<AutomationState> {
        let entry = self.shared.registry.get(&node_id)?;
        let state = entry.runtime().lock().await.state();
        Some(state)
    }

    /// Apply one inbound event.
    pub async fn handle_event(&self, event: InboundEvent) -> Result<Transition, SchedulerError> {
        debug!(
            subsystem = %Subsystem::Node(event.node_id()),
            event_type = event.event_type(),
            "Handling event"
        );
        match event {
            InboundEvent::CredentialAcquired { node_id, token } => {
                self.credential_acquired(node_id, &token).await
            }
            InboundEvent::CredentialLost { node_id } => self.credential_lost(node_id).await,
            InboundEvent::ControlPlaneVersionChanged {
                node_id,
                old_version,
                new_version,
            } => {
                self.version_changed(node_id, &old_version, &new_version)
                    .await
            }
            InboundEvent::ForceRefresh { node_id } => self.force_refresh(node_id).await,
        }
    }

    /// A login completed for `node_id`.
    ///
    /// Starts a session if none is running. While a session is scheduled or
    /// active the credential is replaced without starting a second task.
    pub async fn credential_acquired(
        &self,
        node_id: NodeId,
        token: &Token,
    ) -> Result<Transition, SchedulerError> {
        if token.is_blank() {
            return Err(SchedulerError::BlankCredential(node_id));
        }
        let entry = self.entry(node_id)?;
        let subsystem = Subsystem::Node(node_id);

        let mut runtime = entry.runtime().lock().await;
        match runtime.state() {
            AutomationState::Resetting => {
                warn!(subsystem = %subsystem, "Login arrived during reset, ignoring");
                Ok(Transition::Ignored)
            }
            AutomationState::Scheduled | AutomationState::Active => {
                self.shared.vault.store_in(node_id, &mut runtime, token)?;
                info!(subsystem = %subsystem, "Credential refreshed, automation already running");
                Ok(Transition::CredentialUpdated)
            }
            AutomationState::Unauthenticated => {
                self.shared.vault.store_in(node_id, &mut runtime, token)?;
                let epoch = runtime.next_epoch();
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let task = tokio::spawn(drive_node(
                    self.shared.clone(),
                    entry.clone(),
                    epoch,
                    cancel_rx,
                ));
                runtime.arm(CycleHandle::new(cancel_tx, task));
                drop(runtime);

                info!(
                    subsystem = %subsystem,
                    settle_delay_secs = self.shared.config.settle_delay.as_secs(),
                    "Login captured, automation scheduled"
                );
                self.notify_status(&entry, true).await;
                Ok(Transition::Scheduled)
            }
        }
    }

    /// The login collaborator saw the credential disappear (logout).
    pub async fn credential_lost(&self, node_id: NodeId) -> Result<Transition, SchedulerError> {
        let transition = self.end_session(node_id).await?;
        if transition == Transition::Stopped {
            info!(subsystem = %Subsystem::Node(node_id), "Logged out, automation stopped");
        }
        Ok(transition)
    }

    /// The node's control-plane software changed, which invalidates sessions.
    pub async fn version_changed(
        &self,
        node_id: NodeId,
        old_version: &str,
        new_version: &str,
    ) -> Result<Transition, SchedulerError> {
        info!(
            subsystem = %Subsystem::Node(node_id),
            old_version,
            new_version,
            "Control-plane version changed, dropping session"
        );
        self.end_session(node_id).await
    }

    /// Wipe the node's session and re-present login, whatever its state.
    pub async fn force_refresh(&self, node_id: NodeId) -> Result<Transition, SchedulerError> {
        let entry = self.entry(node_id)?;
        info!(subsystem = %Subsystem::Node(node_id), "Operator requested a fresh login");
        let report = self
            .shared
            .reset
            .reset(&entry, ResetTrigger::Operator)
            .await;
        Ok(if report.torn_down {
            Transition::Stopped
        } else {
            Transition::AlreadyIdle
        })
    }

    /// Run one cycle for `node_id` now, outside the timer.
    pub async fn cycle_once(&self, node_id: NodeId) -> Result<CycleOutcome, SchedulerError> {
        let entry = self.entry(node_id)?;
        let epoch = {
            let runtime = entry.runtime().lock().await;
            if !runtime.has_credential() {
                return Err(SchedulerError::NotAuthenticated(node_id));
            }
            runtime.epoch()
        };
        Ok(self.shared.execute_cycle(&entry, epoch).await)
    }

    /// Consume inbound events until the channel closes or shutdown is
    /// signalled, then stop every node.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<InboundEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            subsystem = %Subsystem::Main,
            nodes = self.shared.registry.len(),
            interval_secs = self.shared.config.interval.as_secs(),
            "Automation scheduler started, waiting for logins"
        );

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!(subsystem = %Subsystem::Main, "Event channel closed");
                        break;
                    };
                    let node_id = event.node_id();
                    if let Err(e) = self.handle_event(event).await {
                        warn!(subsystem = %Subsystem::Node(node_id), error = %e, "Event rejected");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(subsystem = %Subsystem::Main, "Scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Cancel every node task and clear every credential.
    pub async fn shutdown(&self) {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for entry in self.shared.registry.entries() {
            let (task, _) = entry
                .runtime()
                .lock()
                .await
                .end_session(AutomationState::Unauthenticated);
            tasks.extend(task);
        }

        let count = tasks.len();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!(subsystem = %Subsystem::Main, "Node task did not stop in time");
            }
        }
        info!(subsystem = %Subsystem::Main, stopped = count, "Automation stopped");
    }

    fn entry(&self, node_id: NodeId) -> Result<Arc<NodeEntry>, SchedulerError> {
        self.shared
            .registry
            .get(&node_id)
            .cloned()
            .ok_or(SchedulerError::UnknownNode(node_id))
    }

    async fn end_session(&self, node_id: NodeId) -> Result<Transition, SchedulerError> {
        let entry = self.entry(node_id)?;
        let (_task, had_session) = entry
            .runtime()
            .lock()
            .await
            .end_session(AutomationState::Unauthenticated);

        if !had_session {
            return Ok(Transition::AlreadyIdle);
        }
        self.notify_status(&entry, false).await;
        Ok(Transition::Stopped)
    }

    async fn notify_status(&self, entry: &NodeEntry, has_credential: bool) {
        let node = entry.node();
        if let Err(e) = self
            .shared
            .collaborator
            .node_status_changed(node, has_credential)
            .await
        {
            warn!(subsystem = %Subsystem::Node(node.id), error = %e, "Status update failed");
        }
    }
}

impl Shared {
    /// One gated cycle: list, match, remove. Resets the node on an
    /// authorization failure.
    async fn execute_cycle(&self, entry: &NodeEntry, epoch: u64) -> CycleOutcome {
        let node = entry.node();
        let subsystem = Subsystem::Auto(node.id);

        let _gate = entry.cycle_gate().lock().await;
        info!(subsystem = %subsystem, "Cycle started");

        let workloads = match self.api.list_running(node).await.into_workloads() {
            Some(workloads) => workloads,
            None => {
                info!(subsystem = %subsystem, "No workload listing available, nothing to do");
                return CycleOutcome::ListUnavailable;
            }
        };

        if self.config.debug {
            debug!(subsystem = %subsystem, raw = ?workloads, "Raw workload listing");
        }
        let names: Vec<&str> = workloads
            .iter()
            .filter_map(|w| w.primary_name())
            .collect();
        let short_names: Vec<&str> = workloads
            .iter()
            .filter_map(RunningWorkload::display_name)
            .collect();
        info!(
            subsystem = %subsystem,
            count = names.len(),
            workloads = ?short_names,
            "Found running workloads"
        );

        let mut targets: Vec<String> = Vec::new();
        for record in self.policy.evaluate(&names) {
            if !record.is_target {
                continue;
            }
            let primary = record.primary_name();
            if primary.is_empty() {
                warn!(subsystem = %subsystem, workload = %record.name, "Target has no primary name, skipping");
                continue;
            }
            info!(
                subsystem = %subsystem,
                workload = %record.name,
                prefix = record.matched_prefix.as_deref().unwrap_or_default(),
                primary = primary,
                "Found target workload component"
            );
            if !targets.iter().any(|t| t == primary) {
                targets.push(primary.to_string());
            }
        }

        let mut removed = 0;
        let mut failed = 0;
        for primary in &targets {
            let (credential, generation) = {
                let runtime = entry.runtime().lock().await;
                if runtime.epoch() != epoch {
                    info!(subsystem = %subsystem, "Session ended during cycle, stopping");
                    return CycleOutcome::Abandoned;
                }
                let credential = runtime
                    .credential()
                    .and_then(|c| self.vault.open(node.id, c));
                (credential, runtime.generation())
            };

            info!(subsystem = %subsystem, workload = %primary, "Removing workload");
            match self
                .api
                .remove_workload(node, primary, credential.as_deref())
                .await
            {
                RemoveOutcome::Removed { final_status } => {
                    removed += 1;
                    info!(
                        subsystem = %subsystem,
                        workload = %primary,
                        status = final_status.as_deref().unwrap_or("done"),
                        "Workload removed"
                    );
                }
                RemoveOutcome::AuthRejected { reason } => {
                    error!(
                        subsystem = %subsystem,
                        workload = %primary,
                        reason = %reason,
                        "Authorization rejected"
                    );
                    let report = self
                        .reset
                        .reset(entry, ResetTrigger::AuthFailure { epoch, generation })
                        .await;
                    if report.superseded {
                        failed += 1;
                        warn!(
                            subsystem = %subsystem,
                            workload = %primary,
                            "Rejected credential was already replaced, continuing with the new one"
                        );
                        continue;
                    }
                    info!(subsystem = %subsystem, "Automation paused until the next login");
                    return CycleOutcome::AuthRejected;
                }
                RemoveOutcome::Failed { reason } => {
                    failed += 1;
                    error!(
                        subsystem = %subsystem,
                        workload = %primary,
                        reason = %reason,
                        "Workload removal failed"
                    );
                }
            }
        }

        info!(
            subsystem = %subsystem,
            targets = targets.len(),
            removed,
            failed,
            "Cycle finished"
        );
        CycleOutcome::Completed {
            listed: names.len(),
            targets: targets.len(),
            removed,
            failed,
        }
    }
}

/// Node task: settle, activate, then cycle on every tick until cancelled.
async fn drive_node(
    shared: Arc<Shared>,
    entry: Arc<NodeEntry>,
    epoch: u64,
    mut cancel: watch::Receiver<bool>,
) {
    let subsystem = Subsystem::Auto(entry.node().id);

    tokio::select! {
        _ = tokio::time::sleep(shared.config.settle_delay) => {}
        _ = cancelled(&mut cancel) => {
            debug!(subsystem = %subsystem, "Cancelled before first cycle");
            return;
        }
    }

    if !entry.runtime().lock().await.activate(epoch) {
        return;
    }

    let mut ticker = tokio::time::interval(shared.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            _ = ticker.tick() => {}
        }

        match shared.execute_cycle(&entry, epoch).await {
            CycleOutcome::AuthRejected | CycleOutcome::Abandoned => break,
            CycleOutcome::Completed { .. } | CycleOutcome::ListUnavailable => {}
        }

        if *cancel.borrow() {
            break;
        }
    }
    debug!(subsystem = %subsystem, "Automation task stopped");
}

/// Resolves once cancellation is signalled or the handle is dropped.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|c| *c).await;
}
