//! Reset/recovery after an invalidated credential.
//!
//! Teardown order: stop the cycle and clear the credential (one step), tell
//! the UI the node lost its credential, purge the node's storage partition,
//! reload its display. Every step after the first is best-effort: a failure
//! is logged and the remaining steps still run. A reset never re-enters
//! itself.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::collaborator::{Collaborator, CollaboratorError};
use crate::logging::Subsystem;
use crate::registry::{AutomationState, NodeEntry};

/// Upper bound for each collaborator request during a reset.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// What started the reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTrigger {
    /// A cycle of session `epoch` saw the credential of `generation`
    /// rejected.
    AuthFailure { epoch: u64, generation: u64 },
    /// An operator asked for a fresh login.
    Operator,
}

/// Which reset steps completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetReport {
    /// Credential cleared and cycle stopped by this reset.
    pub torn_down: bool,
    /// The rejected credential had already been replaced; nothing was done.
    pub superseded: bool,
    pub status_emitted: bool,
    pub storage_purged: bool,
    pub display_reloaded: bool,
}

/// Runs resets against the UI collaborator.
#[derive(Clone)]
pub struct ResetController {
    collaborator: Arc<dyn Collaborator>,
}

impl ResetController {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self { collaborator }
    }

    /// Reset one node.
    ///
    /// An [`ResetTrigger::AuthFailure`] whose epoch is no longer current is
    /// ignored: the session it belongs to already ended (logout, version
    /// change or a newer login) and must not be torn down again. One whose
    /// credential was refreshed after the rejected request is ignored too,
    /// and reported as superseded.
    pub async fn reset(&self, entry: &NodeEntry, trigger: ResetTrigger) -> ResetReport {
        let node = entry.node();
        let subsystem = Subsystem::Node(node.id);
        let mut report = ResetReport::default();

        let epoch = {
            let mut runtime = entry.runtime().lock().await;
            if let ResetTrigger::AuthFailure { epoch, generation } = trigger {
                if runtime.epoch() != epoch {
                    info!(subsystem = %subsystem, "Session already ended, skipping reset");
                    return report;
                }
                if runtime.generation() != generation {
                    info!(subsystem = %subsystem, "Credential refreshed since the rejected request, skipping reset");
                    report.superseded = true;
                    return report;
                }
            }
            // The cancelled task is the caller itself on an auth failure; it
            // must not be awaited here.
            let (_task, had_session) = runtime.end_session(AutomationState::Resetting);
            report.torn_down = had_session;
            runtime.epoch()
        };

        warn!(subsystem = %subsystem, trigger = ?trigger, "Resetting node session");

        report.status_emitted = step(
            "status update",
            &subsystem,
            self.collaborator.node_status_changed(node, false),
        )
        .await;
        report.storage_purged = step(
            "storage purge",
            &subsystem,
            self.collaborator.purge_session_storage(node),
        )
        .await;
        report.display_reloaded = step(
            "display reload",
            &subsystem,
            self.collaborator.reload_display(node),
        )
        .await;

        let finished = entry.runtime().lock().await.finish_reset(epoch);
        if finished {
            info!(subsystem = %subsystem, "Reset complete, waiting for a new login");
        }
        report
    }
}

async fn step<F>(label: &str, subsystem: &Subsystem, request: F) -> bool
where
    F: Future<Output = Result<(), CollaboratorError>>,
{
    match tokio::time::timeout(STEP_TIMEOUT, request).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(subsystem = %subsystem, error = %e, "Reset {label} failed");
            false
        }
        Err(_) => {
            warn!(subsystem = %subsystem, "Reset {label} timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use fluxwarden_events::OutboundEvent;

    use super::*;
    use crate::collaborator::RecordingCollaborator;
    use crate::registry::tests::test_node;
    use crate::registry::NodeRegistry;
    use crate::vault::StoredCredential;

    /// An authenticated entry and the trigger a rejection of its current
    /// credential would raise.
    async fn authenticated_entry() -> (Arc<NodeEntry>, ResetTrigger) {
        let registry = NodeRegistry::from_nodes(vec![test_node(0, 2)]);
        let entry = registry.entries()[0].clone();
        let trigger = {
            let mut runtime = entry.runtime().lock().await;
            runtime.set_credential(StoredCredential::Plain(b"tok".to_vec()));
            ResetTrigger::AuthFailure {
                epoch: runtime.next_epoch(),
                generation: runtime.generation(),
            }
        };
        (entry, trigger)
    }

    #[tokio::test]
    async fn test_auth_failure_reset_runs_all_steps() {
        let collaborator = Arc::new(RecordingCollaborator::new());
        let controller = ResetController::new(collaborator.clone());
        let (entry, trigger) = authenticated_entry().await;

        let report = controller.reset(&entry, trigger).await;
        assert_eq!(
            report,
            ResetReport {
                torn_down: true,
                superseded: false,
                status_emitted: true,
                storage_purged: true,
                display_reloaded: true,
            }
        );

        let runtime = entry.runtime().lock().await;
        assert_eq!(runtime.state(), AutomationState::Unauthenticated);
        assert!(!runtime.has_credential());

        let types: Vec<&str> = collaborator
            .events()
            .iter()
            .map(OutboundEvent::event_type)
            .collect();
        assert_eq!(
            types,
            vec!["node_status_changed", "purge_session_storage", "reload_display"]
        );
    }

    #[tokio::test]
    async fn test_stale_epoch_is_ignored() {
        let collaborator = Arc::new(RecordingCollaborator::new());
        let controller = ResetController::new(collaborator.clone());
        let (entry, trigger) = authenticated_entry().await;
        entry.runtime().lock().await.next_epoch();

        let report = controller.reset(&entry, trigger).await;
        assert_eq!(report, ResetReport::default());
        assert!(entry.runtime().lock().await.has_credential());
        assert!(collaborator.events().is_empty());
    }

    #[tokio::test]
    async fn test_refreshed_credential_is_not_reset() {
        let collaborator = Arc::new(RecordingCollaborator::new());
        let controller = ResetController::new(collaborator.clone());
        let (entry, trigger) = authenticated_entry().await;
        entry
            .runtime()
            .lock()
            .await
            .set_credential(StoredCredential::Plain(b"fresh".to_vec()));

        let report = controller.reset(&entry, trigger).await;
        assert!(report.superseded);
        assert!(!report.torn_down);

        let runtime = entry.runtime().lock().await;
        assert_eq!(
            runtime.credential(),
            Some(&StoredCredential::Plain(b"fresh".to_vec()))
        );
        assert!(collaborator.events().is_empty());
    }

    #[tokio::test]
    async fn test_purge_failure_does_not_block_reload() {
        let collaborator = Arc::new(RecordingCollaborator::failing_purge());
        let controller = ResetController::new(collaborator.clone());
        let (entry, _) = authenticated_entry().await;

        let report = controller.reset(&entry, ResetTrigger::Operator).await;
        assert!(report.status_emitted);
        assert!(!report.storage_purged);
        assert!(report.display_reloaded);
        assert_eq!(
            entry.runtime().lock().await.state(),
            AutomationState::Unauthenticated
        );
    }

    #[tokio::test]
    async fn test_operator_reset_without_session() {
        let collaborator = Arc::new(RecordingCollaborator::new());
        let controller = ResetController::new(collaborator.clone());
        let registry = NodeRegistry::from_nodes(vec![test_node(0, 0)]);

        let report = controller
            .reset(&registry.entries()[0], ResetTrigger::Operator)
            .await;
        assert!(!report.torn_down);
        assert!(report.display_reloaded);
    }
}
