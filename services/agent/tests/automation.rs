//! Integration tests for the automation scheduler lifecycle.
//!
//! Uses MockWorkloadApi and RecordingCollaborator with short real timings.

use std::sync::Arc;
use std::time::Duration;

use fluxwarden_agent::api::{
    ListResult, MockWorkloadApi, RemoveOutcome, RunningWorkload, WorkloadApi,
};
use fluxwarden_agent::registry::Node;
use fluxwarden_agent::scheduler::{CycleOutcome, Transition};
use fluxwarden_agent::{
    AutomationScheduler, AutomationState, CredentialVault, NodeRegistry, PolicyMatcher,
    RecordingCollaborator, SchedulerConfig, SchedulerContext,
};
use fluxwarden_events::{InboundEvent, OutboundEvent, Token};
use fluxwarden_id::{HostLabel, NodeId, SlotIndex};
use fluxwarden_sealing::AesGcmStore;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

const SETTLE: Duration = Duration::from_millis(100);

struct Harness {
    scheduler: AutomationScheduler,
    api: Arc<MockWorkloadApi>,
    collaborator: Arc<RecordingCollaborator>,
    id: NodeId,
}

fn node(slot: u8) -> Node {
    let slot = SlotIndex::new(slot).unwrap();
    let ui_port = 16126 + 10 * u16::from(slot.index());
    Node::new(
        HostLabel::from_position(0),
        "10.0.0.5",
        slot,
        format!("http://10.0.0.5:{ui_port}"),
        format!("http://10.0.0.5:{}", ui_port + 1),
    )
}

fn harness_with(api: MockWorkloadApi, interval: Duration) -> Harness {
    let node = node(2);
    let id = node.id;
    let registry = Arc::new(NodeRegistry::from_nodes(vec![node]));
    let vault = Arc::new(CredentialVault::new(
        registry.clone(),
        Arc::new(AesGcmStore::ephemeral().unwrap()),
    ));
    let api = Arc::new(api);
    let collaborator = Arc::new(RecordingCollaborator::new());

    let scheduler = AutomationScheduler::new(
        SchedulerContext {
            registry,
            vault,
            api: api.clone(),
            policy: PolicyMatcher::new(["foo"]),
            collaborator: collaborator.clone(),
        },
        SchedulerConfig {
            settle_delay: SETTLE,
            interval,
            debug: false,
        },
    );

    Harness {
        scheduler,
        api,
        collaborator,
        id,
    }
}

fn harness() -> Harness {
    harness_with(MockWorkloadApi::new(), Duration::from_secs(3600))
}

fn status_events(events: &[OutboundEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::NodeStatusChanged { has_credential, .. } => Some(*has_credential),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_settle_delay_then_single_cycle() {
    let h = harness();
    h.api.set_running(h.id, &["/foo_MyApp"]);

    let transition = h
        .scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();
    assert_eq!(transition, Transition::Scheduled);
    assert_eq!(h.scheduler.state(h.id).await, Some(AutomationState::Scheduled));

    sleep(SETTLE / 2).await;
    assert_eq!(h.api.list_calls(h.id), 0);

    sleep(SETTLE * 2).await;
    assert_eq!(h.scheduler.state(h.id).await, Some(AutomationState::Active));
    assert_eq!(h.api.list_calls(h.id), 1);
    assert_eq!(h.api.removals(h.id), vec!["MyApp"]);
    assert_eq!(status_events(&h.collaborator.events()), vec![true]);
}

#[tokio::test]
async fn test_recurring_cycles_follow_interval() {
    let h = harness_with(MockWorkloadApi::new(), Duration::from_millis(150));
    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();

    sleep(SETTLE + Duration::from_millis(400)).await;
    let calls = h.api.list_calls(h.id);
    assert!((2..=5).contains(&calls), "unexpected cycle count {calls}");
}

#[tokio::test]
async fn test_duplicate_login_keeps_one_timer() {
    let h = harness_with(MockWorkloadApi::new(), Duration::from_millis(200));
    let first = h
        .scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();
    let second = h
        .scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();
    assert_eq!(first, Transition::Scheduled);
    assert_eq!(second, Transition::CredentialUpdated);

    sleep(SETTLE + Duration::from_millis(100)).await;
    assert_eq!(h.api.list_calls(h.id), 1);
}

#[tokio::test]
async fn test_logout_before_settle_cancels_cycle() {
    let h = harness();
    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();
    assert_eq!(
        h.scheduler.credential_lost(h.id).await.unwrap(),
        Transition::Stopped
    );

    sleep(SETTLE * 3).await;
    assert_eq!(h.api.list_calls(h.id), 0);
    assert_eq!(
        h.scheduler.state(h.id).await,
        Some(AutomationState::Unauthenticated)
    );
    assert_eq!(status_events(&h.collaborator.events()), vec![true, false]);
}

#[tokio::test]
async fn test_logout_during_cycle_does_not_remove_or_reset() {
    let h = harness_with(
        MockWorkloadApi::new().with_list_delay(Duration::from_millis(300)),
        Duration::from_secs(3600),
    );
    h.api.set_running(h.id, &["/foo_MyApp"]);
    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();

    sleep(SETTLE + Duration::from_millis(100)).await;
    assert_eq!(h.api.list_calls(h.id), 1);
    h.scheduler.credential_lost(h.id).await.unwrap();

    sleep(Duration::from_millis(400)).await;
    assert!(h.api.removals(h.id).is_empty());
    let events = h.collaborator.events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, OutboundEvent::PurgeSessionStorage { .. })));
    assert_eq!(
        h.scheduler.state(h.id).await,
        Some(AutomationState::Unauthenticated)
    );
}

#[tokio::test]
async fn test_auth_failure_resets_and_stops() {
    let h = harness_with(MockWorkloadApi::new(), Duration::from_millis(100));
    h.api.set_running(h.id, &["/foo_MyApp", "/foo_Other"]);
    h.api.set_removal(
        "MyApp",
        RemoveOutcome::AuthRejected {
            reason: "HTTP 401".to_string(),
        },
    );

    h.scheduler
        .credential_acquired(h.id, &Token::new("expired"))
        .await
        .unwrap();
    sleep(SETTLE + Duration::from_millis(400)).await;

    assert_eq!(h.api.list_calls(h.id), 1);
    assert_eq!(h.api.removals(h.id), vec!["MyApp"]);
    assert_eq!(
        h.scheduler.state(h.id).await,
        Some(AutomationState::Unauthenticated)
    );

    let types: Vec<&str> = h
        .collaborator
        .events()
        .iter()
        .map(OutboundEvent::event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            "node_status_changed",
            "node_status_changed",
            "purge_session_storage",
            "reload_display",
        ]
    );

    // A fresh login starts over.
    h.api.set_removal("MyApp", RemoveOutcome::Removed { final_status: None });
    assert_eq!(
        h.scheduler
            .credential_acquired(h.id, &Token::new("fresh"))
            .await
            .unwrap(),
        Transition::Scheduled
    );
}

#[tokio::test]
async fn test_non_auth_failure_continues_with_remaining_targets() {
    let h = harness();
    h.api.set_running(h.id, &["/foo_A", "/foo_B"]);
    h.api.set_removal(
        "A",
        RemoveOutcome::Failed {
            reason: "HTTP 500".to_string(),
        },
    );
    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();

    let outcome = h.scheduler.cycle_once(h.id).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            listed: 2,
            targets: 2,
            removed: 1,
            failed: 1,
        }
    );
    assert_eq!(h.api.removals(h.id), vec!["A", "B"]);
    assert!(h.scheduler.registry().get(&h.id).is_some());
}

#[tokio::test]
async fn test_list_failure_is_not_a_fault() {
    let h = harness();
    h.api.set_listing(
        h.id,
        ListResult::Failure(fluxwarden_agent::api::ListFailure::Transport(
            "connection refused".to_string(),
        )),
    );
    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();

    assert_eq!(
        h.scheduler.cycle_once(h.id).await.unwrap(),
        CycleOutcome::ListUnavailable
    );
    assert_eq!(h.scheduler.state(h.id).await, Some(AutomationState::Scheduled));
}

#[tokio::test]
async fn test_cycles_never_overlap() {
    let h = harness_with(
        MockWorkloadApi::new().with_list_delay(Duration::from_millis(150)),
        Duration::from_millis(20),
    );
    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();
    sleep(SETTLE + Duration::from_millis(50)).await;

    let (a, b) = tokio::join!(h.scheduler.cycle_once(h.id), h.scheduler.cycle_once(h.id));
    assert!(a.is_ok() && b.is_ok());
    sleep(Duration::from_millis(200)).await;

    assert!(h.api.list_calls(h.id) >= 3);
    assert_eq!(h.api.max_concurrent_lists(), 1);
}

#[tokio::test]
async fn test_version_change_drops_session() {
    let h = harness();
    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();

    let transition = h
        .scheduler
        .handle_event(InboundEvent::ControlPlaneVersionChanged {
            node_id: h.id,
            old_version: "5.1.0".to_string(),
            new_version: "5.2.0".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(transition, Transition::Stopped);
    assert_eq!(
        h.scheduler.state(h.id).await,
        Some(AutomationState::Unauthenticated)
    );

    sleep(SETTLE * 2).await;
    assert_eq!(h.api.list_calls(h.id), 0);
}

#[tokio::test]
async fn test_force_refresh_purges_storage() {
    let h = harness();
    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();

    let transition = h
        .scheduler
        .handle_event(InboundEvent::ForceRefresh { node_id: h.id })
        .await
        .unwrap();
    assert_eq!(transition, Transition::Stopped);

    let events = h.collaborator.events();
    assert!(events.contains(&OutboundEvent::PurgeSessionStorage {
        node_id: h.id,
        partition: "persist:IP01-node03".to_string(),
    }));
    assert_eq!(
        h.scheduler.state(h.id).await,
        Some(AutomationState::Unauthenticated)
    );
}

#[tokio::test]
async fn test_run_consumes_events_and_shuts_down() {
    let h = harness();
    let (tx, rx) = mpsc::channel(4);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = h.scheduler.clone();
    let run = tokio::spawn(async move { scheduler.run(rx, shutdown_rx).await });

    tx.send(InboundEvent::CredentialAcquired {
        node_id: h.id,
        token: Token::new("tok"),
    })
    .await
    .unwrap();
    tx.send(InboundEvent::CredentialLost {
        node_id: "IP09-node01".parse().unwrap(),
    })
    .await
    .unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(h.scheduler.state(h.id).await, Some(AutomationState::Scheduled));

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        h.scheduler.state(h.id).await,
        Some(AutomationState::Unauthenticated)
    );
}

#[tokio::test]
async fn test_shutdown_signal_stops_automation() {
    let h = harness_with(MockWorkloadApi::new(), Duration::from_millis(50));
    let (_tx, rx) = mpsc::channel::<InboundEvent>(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    h.scheduler
        .credential_acquired(h.id, &Token::new("tok"))
        .await
        .unwrap();
    let scheduler = h.scheduler.clone();
    let run = tokio::spawn(async move { scheduler.run(rx, shutdown_rx).await });

    sleep(SETTLE + Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();

    let calls = h.api.list_calls(h.id);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(h.api.list_calls(h.id), calls);
}

/// Control plane that rejects the first credential it sees and, while that
/// request is in flight, has a fresh login land in the vault.
struct RefreshDuringRemoval {
    vault: Arc<CredentialVault>,
    removals: std::sync::Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait::async_trait]
impl WorkloadApi for RefreshDuringRemoval {
    async fn list_running(&self, _node: &Node) -> ListResult {
        ListResult::Success(vec![
            RunningWorkload::new("/foo_A"),
            RunningWorkload::new("/foo_B"),
        ])
    }

    async fn remove_workload(
        &self,
        node: &Node,
        name: &str,
        credential: Option<&str>,
    ) -> RemoveOutcome {
        self.removals
            .lock()
            .unwrap()
            .push((name.to_string(), credential.map(str::to_string)));
        if credential == Some("old") {
            self.vault.store(node.id, &Token::new("new")).await.unwrap();
            return RemoveOutcome::AuthRejected {
                reason: "HTTP 401".to_string(),
            };
        }
        RemoveOutcome::Removed { final_status: None }
    }
}

#[tokio::test]
async fn test_rejection_of_replaced_credential_keeps_new_one() {
    let node = node(2);
    let id = node.id;
    let registry = Arc::new(NodeRegistry::from_nodes(vec![node]));
    let vault = Arc::new(CredentialVault::new(
        registry.clone(),
        Arc::new(AesGcmStore::ephemeral().unwrap()),
    ));
    let api = Arc::new(RefreshDuringRemoval {
        vault: vault.clone(),
        removals: std::sync::Mutex::default(),
    });
    let collaborator = Arc::new(RecordingCollaborator::new());
    let scheduler = AutomationScheduler::new(
        SchedulerContext {
            registry,
            vault: vault.clone(),
            api: api.clone(),
            policy: PolicyMatcher::new(["foo"]),
            collaborator: collaborator.clone(),
        },
        SchedulerConfig {
            settle_delay: Duration::from_secs(3600),
            interval: Duration::from_secs(3600),
            debug: false,
        },
    );

    scheduler
        .credential_acquired(id, &Token::new("old"))
        .await
        .unwrap();
    let outcome = scheduler.cycle_once(id).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            listed: 2,
            targets: 2,
            removed: 1,
            failed: 1,
        }
    );

    assert_eq!(
        api.removals.lock().unwrap().clone(),
        vec![
            ("A".to_string(), Some("old".to_string())),
            ("B".to_string(), Some("new".to_string())),
        ]
    );
    assert_eq!(vault.retrieve(id).await.unwrap().as_deref(), Some("new"));
    assert_eq!(scheduler.state(id).await, Some(AutomationState::Scheduled));
    assert_eq!(status_events(&collaborator.events()), vec![true]);
    assert_eq!(collaborator.events().len(), 1, "no reset requests");

    scheduler.shutdown().await;
}
