//! Node registry.
//!
//! The registry is built once from discovery output and never resized. Each
//! entry pairs the immutable [`Node`] description with its mutable
//! [`NodeRuntime`] (automation state, sealed credential, cycle handle).
//!
//! Invariant: a cycle handle exists only while a credential is held. The
//! only ways to drop the credential ([`NodeRuntime::end_session`]) also
//! cancel the cycle in the same critical section.

use std::collections::HashMap;
use std::sync::Arc;

use fluxwarden_events::NodeSummary;
use fluxwarden_id::{HostLabel, NodeId, SlotIndex};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::vault::StoredCredential;

/// One discovered control-plane endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Host as configured.
    pub host: String,
    pub ui_url: String,
    pub api_url: String,
}

impl Node {
    /// Build a node for a live slot.
    pub fn new(
        label: HostLabel,
        host: &str,
        slot: SlotIndex,
        ui_url: String,
        api_url: String,
    ) -> Self {
        let id = NodeId::new(label, slot);
        Self {
            id,
            name: id.display_name(),
            host: host.to_string(),
            ui_url,
            api_url,
        }
    }

    /// Isolated browser storage partition of this node.
    pub fn partition(&self) -> String {
        self.id.partition()
    }

    pub fn summary(&self, has_credential: bool) -> NodeSummary {
        NodeSummary {
            id: self.id,
            name: self.name.clone(),
            ui_url: self.ui_url.clone(),
            api_url: self.api_url.clone(),
            partition: self.partition(),
            has_credential,
        }
    }
}

/// Per-node automation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutomationState {
    /// No credential, no cycle.
    #[default]
    Unauthenticated,
    /// Credential held, first cycle waiting for the settle delay.
    Scheduled,
    /// Recurring cycle armed.
    Active,
    /// Tearing down after an authorization failure or operator refresh.
    Resetting,
}

impl std::fmt::Display for AutomationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutomationState::Unauthenticated => write!(f, "unauthenticated"),
            AutomationState::Scheduled => write!(f, "scheduled"),
            AutomationState::Active => write!(f, "active"),
            AutomationState::Resetting => write!(f, "resetting"),
        }
    }
}

/// Handle to a node's automation task.
#[derive(Debug)]
pub struct CycleHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CycleHandle {
    pub fn new(cancel: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Signal cancellation. A cycle already executing finishes; the task
    /// exits before arming another tick.
    pub fn cancel(self) -> JoinHandle<()> {
        let _ = self.cancel.send(true);
        self.task
    }
}

/// Mutable runtime state of one node.
#[derive(Debug, Default)]
pub struct NodeRuntime {
    state: AutomationState,
    credential: Option<StoredCredential>,
    cycle: Option<CycleHandle>,
    /// Bumped on every session start and end; automation tasks compare it
    /// to the value they were started with before mutating anything.
    epoch: u64,
    /// Bumped on every stored credential, including refreshes within a
    /// session.
    generation: u64,
}

impl NodeRuntime {
    pub fn state(&self) -> AutomationState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn has_cycle(&self) -> bool {
        self.cycle.is_some()
    }

    pub fn credential(&self) -> Option<&StoredCredential> {
        self.credential.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the held credential without touching the cycle.
    pub(crate) fn set_credential(&mut self, credential: StoredCredential) {
        self.credential = Some(credential);
        self.generation += 1;
    }

    /// Start a new session epoch and return it. The caller arms the cycle
    /// for this epoch with [`NodeRuntime::arm`].
    pub(crate) fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Attach the cycle handle for the current epoch and enter `Scheduled`.
    pub(crate) fn arm(&mut self, handle: CycleHandle) {
        debug_assert!(self.credential.is_some(), "cycle armed without credential");
        if let Some(previous) = self.cycle.replace(handle) {
            previous.cancel();
        }
        self.state = AutomationState::Scheduled;
    }

    /// `Scheduled` → `Active` if the epoch is still current.
    pub(crate) fn activate(&mut self, epoch: u64) -> bool {
        if self.epoch == epoch && self.state == AutomationState::Scheduled {
            self.state = AutomationState::Active;
            true
        } else {
            false
        }
    }

    /// Cancel the cycle and clear the credential as one step, moving to
    /// `next`. Returns the cancelled task (if any) and whether a session was
    /// held.
    pub(crate) fn end_session(&mut self, next: AutomationState) -> (Option<JoinHandle<()>>, bool) {
        let task = self.cycle.take().map(CycleHandle::cancel);
        let had_session = self.credential.take().is_some() || task.is_some();
        self.epoch += 1;
        self.state = next;
        (task, had_session)
    }

    /// `Resetting` → `Unauthenticated` if nothing happened since the reset began.
    pub(crate) fn finish_reset(&mut self, epoch: u64) -> bool {
        if self.epoch == epoch && self.state == AutomationState::Resetting {
            self.state = AutomationState::Unauthenticated;
            true
        } else {
            false
        }
    }
}

/// A node and its runtime state.
#[derive(Debug)]
pub struct NodeEntry {
    node: Node,
    runtime: Mutex<NodeRuntime>,
    /// Held for the duration of one cycle.
    cycle_gate: Mutex<()>,
}

impl NodeEntry {
    fn new(node: Node) -> Self {
        Self {
            node,
            runtime: Mutex::new(NodeRuntime::default()),
            cycle_gate: Mutex::new(()),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn runtime(&self) -> &Mutex<NodeRuntime> {
        &self.runtime
    }

    pub fn cycle_gate(&self) -> &Mutex<()> {
        &self.cycle_gate
    }
}

/// Authoritative set of discovered nodes.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    entries: Vec<Arc<NodeEntry>>,
    index: HashMap<NodeId, usize>,
}

impl NodeRegistry {
    /// Build the registry from discovery output, keeping its order. A
    /// repeated ID keeps its first occurrence.
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        let mut entries = Vec::with_capacity(nodes.len());
        let mut index = HashMap::with_capacity(nodes.len());

        for node in nodes {
            if index.contains_key(&node.id) {
                continue;
            }
            index.insert(node.id, entries.len());
            entries.push(Arc::new(NodeEntry::new(node)));
        }

        Self { entries, index }
    }

    pub fn get(&self, id: &NodeId) -> Option<&Arc<NodeEntry>> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Entries in discovery order.
    pub fn entries(&self) -> &[Arc<NodeEntry>] {
        &self.entries
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.entries.iter().map(|e| e.node())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current node table for the UI collaborator.
    pub async fn snapshot(&self) -> Vec<NodeSummary> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let has_credential = entry.runtime().lock().await.has_credential();
            out.push(entry.node().summary(has_credential));
        }
        out
    }
}
