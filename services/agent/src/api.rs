//! Control-plane workload API abstraction.
//!
//! The automation cycle talks to a node through [`WorkloadApi`]. The HTTP
//! implementation lives in [`crate::client`]; [`MockWorkloadApi`] is used by
//! tests and for dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fluxwarden_id::NodeId;
use serde::Deserialize;

use crate::policy::strip_separator;
use crate::registry::Node;

/// One entry of the running-workloads listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct RunningWorkload {
    /// Reported names; the first is the canonical one.
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
}

impl RunningWorkload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
        }
    }

    /// First reported name, if any.
    pub fn primary_name(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    /// First reported name without its leading separator.
    pub fn display_name(&self) -> Option<&str> {
        self.primary_name().map(strip_separator)
    }
}

/// Why a listing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFailure {
    /// Connection refused, timeout, DNS.
    Transport(String),
    /// Non-success HTTP status.
    Status(u16),
    /// Response did not carry a success envelope.
    Envelope(String),
}

impl std::fmt::Display for ListFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListFailure::Transport(e) => write!(f, "transport error: {e}"),
            ListFailure::Status(code) => write!(f, "HTTP {code}"),
            ListFailure::Envelope(e) => write!(f, "unexpected response: {e}"),
        }
    }
}

/// Result of listing running workloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListResult {
    Success(Vec<RunningWorkload>),
    Failure(ListFailure),
}

impl ListResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ListResult::Success(_))
    }

    pub fn into_workloads(self) -> Option<Vec<RunningWorkload>> {
        match self {
            ListResult::Success(workloads) => Some(workloads),
            ListResult::Failure(_) => None,
        }
    }
}

/// Result of one removal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The control plane accepted the removal.
    Removed {
        /// Last status message of a streamed response, if any.
        final_status: Option<String>,
    },
    /// The control plane rejected the credential (401/403 or an
    /// unauthorized envelope).
    AuthRejected { reason: String },
    /// Any other failure.
    Failed { reason: String },
}

impl RemoveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RemoveOutcome::Removed { .. })
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, RemoveOutcome::AuthRejected { .. })
    }
}

/// Operations the automation cycle needs from a node's control plane.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// List running workloads. Never fails outright; failures are carried
    /// in the result.
    async fn list_running(&self, node: &Node) -> ListResult;

    /// Remove a workload by its primary name. `None` credential is reported
    /// as an auth error without contacting the node.
    async fn remove_workload(
        &self,
        node: &Node,
        name: &str,
        credential: Option<&str>,
    ) -> RemoveOutcome;
}

// =============================================================================
// Mock
// =============================================================================

/// A call observed by [`MockWorkloadApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    List {
        node_id: NodeId,
    },
    Remove {
        node_id: NodeId,
        name: String,
        had_credential: bool,
    },
}

#[derive(Debug, Default)]
struct MockState {
    listings: HashMap<NodeId, ListResult>,
    removals: HashMap<String, RemoveOutcome>,
    calls: Vec<ApiCall>,
}

/// In-memory workload API.
///
/// Listings default to an empty success; removals default to success.
#[derive(Debug, Default)]
pub struct MockWorkloadApi {
    state: Mutex<MockState>,
    list_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockWorkloadApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every listing for `delay` before answering.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = Some(delay);
        self
    }

    /// Answer listings for `node_id` with the given names.
    pub fn set_running(&self, node_id: NodeId, names: &[&str]) {
        let workloads = names.iter().map(|n| RunningWorkload::new(*n)).collect();
        self.lock()
            .listings
            .insert(node_id, ListResult::Success(workloads));
    }

    pub fn set_listing(&self, node_id: NodeId, result: ListResult) {
        self.lock().listings.insert(node_id, result);
    }

    /// Answer removals of `name` with `outcome`.
    pub fn set_removal(&self, name: &str, outcome: RemoveOutcome) {
        self.lock().removals.insert(name.to_string(), outcome);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.lock().calls.clone()
    }

    pub fn list_calls(&self, node_id: NodeId) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, ApiCall::List { node_id: id } if *id == node_id))
            .count()
    }

    /// Names removed (or attempted) on `node_id`, in order.
    pub fn removals(&self, node_id: NodeId) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                ApiCall::Remove { node_id: id, name, .. } if *id == node_id => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of listings observed running at once.
    pub fn max_concurrent_lists(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WorkloadApi for MockWorkloadApi {
    async fn list_running(&self, node: &Node) -> ListResult {
        self.lock().calls.push(ApiCall::List { node_id: node.id });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.lock()
            .listings
            .get(&node.id)
            .cloned()
            .unwrap_or(ListResult::Success(Vec::new()))
    }

    async fn remove_workload(
        &self,
        node: &Node,
        name: &str,
        credential: Option<&str>,
    ) -> RemoveOutcome {
        let mut state = self.lock();
        state.calls.push(ApiCall::Remove {
            node_id: node.id,
            name: name.to_string(),
            had_credential: credential.is_some(),
        });

        if credential.is_none() {
            return RemoveOutcome::AuthRejected {
                reason: "no credential held".to_string(),
            };
        }
        state
            .removals
            .get(name)
            .cloned()
            .unwrap_or(RemoveOutcome::Removed { final_status: None })
    }
}
