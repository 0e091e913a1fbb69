//! Network discovery of control-plane nodes.
//!
//! Every configured host is probed on [`SlotIndex::COUNT`] fixed port slots.
//! Slot `i` exposes its UI on `BASE_UI_PORT + 10*i` and its API one port
//! above. A slot is live when its API answers with any HTTP response at
//! all (401 included); only transport errors and timeouts mean absence.
//!
//! Hosts and slots are probed concurrently; the result is ordered by host
//! (input order) then slot.

use std::time::Duration;

use async_trait::async_trait;
use fluxwarden_id::{HostLabel, SlotIndex};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::client::LIST_RUNNING_PATH;
use crate::logging::Subsystem;
use crate::registry::Node;

/// UI port of slot 0.
pub const BASE_UI_PORT: u16 = 16126;

/// Port distance between consecutive slots.
pub const SLOT_STRIDE: u16 = 10;

/// UI and API ports of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPorts {
    pub ui: u16,
    pub api: u16,
}

/// Ports of `slot` relative to `base_port`. `None` if they overflow.
pub fn slot_ports(base_port: u16, slot: SlotIndex) -> Option<SlotPorts> {
    let ui = base_port.checked_add(SLOT_STRIDE * u16::from(slot.index()))?;
    let api = ui.checked_add(1)?;
    Some(SlotPorts { ui, api })
}

/// One slot to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSlot {
    pub slot: SlotIndex,
    pub ui_url: String,
    pub api_url: String,
}

/// All candidate slots of `host`.
pub fn candidate_slots(host: &str, base_port: u16) -> Vec<CandidateSlot> {
    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };

    SlotIndex::all()
        .filter_map(|slot| {
            let ports = slot_ports(base_port, slot)?;
            Some(CandidateSlot {
                slot,
                ui_url: format!("http://{authority}:{}", ports.ui),
                api_url: format!("http://{authority}:{}", ports.api),
            })
        })
        .collect()
}

/// Liveness check for one API endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    /// True if anything answered at `api_url`.
    async fn probe(&self, api_url: &str) -> bool;
}

/// Probes by issuing the public listing request.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, api_url: &str) -> bool {
        let url = format!("{api_url}{LIST_RUNNING_PATH}");
        match self.client.get(&url).send().await {
            Ok(response) => {
                debug!(
                    subsystem = %Subsystem::Discovery,
                    url = %url,
                    status = %response.status(),
                    "Probe answered"
                );
                true
            }
            Err(e) => {
                debug!(subsystem = %Subsystem::Discovery, url = %url, error = %e, "Probe failed");
                false
            }
        }
    }
}

/// Discovery settings.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryConfig {
    /// UI port of slot 0.
    pub base_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_port: BASE_UI_PORT,
        }
    }
}

/// Discovery scanner.
pub struct Discovery<P> {
    prober: P,
    config: DiscoveryConfig,
}

impl<P: Prober> Discovery<P> {
    pub fn new(prober: P, config: DiscoveryConfig) -> Self {
        Self { prober, config }
    }

    /// Probe every host and return the live nodes.
    pub async fn discover(&self, hosts: &[String]) -> Vec<Node> {
        info!(subsystem = %Subsystem::Discovery, hosts = ?hosts, "Starting node discovery");

        let per_host = join_all(hosts.iter().enumerate().map(|(position, host)| {
            let label = HostLabel::from_position(u16::try_from(position).unwrap_or(u16::MAX));
            self.scan_host(label, host)
        }))
        .await;

        let nodes: Vec<Node> = per_host.into_iter().flatten().collect();
        if nodes.is_empty() {
            warn!(subsystem = %Subsystem::Discovery, "Discovery complete, no active nodes found");
        } else {
            info!(
                subsystem = %Subsystem::Discovery,
                count = nodes.len(),
                "Discovery complete"
            );
        }
        nodes
    }

    async fn scan_host(&self, label: HostLabel, host: &str) -> Vec<Node> {
        let candidates = candidate_slots(host, self.config.base_port);
        let results = join_all(candidates.iter().map(|c| {
            debug!(subsystem = %Subsystem::Discovery, url = %c.api_url, "Checking for node");
            self.prober.probe(&c.api_url)
        }))
        .await;

        candidates
            .into_iter()
            .zip(results)
            .filter(|(_, live)| *live)
            .map(|(c, _)| {
                let node = Node::new(label, host, c.slot, c.ui_url, c.api_url);
                info!(
                    subsystem = %Subsystem::Discovery,
                    node = %node.name,
                    api_url = %node.api_url,
                    "Found active node"
                );
                node
            })
            .collect()
    }
}
