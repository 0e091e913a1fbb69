//! fluxwarden automation engine library
//!
//! The engine finds live control-plane nodes on the configured hosts, holds
//! each node's session credential once a human has logged in, and
//! periodically removes running workloads whose names violate the naming
//! policy. A node whose credential is rejected is reset so the human sees a
//! fresh login.
//!
//! ## Architecture
//!
//! ```text
//! Discovery ──► NodeRegistry ◄── CredentialVault
//!                    ▲
//! inbound events ──► AutomationScheduler ──► WorkloadApi + PolicyMatcher
//!                    │
//!                    └─ auth failure ──► ResetController ──► Collaborator
//! ```
//!
//! ## Modules
//!
//! - `discovery`: port-slot probing of scan hosts
//! - `registry`: nodes and their per-node runtime state
//! - `vault`: sealed in-memory credential storage
//! - `api` / `client`: control-plane workload calls
//! - `policy`: workload naming policy
//! - `scheduler`: per-node automation tasks
//! - `reset`: recovery after an invalidated credential
//! - `collaborator` / `bridge`: requests to the UI side, JSON-lines transport

pub mod api;
pub mod bridge;
pub mod client;
pub mod collaborator;
pub mod config;
pub mod discovery;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod reset;
pub mod scheduler;
pub mod vault;

// Re-export commonly used types
pub use api::{ListResult, MockWorkloadApi, RemoveOutcome, WorkloadApi};
pub use client::HttpWorkloadClient;
pub use collaborator::{ChannelCollaborator, Collaborator, RecordingCollaborator};
pub use config::Config;
pub use discovery::{Discovery, DiscoveryConfig, HttpProber, Prober};
pub use policy::PolicyMatcher;
pub use registry::{AutomationState, Node, NodeRegistry};
pub use scheduler::{AutomationScheduler, SchedulerConfig, SchedulerContext};
pub use vault::CredentialVault;
