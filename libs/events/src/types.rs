//! Event type definitions.
//!
//! Each event is a variant of [`InboundEvent`] or [`OutboundEvent`], tagged by
//! a snake_case `type` field with camelCase payload fields.

use fluxwarden_id::NodeId;
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Inbound
    pub const CREDENTIAL_ACQUIRED: &str = "credential_acquired";
    pub const CREDENTIAL_LOST: &str = "credential_lost";
    pub const CONTROL_PLANE_VERSION_CHANGED: &str = "control_plane_version_changed";
    pub const FORCE_REFRESH: &str = "force_refresh";

    // Outbound
    pub const NODE_STATUS_CHANGED: &str = "node_status_changed";
    pub const PURGE_SESSION_STORAGE: &str = "purge_session_storage";
    pub const RELOAD_DISPLAY: &str = "reload_display";
    pub const NODES_DISCOVERED: &str = "nodes_discovered";
    pub const LOG_LINE: &str = "log_line";
    pub const LOG_HISTORY: &str = "log_history";
}

// =============================================================================
// Token
// =============================================================================

/// A raw session credential as captured by the login surface.
///
/// The content is only reachable through [`Token::expose`]; `Debug` never
/// prints it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Wraps a raw credential.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw credential.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the credential is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token([REDACTED; {} bytes])", self.0.len())
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Events consumed from the external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// The login surface observed a new session token.
    #[serde(rename_all = "camelCase")]
    CredentialAcquired { node_id: NodeId, token: Token },

    /// The captured token disappeared (logout).
    #[serde(rename_all = "camelCase")]
    CredentialLost { node_id: NodeId },

    /// The embedded UI observed a control-plane software version change.
    #[serde(rename_all = "camelCase")]
    ControlPlaneVersionChanged {
        node_id: NodeId,
        old_version: String,
        new_version: String,
    },

    /// An operator asked for the node's session to be wiped and re-presented.
    #[serde(rename_all = "camelCase")]
    ForceRefresh { node_id: NodeId },
}

impl InboundEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            InboundEvent::CredentialAcquired { .. } => event_types::CREDENTIAL_ACQUIRED,
            InboundEvent::CredentialLost { .. } => event_types::CREDENTIAL_LOST,
            InboundEvent::ControlPlaneVersionChanged { .. } => {
                event_types::CONTROL_PLANE_VERSION_CHANGED
            }
            InboundEvent::ForceRefresh { .. } => event_types::FORCE_REFRESH,
        }
    }

    /// Returns the node the event is about.
    pub fn node_id(&self) -> NodeId {
        match self {
            InboundEvent::CredentialAcquired { node_id, .. }
            | InboundEvent::CredentialLost { node_id }
            | InboundEvent::ControlPlaneVersionChanged { node_id, .. }
            | InboundEvent::ForceRefresh { node_id } => *node_id,
        }
    }

    /// Decodes one JSON line.
    pub fn from_json_line(line: &str) -> Result<Self, EventError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(EventError::Empty);
        }
        Ok(serde_json::from_str(line)?)
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// A discovered node as presented to the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub id: NodeId,
    pub name: String,
    pub ui_url: String,
    pub api_url: String,
    pub partition: String,
    pub has_credential: bool,
}

/// Events and requests produced for the external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Status indicator update.
    #[serde(rename_all = "camelCase")]
    NodeStatusChanged { node_id: NodeId, has_credential: bool },

    /// Purge all persisted browser state of the node's partition.
    #[serde(rename_all = "camelCase")]
    PurgeSessionStorage { node_id: NodeId, partition: String },

    /// Reload the node's display surface so it re-presents login.
    #[serde(rename_all = "camelCase")]
    ReloadDisplay { node_id: NodeId, ui_url: String },

    /// The node table produced by discovery.
    NodesDiscovered { nodes: Vec<NodeSummary> },

    /// A redacted log line for the log viewer.
    LogLine { line: String },

    /// Redacted lines recorded before the log viewer attached, oldest first.
    LogHistory { lines: Vec<String> },
}

impl OutboundEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            OutboundEvent::NodeStatusChanged { .. } => event_types::NODE_STATUS_CHANGED,
            OutboundEvent::PurgeSessionStorage { .. } => event_types::PURGE_SESSION_STORAGE,
            OutboundEvent::ReloadDisplay { .. } => event_types::RELOAD_DISPLAY,
            OutboundEvent::NodesDiscovered { .. } => event_types::NODES_DISCOVERED,
            OutboundEvent::LogLine { .. } => event_types::LOG_LINE,
            OutboundEvent::LogHistory { .. } => event_types::LOG_HISTORY,
        }
    }

    /// Encodes the event as a single JSON line (without trailing newline).
    pub fn to_json_line(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Tests
// =============================================================================
