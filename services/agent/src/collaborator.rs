//! Outbound requests to the external UI collaborator.
//!
//! The engine never renders anything itself. Status changes, storage purges
//! and display reloads are requests to whoever owns those surfaces.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fluxwarden_events::OutboundEvent;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::registry::Node;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("collaborator channel closed")]
    ChannelClosed,

    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

/// UI-side operations the engine requests.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Update the node's status indicator.
    async fn node_status_changed(
        &self,
        node: &Node,
        has_credential: bool,
    ) -> Result<(), CollaboratorError>;

    /// Purge all persisted browser state of the node's storage partition.
    async fn purge_session_storage(&self, node: &Node) -> Result<(), CollaboratorError>;

    /// Reload the node's display so it re-presents login.
    async fn reload_display(&self, node: &Node) -> Result<(), CollaboratorError>;
}

/// Sends requests as [`OutboundEvent`]s over a channel.
#[derive(Debug, Clone)]
pub struct ChannelCollaborator {
    tx: mpsc::Sender<OutboundEvent>,
}

impl ChannelCollaborator {
    pub fn new(tx: mpsc::Sender<OutboundEvent>) -> Self {
        Self { tx }
    }

    async fn send(&self, event: OutboundEvent) -> Result<(), CollaboratorError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CollaboratorError::ChannelClosed)
    }
}

#[async_trait]
impl Collaborator for ChannelCollaborator {
    async fn node_status_changed(
        &self,
        node: &Node,
        has_credential: bool,
    ) -> Result<(), CollaboratorError> {
        self.send(OutboundEvent::NodeStatusChanged {
            node_id: node.id,
            has_credential,
        })
        .await
    }

    async fn purge_session_storage(&self, node: &Node) -> Result<(), CollaboratorError> {
        self.send(OutboundEvent::PurgeSessionStorage {
            node_id: node.id,
            partition: node.partition(),
        })
        .await
    }

    async fn reload_display(&self, node: &Node) -> Result<(), CollaboratorError> {
        self.send(OutboundEvent::ReloadDisplay {
            node_id: node.id,
            ui_url: node.ui_url.clone(),
        })
        .await
    }
}

/// Records every request; used by tests.
#[derive(Debug, Default)]
pub struct RecordingCollaborator {
    events: Mutex<Vec<OutboundEvent>>,
    fail_purge: bool,
}

impl RecordingCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every purge request.
    pub fn failing_purge() -> Self {
        Self {
            fail_purge: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutboundEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Collaborator for RecordingCollaborator {
    async fn node_status_changed(
        &self,
        node: &Node,
        has_credential: bool,
    ) -> Result<(), CollaboratorError> {
        self.lock().push(OutboundEvent::NodeStatusChanged {
            node_id: node.id,
            has_credential,
        });
        Ok(())
    }

    async fn purge_session_storage(&self, node: &Node) -> Result<(), CollaboratorError> {
        if self.fail_purge {
            return Err(CollaboratorError::Rejected("purge unavailable".to_string()));
        }
        self.lock().push(OutboundEvent::PurgeSessionStorage {
            node_id: node.id,
            partition: node.partition(),
        });
        Ok(())
    }

    async fn reload_display(&self, node: &Node) -> Result<(), CollaboratorError> {
        self.lock().push(OutboundEvent::ReloadDisplay {
            node_id: node.id,
            ui_url: node.ui_url.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_node;

    #[tokio::test]
    async fn test_channel_collaborator_events() {
        let (tx, mut rx) = mpsc::channel(4);
        let collaborator = ChannelCollaborator::new(tx);
        let node = test_node(0, 2);

        collaborator.purge_session_storage(&node).await.unwrap();
        collaborator.reload_display(&node).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(OutboundEvent::PurgeSessionStorage {
                node_id: node.id,
                partition: "persist:IP01-node03".to_string(),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(OutboundEvent::ReloadDisplay {
                node_id: node.id,
                ui_url: "http://10.0.0.5:16146".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_channel_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let collaborator = ChannelCollaborator::new(tx);
        assert_eq!(
            collaborator
                .node_status_changed(&test_node(0, 0), false)
                .await,
            Err(CollaboratorError::ChannelClosed)
        );
    }
}
