//! Per-node credential vault.
//!
//! Credentials live only in memory, in the owning node's runtime slot,
//! sealed through the process [`SecretStore`]. The vault never writes them
//! anywhere else and never logs them.

use std::fmt;
use std::sync::Arc;

use fluxwarden_events::Token;
use fluxwarden_id::NodeId;
use fluxwarden_sealing::{SealError, SecretStore};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::logging::Subsystem;
use crate::registry::{AutomationState, NodeRegistry, NodeRuntime};

/// Vault errors.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("credential sealing failed: {0}")]
    Seal(#[from] SealError),
}

/// A credential as held in a node's runtime slot.
#[derive(Clone, PartialEq, Eq)]
pub enum StoredCredential {
    /// Sealed by a protecting store.
    Sealed(Vec<u8>),
    /// Held as given (degraded mode).
    Plain(Vec<u8>),
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredCredential::Sealed(b) => write!(f, "Sealed([{} bytes])", b.len()),
            StoredCredential::Plain(b) => write!(f, "Plain([REDACTED; {} bytes])", b.len()),
        }
    }
}

/// Stores, retrieves and clears node credentials.
#[derive(Debug)]
pub struct CredentialVault {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn SecretStore>,
}

impl CredentialVault {
    pub fn new(registry: Arc<NodeRegistry>, store: Arc<dyn SecretStore>) -> Self {
        Self { registry, store }
    }

    /// True when credentials are held unsealed.
    pub fn is_degraded(&self) -> bool {
        !self.store.is_sealing()
    }

    /// Log the sealing mode. Called once at startup; sealing itself never
    /// logs, so degraded mode is reported exactly once.
    pub fn report_sealing(&self, degraded_reason: Option<&str>) {
        if self.store.is_sealing() {
            info!(
                subsystem = %Subsystem::Main,
                store = self.store.name(),
                key_id = self.store.key_id().unwrap_or("-"),
                "Credential sealing enabled"
            );
        } else {
            warn!(
                subsystem = %Subsystem::Main,
                store = self.store.name(),
                reason = degraded_reason.unwrap_or("store does not seal"),
                "Sealing unavailable, credentials are held unsealed in memory"
            );
        }
    }

    /// Seal a raw credential.
    pub fn seal(&self, token: &Token) -> Result<StoredCredential, VaultError> {
        let raw = token.expose().as_bytes();
        if self.store.is_sealing() {
            return Ok(StoredCredential::Sealed(self.store.seal(raw)?));
        }
        Ok(StoredCredential::Plain(raw.to_vec()))
    }

    /// Recover the raw credential. Returns `None` if it cannot be unsealed.
    pub fn open(&self, node_id: NodeId, credential: &StoredCredential) -> Option<String> {
        let bytes = match credential {
            StoredCredential::Sealed(sealed) => match self.store.unseal(sealed) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(subsystem = %Subsystem::Node(node_id), error = %e, "Failed to unseal credential");
                    return None;
                }
            },
            StoredCredential::Plain(bytes) => bytes.clone(),
        };
        String::from_utf8(bytes).ok()
    }

    /// Seal and place a credential into an already locked runtime.
    pub fn store_in(
        &self,
        node_id: NodeId,
        runtime: &mut NodeRuntime,
        token: &Token,
    ) -> Result<(), VaultError> {
        let sealed = self.seal(token)?;
        runtime.set_credential(sealed);
        debug!(subsystem = %Subsystem::Node(node_id), "Credential stored");
        Ok(())
    }

    /// Replace the node's credential. Does not touch automation.
    pub async fn store(&self, node_id: NodeId, token: &Token) -> Result<(), VaultError> {
        let entry = self
            .registry
            .get(&node_id)
            .ok_or(VaultError::UnknownNode(node_id))?;
        let mut runtime = entry.runtime().lock().await;
        self.store_in(node_id, &mut runtime, token)
    }

    /// Current raw credential, if any.
    pub async fn retrieve(&self, node_id: NodeId) -> Result<Option<String>, VaultError> {
        let entry = self
            .registry
            .get(&node_id)
            .ok_or(VaultError::UnknownNode(node_id))?;
        let runtime = entry.runtime().lock().await;
        Ok(runtime
            .credential()
            .and_then(|credential| self.open(node_id, credential)))
    }

    /// Drop the node's credential. Any armed cycle is cancelled with it.
    /// Returns whether a credential was held.
    pub async fn clear(&self, node_id: NodeId) -> Result<bool, VaultError> {
        let entry = self
            .registry
            .get(&node_id)
            .ok_or(VaultError::UnknownNode(node_id))?;
        let mut runtime = entry.runtime().lock().await;
        let (_, had_session) = runtime.end_session(AutomationState::Unauthenticated);
        Ok(had_session)
    }
}

#[cfg(test)]
mod tests {
    use fluxwarden_sealing::{AesGcmStore, PassthroughStore};

    use super::*;
    use crate::registry::tests::test_node;

    fn vault_with(store: Arc<dyn SecretStore>) -> (CredentialVault, NodeId) {
        let node = test_node(0, 0);
        let id = node.id;
        let registry = Arc::new(NodeRegistry::from_nodes(vec![node]));
        (CredentialVault::new(registry, store), id)
    }

    #[tokio::test]
    async fn test_sealed_roundtrip() {
        let (vault, id) = vault_with(Arc::new(AesGcmStore::ephemeral().unwrap()));
        assert!(!vault.is_degraded());

        vault.store(id, &Token::new("zelid-token")).await.unwrap();
        assert_eq!(vault.retrieve(id).await.unwrap().as_deref(), Some("zelid-token"));

        let entry = vault.registry.get(&id).unwrap();
        let runtime = entry.runtime().lock().await;
        match runtime.credential() {
            Some(StoredCredential::Sealed(bytes)) => {
                assert!(!bytes.windows(11).any(|w| w == b"zelid-token"));
            }
            other => panic!("expected sealed credential, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_passthrough_is_degraded() {
        let (vault, id) = vault_with(Arc::new(PassthroughStore));
        assert!(vault.is_degraded());
        vault.store(id, &Token::new("abc")).await.unwrap();
        assert_eq!(vault.retrieve(id).await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_clear_and_replace() {
        let (vault, id) = vault_with(Arc::new(PassthroughStore));
        assert!(!vault.clear(id).await.unwrap());

        vault.store(id, &Token::new("one")).await.unwrap();
        vault.store(id, &Token::new("two")).await.unwrap();
        assert_eq!(vault.retrieve(id).await.unwrap().as_deref(), Some("two"));

        assert!(vault.clear(id).await.unwrap());
        assert_eq!(vault.retrieve(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let (vault, _) = vault_with(Arc::new(PassthroughStore));
        let other: NodeId = "IP09-node01".parse().unwrap();
        assert!(matches!(
            vault.store(other, &Token::new("x")).await,
            Err(VaultError::UnknownNode(_))
        ));
    }

    #[derive(Clone, Default)]
    struct WarnCounter(Arc<std::sync::atomic::AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_degraded_mode_warned_once() {
        use tracing_subscriber::layer::SubscriberExt;

        let counter = WarnCounter::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(counter.clone()));

        let (vault, id) = vault_with(Arc::new(PassthroughStore));
        vault.report_sealing(Some("sealing disabled by configuration"));
        for token in ["a", "b", "c"] {
            vault.store(id, &Token::new(token)).await.unwrap();
        }

        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_never_prints_plain_bytes() {
        let credential = StoredCredential::Plain(b"secret".to_vec());
        assert!(!format!("{credential:?}").contains("secret"));
    }
}
