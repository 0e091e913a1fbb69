//! Secret-sealing capability for session credentials.
//!
//! Credentials are held only for the lifetime of the process. When a sealing
//! capability is available they are kept sealed at rest in memory:
//! - [`AesGcmStore`]: AES-256-GCM with a fresh nonce per seal; the key is
//!   either operator-supplied (base64) or generated per process
//! - [`PassthroughStore`]: degraded mode, bytes are kept as-is
//!
//! Core logic is written against [`SecretStore`] and never checks which
//! implementation it was given.
//!
//! # Sealed format
//!
//! ```text
//! nonce (12 bytes) || ciphertext+tag
//! ```

use std::fmt;
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const SEAL_AAD: &[u8] = b"fluxwarden-credential-v1";

/// Sealing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SealError {
    /// The supplied key is not valid base64 or not 32 bytes long.
    #[error("invalid sealing key encoding")]
    InvalidKey,

    /// Encryption failed.
    #[error("seal failed")]
    SealFailed,

    /// Decryption or authentication failed.
    #[error("unseal failed")]
    UnsealFailed,

    /// Sealed bytes are shorter than the nonce.
    #[error("sealed payload truncated ({0} bytes)")]
    Truncated(usize),
}

/// A capability to seal and unseal opaque bytes.
pub trait SecretStore: Send + Sync + fmt::Debug {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Returns true if `seal` actually protects the bytes.
    fn is_sealing(&self) -> bool;

    /// Seal plaintext bytes.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;

    /// Recover plaintext from sealed bytes.
    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError>;

    /// Short fingerprint of the sealing key, safe to log.
    fn key_id(&self) -> Option<&str> {
        None
    }
}

// =============================================================================
// AES-GCM
// =============================================================================

/// AES-256-GCM sealing store.
#[derive(Clone)]
pub struct AesGcmStore {
    key_id: String,
    cipher: Aes256Gcm,
}

impl AesGcmStore {
    /// Create a store from raw key bytes.
    pub fn new(key_bytes: [u8; KEY_BYTES]) -> Result<Self, SealError> {
        let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| SealError::InvalidKey)?;
        Ok(Self {
            key_id: key_id_for_bytes(&key_bytes),
            cipher,
        })
    }

    /// Create a store with a random key that lives only in this process.
    pub fn ephemeral() -> Result<Self, SealError> {
        let mut key = [0u8; KEY_BYTES];
        rand::rng().fill_bytes(&mut key);
        Self::new(key)
    }

    /// Create a store from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, SealError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| SealError::InvalidKey)?;
        let key: [u8; KEY_BYTES] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SealError::InvalidKey)?;
        Self::new(key)
    }
}

impl fmt::Debug for AesGcmStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmStore")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SecretStore for AesGcmStore {
    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn is_sealing(&self) -> bool {
        true
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| SealError::SealFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < NONCE_BYTES {
            return Err(SealError::Truncated(sealed.len()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_BYTES);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: SEAL_AAD,
                },
            )
            .map_err(|_| SealError::UnsealFailed)
    }

    fn key_id(&self) -> Option<&str> {
        Some(&self.key_id)
    }
}

fn key_id_for_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)[..8].to_string()
}

// =============================================================================
// Passthrough
// =============================================================================

/// Degraded-mode store: bytes are kept as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughStore;

impl SecretStore for PassthroughStore {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn is_sealing(&self) -> bool {
        false
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        Ok(plaintext.to_vec())
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        Ok(sealed.to_vec())
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Operator choice for credential sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SealingMode {
    /// Seal when possible.
    #[default]
    Auto,
    /// Never seal.
    Disabled,
}

/// Outcome of picking a store at startup.
#[derive(Debug, Clone)]
pub struct StoreSelection {
    /// The store to use.
    pub store: Arc<dyn SecretStore>,
    /// Why sealing is unavailable, when it is.
    pub degraded_reason: Option<String>,
}

/// Pick the secret store for this process.
///
/// An invalid operator key does not stop the process: it falls back to
/// passthrough and reports why.
pub fn select_store(mode: SealingMode, key: Option<&str>) -> StoreSelection {
    if mode == SealingMode::Disabled {
        return StoreSelection {
            store: Arc::new(PassthroughStore),
            degraded_reason: Some("sealing disabled by configuration".to_string()),
        };
    }

    let store = match key {
        Some(encoded) => AesGcmStore::from_base64(encoded),
        None => AesGcmStore::ephemeral(),
    };

    match store {
        Ok(store) => StoreSelection {
            store: Arc::new(store),
            degraded_reason: None,
        },
        Err(e) => StoreSelection {
            store: Arc::new(PassthroughStore),
            degraded_reason: Some(e.to_string()),
        },
    }
}
