//! # fluxwarden-id
//!
//! Stable identifiers for discovered control-plane nodes.
//!
//! ## Design Principles
//!
//! - IDs are derived, never generated: the same host order and the same live
//!   slots produce the same IDs on every run
//! - All IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//!
//! ## ID Format
//!
//! | Type | Example | Meaning |
//! |---|---|---|
//! | [`HostLabel`] | `IP01` | 1-based position of the host in the scan list |
//! | [`SlotIndex`] | `2` | 0-based port slot on that host |
//! | [`NodeId`] | `IP01-node03` | host label + 2-digit 1-based slot |
//!
//! A node's display name (`IP01-Node03`) and its isolated browser partition
//! (`persist:IP01-node03`) are derived from the [`NodeId`].

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
