//! # fluxwarden-events
//!
//! Wire types exchanged with the external collaborators of the engine: the
//! login-capture surface, the session-storage owner and the log viewer.
//!
//! ## Design Principles
//!
//! - Events are plain JSON objects tagged by `type`, one per line on the wire
//! - Credential material only travels inbound and never prints via `Debug`
//! - Every event except log lines names exactly one node
//!
//! ## Event Types
//!
//! Inbound (consumed by the engine):
//! - `credential_acquired`, `credential_lost`
//! - `control_plane_version_changed`
//! - `force_refresh`
//!
//! Outbound (produced by the engine):
//! - `node_status_changed`
//! - `purge_session_storage`, `reload_display`
//! - `nodes_discovered`, `log_line`, `log_history`

mod error;
mod types;

pub use error::EventError;
pub use types::*;
