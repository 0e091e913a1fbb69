//! Typed ID definitions for hosts, port slots and nodes.

use crate::{impl_string_id, IdError};

// =============================================================================
// Host Label
// =============================================================================

/// Label assigned to a configured scan host, in input order (`IP01`, `IP02`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostLabel(u16);

impl HostLabel {
    /// The prefix for host labels.
    pub const PREFIX: &'static str = "IP";

    /// Creates the label for the host at `position` (0-based) in the scan list.
    #[must_use]
    pub const fn from_position(position: u16) -> Self {
        Self(position.saturating_add(1))
    }

    /// Returns the 1-based ordinal of this host.
    #[must_use]
    pub const fn ordinal(&self) -> u16 {
        self.0
    }

    /// Parses a label such as `IP01`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some(digits) = s.strip_prefix(Self::PREFIX) else {
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: s.chars().take(Self::PREFIX.len()).collect(),
            });
        };

        let ordinal = parse_ordinal(digits, "host")?;
        Ok(Self(ordinal))
    }
}

impl std::fmt::Display for HostLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:02}", Self::PREFIX, self.0)
    }
}

impl_string_id!(HostLabel);

// =============================================================================
// Slot Index
// =============================================================================

/// One of the fixed port slots probed on every host.
///
/// Slot `i` maps to UI port `16126 + 10 * i` and API port `UI + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u8);

impl SlotIndex {
    /// Number of slots probed per host.
    pub const COUNT: u8 = 8;

    /// Creates a slot index, rejecting values outside `0..COUNT`.
    pub fn new(index: u8) -> Result<Self, IdError> {
        if index >= Self::COUNT {
            return Err(IdError::InvalidNumber {
                component: "slot",
                value: index.to_string(),
            });
        }
        Ok(Self(index))
    }

    /// All slots in probe order.
    pub fn all() -> impl Iterator<Item = SlotIndex> {
        (0..Self::COUNT).map(SlotIndex)
    }

    /// Returns the 0-based index.
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.0
    }

    /// Returns the 1-based ordinal used in node IDs.
    #[must_use]
    pub const fn ordinal(&self) -> u8 {
        self.0 + 1
    }
}

impl std::fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Node ID
// =============================================================================

/// Stable identifier of a discovered node: `{hostLabel}-node{NN}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    host: HostLabel,
    slot: SlotIndex,
}

impl NodeId {
    const SLOT_PREFIX: &'static str = "node";

    /// Creates a node ID from its host label and slot.
    #[must_use]
    pub const fn new(host: HostLabel, slot: SlotIndex) -> Self {
        Self { host, slot }
    }

    /// Returns the host label.
    #[must_use]
    pub const fn host(&self) -> HostLabel {
        self.host
    }

    /// Returns the slot.
    #[must_use]
    pub const fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Human-readable node name, e.g. `IP01-Node03`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{}-Node{:02}", self.host, self.slot.ordinal())
    }

    /// Name of the node's isolated browser storage partition.
    #[must_use]
    pub fn partition(&self) -> String {
        format!("persist:{self}")
    }

    /// Parses an ID such as `IP01-node03`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((host, slot)) = s.split_once('-') else {
            return Err(IdError::MissingSeparator);
        };

        let host = HostLabel::parse(host)?;

        let Some(digits) = slot.strip_prefix(Self::SLOT_PREFIX) else {
            return Err(IdError::InvalidPrefix {
                expected: Self::SLOT_PREFIX,
                actual: slot.to_string(),
            });
        };

        let ordinal = parse_ordinal(digits, "slot")?;
        let index = u8::try_from(ordinal - 1).map_err(|_| IdError::InvalidNumber {
            component: "slot",
            value: digits.to_string(),
        })?;
        let slot = SlotIndex::new(index).map_err(|_| IdError::InvalidNumber {
            component: "slot",
            value: digits.to_string(),
        })?;

        Ok(Self { host, slot })
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}{:02}",
            self.host,
            Self::SLOT_PREFIX,
            self.slot.ordinal()
        )
    }
}

impl_string_id!(NodeId);

/// Parses a 1-based ordinal of at least two digits.
fn parse_ordinal(digits: &str, component: &'static str) -> Result<u16, IdError> {
    let invalid = || IdError::InvalidNumber {
        component,
        value: digits.to_string(),
    };

    if digits.len() < 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    match digits.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(n) => Ok(n),
    }
}

// =============================================================================
// Tests
// =============================================================================
