use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::ProcessIdentity;
use crate::proto::ConnectionIdEntry;

/// Names one connection instance across the whole computation.
///
/// Two identifiers are equal only when owner, owner generation and sequence
/// number all agree. [`same_logical`](Self::same_logical) drops the
/// generation and answers whether both name one connection seen from two
/// incarnations.
#[derive(Debug, Clone, Default)]
pub struct ConnectionIdentifier {
    pub owner: ProcessIdentity,
    pub sequence: u64,
}

impl ConnectionIdentifier {
    pub fn new(owner: ProcessIdentity, sequence: u64) -> Self {
        Self { owner, sequence }
    }

    pub fn is_null(&self) -> bool {
        self.owner.is_null() && self.sequence == 0
    }

    pub fn same_logical(&self, other: &Self) -> bool {
        self.owner == other.owner && self.sequence == other.sequence
    }

    pub fn to_entry(&self) -> ConnectionIdEntry {
        ConnectionIdEntry {
            owner: Some(self.owner.to_entry()),
            sequence: self.sequence,
        }
    }

    pub fn from_entry(entry: &ConnectionIdEntry) -> Self {
        Self {
            owner: entry
                .owner
                .as_ref()
                .map(ProcessIdentity::from_entry)
                .unwrap_or_default(),
            sequence: entry.sequence,
        }
    }
}

impl PartialEq for ConnectionIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.same_logical(other) && self.owner.generation == other.owner.generation
    }
}

impl Eq for ConnectionIdentifier {}

impl PartialOrd for ConnectionIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConnectionIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.owner
            .cmp(&other.owner)
            .then(self.sequence.cmp(&other.sequence))
            .then(self.owner.generation.cmp(&other.owner.generation))
    }
}

impl Hash for ConnectionIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.owner.generation.hash(state);
        self.sequence.hash(state);
    }
}

impl fmt::Display for ConnectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.owner, self.sequence)
    }
}
