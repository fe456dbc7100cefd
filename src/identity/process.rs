use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{ConnError, Result};
use crate::proto::ProcessIdentityEntry;

/// One incarnation of a process somewhere in the computation.
///
/// Ordering, equality and hashing look at `(host_id, pid, creation_time)`
/// only, so an identity stays the same map key across restarts. Use
/// [`same_incarnation`](Self::same_incarnation) when the generation matters.
#[derive(Debug, Clone, Default)]
pub struct ProcessIdentity {
    pub host_id: u64,
    pub pid: i32,
    pub creation_time: i64,
    pub generation: u32,
    pub prefix: String,
}

impl ProcessIdentity {
    pub fn new(host_id: u64, pid: i32, creation_time: i64) -> Self {
        Self {
            host_id,
            pid,
            creation_time,
            generation: 0,
            prefix: String::new(),
        }
    }

    /// The all-zero "unset" identity.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.host_id == 0 && self.pid == 0 && self.creation_time == 0
    }

    pub fn same_incarnation(&self, other: &Self) -> bool {
        self == other && self.generation == other.generation
    }

    pub fn increment_generation(&mut self) {
        self.generation += 1;
    }

    fn key(&self) -> (u64, i32, i64) {
        (self.host_id, self.pid, self.creation_time)
    }

    pub fn to_entry(&self) -> ProcessIdentityEntry {
        ProcessIdentityEntry {
            host_id: self.host_id,
            pid: self.pid,
            creation_time: self.creation_time,
            generation: self.generation,
            prefix: self.prefix.clone(),
        }
    }

    pub fn from_entry(entry: &ProcessIdentityEntry) -> Self {
        Self {
            host_id: entry.host_id,
            pid: entry.pid,
            creation_time: entry.creation_time,
            generation: entry.generation,
            prefix: entry.prefix.clone(),
        }
    }
}

/// Hashes a hostname the way host ids are derived: `h = c + 331 * h`, made
/// non-negative.
pub fn host_id_from_name(name: &str) -> u64 {
    let mut h: i64 = 0;
    for &c in name.as_bytes() {
        h = (c as i8 as i64).wrapping_add(h.wrapping_mul(331));
    }
    h.unsigned_abs()
}

impl PartialEq for ProcessIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ProcessIdentity {}

impl PartialOrd for ProcessIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for ProcessIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{}-{:x}", self.host_id, self.pid, self.creation_time)
    }
}

/// Parses either a bare `host-pid-time` triple or a checkpoint file name whose
/// last `_`-separated token starts with one (`ckpt_prog_1a2b-42-5f00.img`).
impl FromStr for ProcessIdentity {
    type Err = ConnError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || ConnError::InvalidImage {
            reason: format!("not a process identity: {}", s),
        };

        let last = s.rsplit('_').next().ok_or_else(bad)?;
        let mut parts = last.splitn(3, '-');
        let host = parts.next().ok_or_else(bad)?;
        let pid = parts.next().ok_or_else(bad)?;
        let time = parts.next().ok_or_else(bad)?;
        let time = time.split('.').next().ok_or_else(bad)?;

        Ok(Self::new(
            u64::from_str_radix(host, 16).map_err(|_| bad())?,
            pid.parse().map_err(|_| bad())?,
            i64::from_str_radix(time, 16).map_err(|_| bad())?,
        ))
    }
}
