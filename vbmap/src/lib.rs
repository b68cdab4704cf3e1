//! Key to vbucket to node mapping.
//!
//! A [`VbucketMap`] assigns every key to one of a power-of-two number of
//! vbuckets by hashing, and records which node address currently owns each
//! vbucket. The map is rebuilt wholesale from cluster topology, or patched
//! one vbucket at a time when the cluster reports a moved vbucket.

use core::fmt;

mod crc;

pub use crc::crc32;

/// Errors raised while building or patching a map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The owner table was empty.
    Empty,
    /// The vbucket count was not a power of two.
    NotPowerOfTwo(usize),
    /// A vbucket id past the end of the table.
    VbucketOutOfRange(u16),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Empty => write!(f, "vbucket owner table is empty"),
            MapError::NotPowerOfTwo(count) => {
                write!(f, "vbucket count {count} is not a power of two")
            }
            MapError::VbucketOutOfRange(id) => write!(f, "vbucket {id} out of range"),
        }
    }
}

impl std::error::Error for MapError {}

/// Maps keys to vbuckets and vbuckets to owning node addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbucketMap {
    /// Owner address per vbucket id. Length is a power of two.
    owners: Vec<String>,
    /// `owners.len() - 1`; masking the hash selects the vbucket.
    mask: u32,
}

impl VbucketMap {
    /// Build a map from the per-vbucket owner table. The table length is
    /// the vbucket count and must be a power of two.
    pub fn new(owners: Vec<String>) -> Result<Self, MapError> {
        if owners.is_empty() {
            return Err(MapError::Empty);
        }
        if !owners.len().is_power_of_two() {
            return Err(MapError::NotPowerOfTwo(owners.len()));
        }
        let mask = (owners.len() - 1) as u32;
        Ok(Self { owners, mask })
    }

    pub fn vbucket_count(&self) -> usize {
        self.owners.len()
    }

    /// The vbucket a key hashes to.
    pub fn vbucket(&self, key: &[u8]) -> u16 {
        (crc32(key) & self.mask) as u16
    }

    /// Owner address for a vbucket id.
    pub fn owner(&self, vbucket: u16) -> Result<&str, MapError> {
        self.owners
            .get(vbucket as usize)
            .map(String::as_str)
            .ok_or(MapError::VbucketOutOfRange(vbucket))
    }

    /// Owner address for a key: hash, mask, look up.
    pub fn owner_for_key(&self, key: &[u8]) -> &str {
        // vbucket() is always in range by construction.
        &self.owners[self.vbucket(key) as usize]
    }

    /// Reassign one vbucket to a new owner. Used on a "not my vbucket"
    /// error once the cluster reports the moved vbucket's new home.
    pub fn update(&mut self, vbucket: u16, owner: String) -> Result<(), MapError> {
        let slot = self
            .owners
            .get_mut(vbucket as usize)
            .ok_or(MapError::VbucketOutOfRange(vbucket))?;
        *slot = owner;
        Ok(())
    }

    /// Replace the whole owner table. The new table must keep the same
    /// vbucket count; changing the count would silently re-home keys.
    pub fn replace(&mut self, owners: Vec<String>) -> Result<(), MapError> {
        let next = VbucketMap::new(owners)?;
        if next.vbucket_count() != self.vbucket_count() {
            return Err(MapError::NotPowerOfTwo(next.vbucket_count()));
        }
        *self = next;
        Ok(())
    }

    /// Iterate the distinct owner addresses, in first-appearance order.
    pub fn distinct_owners(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for owner in &self.owners {
            if !seen.contains(&owner.as_str()) {
                seen.push(owner);
            }
        }
        seen
    }
}
