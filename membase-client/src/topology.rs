//! Cluster topology as seen by the dispatcher.
//!
//! The dispatcher does not speak to a cluster manager itself; it asks a
//! [`TopologyProvider`] for the current per-vbucket owner table whenever it
//! needs one (startup and every "not my vbucket" refresh). The REST-based
//! discovery that feeds a real deployment lives behind the same trait.

use std::sync::{Arc, Mutex};

use crate::error::Error;

/// A snapshot of the cluster: one owner address per vbucket id. The table
/// length is the vbucket count and must be a power of two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub owners: Vec<String>,
}

impl Topology {
    pub fn new(owners: Vec<String>) -> Self {
        Self { owners }
    }
}

/// Source of topology snapshots. Called from the dispatcher worker thread.
pub trait TopologyProvider: Send + 'static {
    fn fetch(&mut self) -> Result<Topology, Error>;
}

/// A provider backed by a shared, replaceable snapshot. The dispatcher
/// holds one clone; whoever learns of topology changes updates another.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    current: Arc<Mutex<Topology>>,
}

impl StaticTopology {
    pub fn new(topology: Topology) -> Self {
        Self {
            current: Arc::new(Mutex::new(topology)),
        }
    }

    /// Replace the snapshot future fetches will see.
    pub fn set(&self, topology: Topology) {
        *self.current.lock().unwrap() = topology;
    }
}

impl TopologyProvider for StaticTopology {
    fn fetch(&mut self) -> Result<Topology, Error> {
        Ok(self.current.lock().unwrap().clone())
    }
}
