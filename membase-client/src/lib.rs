//! Synchronous, vbucket-aware client for membase-flavored memcached.
//!
//! Three layers:
//!
//! - [`Conn`]: one blocking TCP connection, one request in flight,
//!   responses correlated by opaque.
//! - A dispatch worker (internal): a single background thread that owns
//!   the vbucket map and every node connection, fed through a bounded
//!   queue. "Not my vbucket" responses trigger a topology refresh and a
//!   transparent retry instead of failing the caller.
//! - [`ClusterClient`]: the public facade callers share across threads.
//!
//! Key-to-node routing lives in the [`vbmap`] crate; the wire format in
//! [`protocol_membase`].

mod cluster;
mod config;
mod conn;
mod dispatch;
mod error;
mod metrics;
mod topology;

pub use cluster::ClusterClient;
pub use config::{Config, ConfigBuilder, ConfigError, Credentials};
pub use conn::{Conn, CounterValue, Item, SaslOutcome, TapStream};
pub use error::Error;
pub use topology::{StaticTopology, Topology, TopologyProvider};

pub use protocol_membase::{
    Status, SyncEvent, SyncItem, TapEvent, VbucketState, sync_flags, tap_flags,
};
