//! The vbucket-aware cluster client.
//!
//! [`ClusterClient`] is the public entry point: it spawns the dispatch
//! worker, hands it operations through a bounded queue, and blocks each
//! caller on its own result channel. Enqueueing never blocks; a full queue
//! fails the call immediately with [`Error::QueueFull`], and a caller that
//! waits longer than the configured timeout gets [`Error::WaitTimeout`].
//!
//! # Example
//!
//! ```no_run
//! use membase_client::{ClusterClient, Config, StaticTopology, Topology};
//!
//! fn example() -> Result<(), membase_client::Error> {
//!     let topology = Topology::new(vec![
//!         "127.0.0.1:11210".to_string(),
//!         "127.0.0.1:11211".to_string(),
//!     ]);
//!     let client = ClusterClient::new(StaticTopology::new(topology), Config::default())?;
//!     client.set("hello", "world", 0, 0)?;
//!     let item = client.get("hello")?;
//!     assert_eq!(item.unwrap().value.as_ref(), b"world");
//!     Ok(())
//! }
//! ```

use std::thread;

use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError, bounded};
use protocol_membase::SyncItem;
use vbmap::VbucketMap;

use crate::config::Config;
use crate::conn::{Conn, CounterValue, Item, TapStream};
use crate::dispatch::{Command, Op, Reply, Worker};
use crate::error::Error;
use crate::metrics::{DISPATCH_ENQUEUED, DISPATCH_REJECTED, DISPATCH_WAIT_TIMEOUTS};
use crate::topology::TopologyProvider;

/// A synchronous, vbucket-aware client for a membase cluster.
///
/// Cloneable across threads is deliberately not offered: callers share one
/// instance behind whatever synchronization they already have, and every
/// operation is independently enqueued, so `&self` methods suffice.
pub struct ClusterClient {
    tx: Sender<Command>,
    worker: Option<thread::JoinHandle<()>>,
    config: Config,
}

impl ClusterClient {
    /// Fetch the initial topology and spawn the dispatch worker.
    pub fn new(mut provider: impl TopologyProvider, config: Config) -> Result<Self, Error> {
        let topology = provider.fetch()?;
        let map = VbucketMap::new(topology.owners)?;
        log::info!(
            "starting dispatcher: {} vbuckets across {} nodes",
            map.vbucket_count(),
            map.distinct_owners().len()
        );

        let (tx, rx) = bounded(config.queue_capacity);
        let worker = Worker::new(config.clone(), Box::new(provider), map, rx);
        let handle = thread::Builder::new()
            .name("membase-dispatch".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            tx,
            worker: Some(handle),
            config,
        })
    }

    /// Enqueue one operation and wait for its result.
    fn submit(&self, op: Op) -> Result<Reply, Error> {
        let (reply_tx, reply_rx) = bounded(1);
        match self.tx.try_send(Command::Op { op, reply: reply_tx }) {
            Ok(()) => {
                DISPATCH_ENQUEUED.increment();
            }
            Err(TrySendError::Full(_)) => {
                DISPATCH_REJECTED.increment();
                return Err(Error::QueueFull);
            }
            Err(TrySendError::Disconnected(_)) => return Err(Error::DispatcherGone),
        }
        match reply_rx.recv_timeout(self.config.wait_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                DISPATCH_WAIT_TIMEOUTS.increment();
                Err(Error::WaitTimeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::DispatcherGone),
        }
    }

    // ── Key operations ───────────────────────────────────────────

    /// Get the value of a key. Returns `None` on a miss.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Item>, Error> {
        match self.submit(Op::Get {
            key: key.as_ref().to_vec(),
        })? {
            Reply::Item(item) => Ok(item),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Fetch many keys at once. Misses are absent from the result.
    pub fn get_multi(
        &self,
        keys: impl IntoIterator<Item = impl AsRef<[u8]>>,
    ) -> Result<Vec<(Vec<u8>, Item)>, Error> {
        let keys = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
        match self.submit(Op::GetMulti { keys })? {
            Reply::Multi(hits) => Ok(hits),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Unconditional store. Returns the new CAS.
    pub fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiration: u32,
    ) -> Result<u64, Error> {
        self.store_with_cas(key, value, flags, expiration, 0)
    }

    /// Compare-and-swap store: fails with `KeyExists` when the live CAS
    /// differs from `cas`.
    pub fn cas(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Result<u64, Error> {
        self.store_with_cas(key, value, flags, expiration, cas)
    }

    fn store_with_cas(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Result<u64, Error> {
        match self.submit(Op::Set {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
            flags,
            expiration,
            cas,
        })? {
            Reply::Cas(cas) => Ok(cas),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Store only if the key does not exist.
    pub fn add(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiration: u32,
    ) -> Result<u64, Error> {
        match self.submit(Op::Add {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
            flags,
            expiration,
        })? {
            Reply::Cas(cas) => Ok(cas),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Store only if the key already exists.
    pub fn replace(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        expiration: u32,
    ) -> Result<u64, Error> {
        match self.submit(Op::Replace {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
            flags,
            expiration,
            cas: 0,
        })? {
            Reply::Cas(cas) => Ok(cas),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<(), Error> {
        self.delete_cas(key, 0)
    }

    /// Delete only while the live CAS still equals `cas`.
    pub fn delete_cas(&self, key: impl AsRef<[u8]>, cas: u64) -> Result<(), Error> {
        match self.submit(Op::Delete {
            key: key.as_ref().to_vec(),
            cas,
        })? {
            Reply::Unit => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Add `delta` to a numeric value, seeding it with `initial` when the
    /// key does not exist.
    pub fn increment(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<CounterValue, Error> {
        match self.submit(Op::Increment {
            key: key.as_ref().to_vec(),
            delta,
            initial,
            expiration,
        })? {
            Reply::Counter(counter) => Ok(counter),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Subtract `delta`, clamping at zero server-side.
    pub fn decrement(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<CounterValue, Error> {
        match self.submit(Op::Decrement {
            key: key.as_ref().to_vec(),
            delta,
            initial,
            expiration,
        })? {
            Reply::Counter(counter) => Ok(counter),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn append(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<u64, Error> {
        match self.submit(Op::Append {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
            cas: 0,
        })? {
            Reply::Cas(cas) => Ok(cas),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn prepend(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<u64, Error> {
        match self.submit(Op::Prepend {
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
            cas: 0,
        })? {
            Reply::Cas(cas) => Ok(cas),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Update a key's expiration without touching the value.
    pub fn touch(&self, key: impl AsRef<[u8]>, expiration: u32) -> Result<(), Error> {
        match self.submit(Op::Touch {
            key: key.as_ref().to_vec(),
            expiration,
        })? {
            Reply::Unit => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Get-and-touch: read the value and update its expiration.
    pub fn gat(&self, key: impl AsRef<[u8]>, expiration: u32) -> Result<Option<Item>, Error> {
        match self.submit(Op::Gat {
            key: key.as_ref().to_vec(),
            expiration,
        })? {
            Reply::Item(item) => Ok(item),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Read a value and lock it against writes until unlocked or the lock
    /// expires.
    pub fn get_locked(
        &self,
        key: impl AsRef<[u8]>,
        lock_expiry: u32,
    ) -> Result<Option<Item>, Error> {
        match self.submit(Op::GetLocked {
            key: key.as_ref().to_vec(),
            lock_expiry,
        })? {
            Reply::Item(item) => Ok(item),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    pub fn unlock(&self, key: impl AsRef<[u8]>, cas: u64) -> Result<(), Error> {
        match self.submit(Op::Unlock {
            key: key.as_ref().to_vec(),
            cas,
        })? {
            Reply::Unit => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Evict a key from memory without deleting it from disk.
    pub fn evict(&self, key: impl AsRef<[u8]>) -> Result<(), Error> {
        match self.submit(Op::Evict {
            key: key.as_ref().to_vec(),
        })? {
            Reply::Unit => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Wait for the requested durability events. Each keyspec pairs a key
    /// with the CAS to acknowledge (0 = any mutation). Flags come from
    /// [`protocol_membase::sync_flags`].
    pub fn sync(
        &self,
        keyspecs: impl IntoIterator<Item = (impl AsRef<[u8]>, u64)>,
        flags: u32,
    ) -> Result<Vec<SyncItem>, Error> {
        let keyspecs = keyspecs
            .into_iter()
            .map(|(key, cas)| (key.as_ref().to_vec(), cas))
            .collect();
        match self.submit(Op::Sync { keyspecs, flags })? {
            Reply::Sync(items) => Ok(items),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    // ── Cluster operations ───────────────────────────────────────

    /// Collect one stat group from every node.
    pub fn stats(
        &self,
        sub: impl AsRef<[u8]>,
    ) -> Result<Vec<(String, Vec<(String, String)>)>, Error> {
        match self.submit(Op::Stats {
            sub: sub.as_ref().to_vec(),
        })? {
            Reply::Stats(stats) => Ok(stats),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Flush every node, optionally delayed by `expiration` seconds.
    pub fn flush_all(&self, expiration: u32) -> Result<(), Error> {
        match self.submit(Op::Flush { expiration })? {
            Reply::Unit => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Rebuild the whole vbucket map from the topology provider, for
    /// callers that learn of a rebalance out of band. Per-vbucket
    /// refreshes happen automatically on "not my vbucket" responses.
    pub fn refresh_topology(&self) -> Result<(), Error> {
        match self.submit(Op::Reconfig)? {
            Reply::Unit => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Server version string per node.
    pub fn versions(&self) -> Result<Vec<(String, String)>, Error> {
        match self.submit(Op::Version)? {
            Reply::Versions(versions) => Ok(versions),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Open a TAP stream to one node on a dedicated connection, outside
    /// the dispatch queue. Flags come from [`protocol_membase::tap_flags`].
    pub fn tap_stream(
        &self,
        addr: &str,
        name: impl AsRef<[u8]>,
        flags: u32,
        backfill_ts: Option<u64>,
    ) -> Result<TapStream, Error> {
        let conn = Conn::connect(addr, self.config.connect_timeout, self.config.tcp_nodelay)?;
        conn.tap_stream(name.as_ref(), flags, backfill_ts)
    }

    /// Stop the worker and wait for it to exit. Idempotent; also runs on
    /// drop.
    pub fn done(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = self.tx.send(Command::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for ClusterClient {
    fn drop(&mut self) {
        self.done();
    }
}
