//! The dispatch worker.
//!
//! One thread owns the vbucket map and every node connection. Callers hand
//! it operations through a bounded channel and block on a typed one-shot
//! result channel. Because the worker is the only thread that touches the
//! map, the connection table, or a socket, none of them need locks, and
//! operations on the same key retain their submission order.
//!
//! A "not my vbucket" response never reaches the caller: the worker
//! refreshes the topology and retries the operation in place, up to the
//! configured limit.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crossbeam_channel::{Receiver, Sender};
use protocol_membase::{SyncItem, SyncKeyspec};
use vbmap::VbucketMap;

use crate::config::Config;
use crate::conn::{Conn, CounterValue, Item};
use crate::error::Error;
use crate::metrics::{DISPATCH_COMPLETED, DISPATCH_FAILED, NMV_RETRIES, RECONFIGS};
use crate::topology::TopologyProvider;

/// One operation submitted to the worker.
#[derive(Debug)]
pub(crate) enum Op {
    Get {
        key: Vec<u8>,
    },
    GetMulti {
        keys: Vec<Vec<u8>>,
    },
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        expiration: u32,
        cas: u64,
    },
    Add {
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        expiration: u32,
    },
    Replace {
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        expiration: u32,
        cas: u64,
    },
    Delete {
        key: Vec<u8>,
        cas: u64,
    },
    Increment {
        key: Vec<u8>,
        delta: u64,
        initial: u64,
        expiration: u32,
    },
    Decrement {
        key: Vec<u8>,
        delta: u64,
        initial: u64,
        expiration: u32,
    },
    Append {
        key: Vec<u8>,
        value: Vec<u8>,
        cas: u64,
    },
    Prepend {
        key: Vec<u8>,
        value: Vec<u8>,
        cas: u64,
    },
    Touch {
        key: Vec<u8>,
        expiration: u32,
    },
    Gat {
        key: Vec<u8>,
        expiration: u32,
    },
    GetLocked {
        key: Vec<u8>,
        lock_expiry: u32,
    },
    Unlock {
        key: Vec<u8>,
        cas: u64,
    },
    Evict {
        key: Vec<u8>,
    },
    /// Keys with the CAS to acknowledge (0 = any mutation).
    Sync {
        keyspecs: Vec<(Vec<u8>, u64)>,
        flags: u32,
    },
    /// Fan out to every node.
    Stats {
        sub: Vec<u8>,
    },
    Flush {
        expiration: u32,
    },
    Version,
    /// Rebuild the whole owner table from the provider.
    Reconfig,
}

/// Typed result of an operation.
#[derive(Debug)]
pub(crate) enum Reply {
    Item(Option<Item>),
    Cas(u64),
    Counter(CounterValue),
    Unit,
    Multi(Vec<(Vec<u8>, Item)>),
    /// Per-node stat groups, keyed by node address.
    Stats(Vec<(String, Vec<(String, String)>)>),
    Versions(Vec<(String, String)>),
    Sync(Vec<SyncItem>),
}

/// A queue entry: the operation plus the channel the caller waits on.
/// The channel is bounded(1); if the caller has stopped waiting, the
/// worker's send fails and the result is dropped.
pub(crate) enum Command {
    Op {
        op: Op,
        reply: Sender<Result<Reply, Error>>,
    },
    Shutdown,
}

pub(crate) struct Worker {
    config: Config,
    provider: Box<dyn TopologyProvider>,
    map: VbucketMap,
    conns: HashMap<String, Conn>,
    rx: Receiver<Command>,
}

impl Worker {
    pub(crate) fn new(
        config: Config,
        provider: Box<dyn TopologyProvider>,
        map: VbucketMap,
        rx: Receiver<Command>,
    ) -> Self {
        Self {
            config,
            provider,
            map,
            conns: HashMap::new(),
            rx,
        }
    }

    /// Drain the queue until shutdown or every sender is gone.
    pub(crate) fn run(mut self) {
        while let Ok(command) = self.rx.recv() {
            match command {
                Command::Shutdown => break,
                Command::Op { op, reply } => {
                    let result = self.execute(op);
                    match &result {
                        Ok(_) => {
                            DISPATCH_COMPLETED.increment();
                        }
                        Err(err) => {
                            DISPATCH_FAILED.increment();
                            log::debug!("operation failed: {err}");
                        }
                    }
                    let _ = reply.send(result);
                }
            }
        }
        log::debug!("dispatch worker exiting");
    }

    fn execute(&mut self, op: Op) -> Result<Reply, Error> {
        match op {
            Op::Get { key } => self
                .keyed(&key, |conn, vb, key| conn.get(key, vb))
                .map(Reply::Item),
            Op::GetMulti { keys } => self.get_multi(keys).map(Reply::Multi),
            Op::Set {
                key,
                value,
                flags,
                expiration,
                cas,
            } => self
                .keyed(&key, |conn, vb, key| {
                    conn.set(key, &value, vb, flags, expiration, cas)
                })
                .map(Reply::Cas),
            Op::Add {
                key,
                value,
                flags,
                expiration,
            } => self
                .keyed(&key, |conn, vb, key| {
                    conn.add(key, &value, vb, flags, expiration)
                })
                .map(Reply::Cas),
            Op::Replace {
                key,
                value,
                flags,
                expiration,
                cas,
            } => self
                .keyed(&key, |conn, vb, key| {
                    conn.replace(key, &value, vb, flags, expiration, cas)
                })
                .map(Reply::Cas),
            Op::Delete { key, cas } => self
                .keyed(&key, |conn, vb, key| conn.delete(key, vb, cas))
                .map(|()| Reply::Unit),
            Op::Increment {
                key,
                delta,
                initial,
                expiration,
            } => self
                .keyed(&key, |conn, vb, key| {
                    conn.increment(key, vb, delta, initial, expiration)
                })
                .map(Reply::Counter),
            Op::Decrement {
                key,
                delta,
                initial,
                expiration,
            } => self
                .keyed(&key, |conn, vb, key| {
                    conn.decrement(key, vb, delta, initial, expiration)
                })
                .map(Reply::Counter),
            Op::Append { key, value, cas } => self
                .keyed(&key, |conn, vb, key| conn.append(key, &value, vb, cas))
                .map(Reply::Cas),
            Op::Prepend { key, value, cas } => self
                .keyed(&key, |conn, vb, key| conn.prepend(key, &value, vb, cas))
                .map(Reply::Cas),
            Op::Touch { key, expiration } => self
                .keyed(&key, |conn, vb, key| conn.touch(key, vb, expiration))
                .map(|()| Reply::Unit),
            Op::Gat { key, expiration } => self
                .keyed(&key, |conn, vb, key| conn.gat(key, vb, expiration))
                .map(Reply::Item),
            Op::GetLocked { key, lock_expiry } => self
                .keyed(&key, |conn, vb, key| conn.get_locked(key, vb, lock_expiry))
                .map(Reply::Item),
            Op::Unlock { key, cas } => self
                .keyed(&key, |conn, vb, key| conn.unlock(key, vb, cas))
                .map(|()| Reply::Unit),
            Op::Evict { key } => self
                .keyed(&key, |conn, vb, key| conn.evict(key, vb))
                .map(|()| Reply::Unit),
            Op::Sync { keyspecs, flags } => self.sync(keyspecs, flags).map(Reply::Sync),
            Op::Stats { sub } => self.stats(&sub).map(Reply::Stats),
            Op::Flush { expiration } => self.flush(expiration).map(|()| Reply::Unit),
            Op::Version => self.versions().map(Reply::Versions),
            Op::Reconfig => self.reconfig(None).map(|()| Reply::Unit),
        }
    }

    /// Route a single-key operation, retrying through topology refreshes
    /// while the node answers "not my vbucket".
    fn keyed<T>(
        &mut self,
        key: &[u8],
        mut op: impl FnMut(&mut Conn, u16, &[u8]) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut attempts = 0u32;
        loop {
            let vbucket = self.map.vbucket(key);
            let addr = self.map.owner(vbucket)?.to_string();
            let conn = self.conn_for(&addr)?;
            match op(conn, vbucket, key) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_not_my_vbucket() => {
                    attempts += 1;
                    NMV_RETRIES.increment();
                    if attempts >= self.config.nmv_retry_limit {
                        return Err(Error::RetriesExhausted { vbucket, attempts });
                    }
                    log::debug!(
                        "vbucket {vbucket} not owned by {addr}, refreshing topology \
                         (attempt {attempts})"
                    );
                    self.reconfig(Some(vbucket))?;
                }
                Err(err) => {
                    self.drop_conn_on(&err, &addr);
                    return Err(err);
                }
            }
        }
    }

    fn get_multi(&mut self, keys: Vec<Vec<u8>>) -> Result<Vec<(Vec<u8>, Item)>, Error> {
        let mut grouped: HashMap<String, Vec<(Vec<u8>, u16)>> = HashMap::new();
        for key in keys {
            let vbucket = self.map.vbucket(&key);
            let addr = self.map.owner(vbucket)?.to_string();
            grouped.entry(addr).or_default().push((key, vbucket));
        }

        let mut hits = Vec::new();
        for (addr, node_keys) in grouped {
            let conn = self.conn_for(&addr)?;
            match conn.get_multi(&node_keys) {
                Ok(mut node_hits) => hits.append(&mut node_hits),
                Err(err) => {
                    // An aborted pipeline leaves unread replies on the
                    // socket; the connection cannot be reused.
                    self.conns.remove(&addr);
                    log::warn!("dropping connection to {addr} after failed multi-get: {err}");
                    return Err(err);
                }
            }
        }
        Ok(hits)
    }

    fn sync(&mut self, keyspecs: Vec<(Vec<u8>, u64)>, flags: u32) -> Result<Vec<SyncItem>, Error> {
        let mut grouped: HashMap<String, Vec<SyncKeyspec>> = HashMap::new();
        for (key, cas) in keyspecs {
            let vbucket = self.map.vbucket(&key);
            let addr = self.map.owner(vbucket)?.to_string();
            grouped
                .entry(addr)
                .or_default()
                .push(SyncKeyspec { cas, vbucket, key });
        }

        let mut items = Vec::new();
        for (addr, specs) in grouped {
            let conn = self.conn_for(&addr)?;
            match conn.sync(&specs, flags) {
                Ok(mut node_items) => items.append(&mut node_items),
                Err(err) => {
                    self.drop_conn_on(&err, &addr);
                    return Err(err);
                }
            }
        }
        Ok(items)
    }

    fn stats(&mut self, sub: &[u8]) -> Result<Vec<(String, Vec<(String, String)>)>, Error> {
        let mut out = Vec::new();
        for addr in self.node_addrs() {
            let conn = self.conn_for(&addr)?;
            let entries = conn.stats(sub)?;
            out.push((addr, entries));
        }
        Ok(out)
    }

    fn versions(&mut self) -> Result<Vec<(String, String)>, Error> {
        let mut out = Vec::new();
        for addr in self.node_addrs() {
            let conn = self.conn_for(&addr)?;
            let version = conn.version()?;
            out.push((addr, version));
        }
        Ok(out)
    }

    fn flush(&mut self, expiration: u32) -> Result<(), Error> {
        for addr in self.node_addrs() {
            let conn = self.conn_for(&addr)?;
            conn.flush(expiration)?;
        }
        Ok(())
    }

    fn node_addrs(&self) -> Vec<String> {
        self.map
            .distinct_owners()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Look up or open the connection to a node. New connections are
    /// authenticated and bound to the configured bucket before use.
    fn conn_for(&mut self, addr: &str) -> Result<&mut Conn, Error> {
        match self.conns.entry(addr.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut conn =
                    Conn::connect(addr, self.config.connect_timeout, self.config.tcp_nodelay)?;
                if let Some(creds) = &self.config.credentials {
                    conn.sasl_plain(&creds.username, &creds.password)?;
                    if let Some(bucket) = &creds.bucket {
                        conn.select_bucket(bucket.as_bytes())?;
                    }
                }
                Ok(entry.insert(conn))
            }
        }
    }

    /// Transport and framing failures leave the connection in an unknown
    /// state; drop it so the next operation reconnects.
    fn drop_conn_on(&mut self, err: &Error, addr: &str) {
        if matches!(
            err,
            Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_) | Error::OpaqueMismatch { .. }
        ) && self.conns.remove(addr).is_some()
        {
            log::warn!("dropping connection to {addr} after error: {err}");
        }
    }

    /// Re-fetch the topology and update the owner table: just the moved
    /// vbucket when one is named, the whole table otherwise. Runs on this
    /// thread, so no other operation is dispatched while it is underway.
    fn reconfig(&mut self, vbucket: Option<u16>) -> Result<(), Error> {
        RECONFIGS.increment();
        let topology = self.provider.fetch()?;
        match vbucket {
            Some(vbucket) => {
                let owner = topology
                    .owners
                    .get(vbucket as usize)
                    .ok_or(vbmap::MapError::VbucketOutOfRange(vbucket))?
                    .clone();
                self.map.update(vbucket, owner)?;
            }
            None => {
                self.map.replace(topology.owners)?;
                let live = self.node_addrs();
                self.conns.retain(|addr, _| live.contains(addr));
            }
        }
        Ok(())
    }
}
