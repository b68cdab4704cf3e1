//! In-process mock cluster for integration tests.
//!
//! Each node is a real TCP listener speaking the binary protocol, backed
//! by one shared store. Nodes check vbucket ownership on every keyed
//! command and answer "not my vbucket" for vbuckets they do not own, so
//! tests can exercise topology refresh and re-dispatch end to end.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use membase_client::{StaticTopology, Topology};
use protocol_membase::{
    Command, HEADER_LEN, Opcode, RequestHeader, ResponseWriter, Status, SyncEvent, SyncItem,
    VbucketState, encode_sync_items,
};

/// Keys with this prefix stall the node before replying; used to fill the
/// dispatch queue and to trip caller wait timeouts.
pub const SLOW_PREFIX: &[u8] = b"slow/";
const SLOW_DELAY: Duration = Duration::from_millis(150);

struct Stored {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

struct Shared {
    store: Mutex<HashMap<Vec<u8>, Stored>>,
    /// vbucket id -> owning node index.
    owners: Mutex<Vec<usize>>,
    next_cas: AtomicU64,
}

pub struct MockCluster {
    pub addrs: Vec<String>,
    shared: Arc<Shared>,
    provider: StaticTopology,
}

impl MockCluster {
    /// Start `nodes` listeners and assign vbuckets round-robin.
    pub fn start(nodes: usize, vbuckets: usize) -> Self {
        assert!(vbuckets.is_power_of_two());
        let shared = Arc::new(Shared {
            store: Mutex::new(HashMap::new()),
            owners: Mutex::new((0..vbuckets).map(|vb| vb % nodes).collect()),
            next_cas: AtomicU64::new(1),
        });

        let mut addrs = Vec::with_capacity(nodes);
        for node in 0..nodes {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            addrs.push(listener.local_addr().unwrap().to_string());
            let shared = shared.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { return };
                    let shared = shared.clone();
                    thread::spawn(move || serve(stream, node, shared));
                }
            });
        }

        let cluster = Self {
            addrs,
            shared,
            provider: StaticTopology::new(Topology::new(Vec::new())),
        };
        cluster.provider.set(cluster.topology());
        cluster
    }

    /// The current owner table as addresses.
    pub fn topology(&self) -> Topology {
        let owners = self.shared.owners.lock().unwrap();
        Topology::new(owners.iter().map(|&node| self.addrs[node].clone()).collect())
    }

    /// The provider handed to clients. Shares state with [`Self::publish`].
    pub fn provider(&self) -> StaticTopology {
        self.provider.clone()
    }

    /// Reassign every vbucket to `node` server-side. Old owners start
    /// answering "not my vbucket" immediately; clients keep routing on
    /// their stale map until they refresh.
    pub fn move_all_to(&self, node: usize) {
        let mut owners = self.shared.owners.lock().unwrap();
        for owner in owners.iter_mut() {
            *owner = node;
        }
    }

    /// Push the current owner table to the topology provider.
    pub fn publish(&self) {
        self.provider.set(self.topology());
    }
}

fn serve(mut stream: TcpStream, node: usize, shared: Arc<Shared>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        while buf.len() >= HEADER_LEN {
            let body_len =
                u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
            let total = HEADER_LEN + body_len;
            if buf.len() < total {
                break;
            }
            let packet: Vec<u8> = buf.drain(..total).collect();
            if let Some(reply) = handle(&packet, node, &shared) {
                if stream.write_all(&reply).is_err() {
                    return;
                }
            }
        }
    }
}

fn owned(shared: &Shared, node: usize, vbucket: u16) -> bool {
    shared.owners.lock().unwrap()[vbucket as usize] == node
}

fn slow(key: &[u8]) {
    if key.starts_with(SLOW_PREFIX) {
        thread::sleep(SLOW_DELAY);
    }
}

fn handle(packet: &[u8], node: usize, shared: &Shared) -> Option<Vec<u8>> {
    let (command, _) = Command::parse(packet).unwrap();
    match command {
        Command::Get {
            opcode,
            vbucket,
            opaque,
            key,
        } => {
            if !owned(shared, node, vbucket) {
                return Some(ResponseWriter::error(opcode, Status::NotMyVbucket, opaque));
            }
            slow(key);
            let store = shared.store.lock().unwrap();
            match store.get(key) {
                Some(item) => Some(ResponseWriter::value(
                    opcode, opaque, item.cas, item.flags, &item.value,
                )),
                None if opcode == Opcode::GetQ => None,
                None => Some(ResponseWriter::error(opcode, Status::KeyNotFound, opaque)),
            }
        }
        Command::Store {
            opcode,
            vbucket,
            opaque,
            cas,
            flags,
            key,
            value,
            ..
        } => {
            if !owned(shared, node, vbucket) {
                return Some(ResponseWriter::error(opcode, Status::NotMyVbucket, opaque));
            }
            slow(key);
            let mut store = shared.store.lock().unwrap();
            let existing = store.get(key);
            let status = match opcode {
                Opcode::Add if existing.is_some() => Some(Status::KeyExists),
                Opcode::Replace if existing.is_none() => Some(Status::KeyNotFound),
                _ if cas != 0 && existing.is_none() => Some(Status::KeyNotFound),
                _ if cas != 0 && existing.map(|e| e.cas) != Some(cas) => Some(Status::KeyExists),
                _ => None,
            };
            if let Some(status) = status {
                return Some(ResponseWriter::error(opcode, status, opaque));
            }
            let new_cas = shared.next_cas.fetch_add(1, Ordering::Relaxed);
            store.insert(
                key.to_vec(),
                Stored {
                    value: value.to_vec(),
                    flags,
                    cas: new_cas,
                },
            );
            Some(ResponseWriter::success(opcode, opaque, new_cas))
        }
        Command::Delete {
            vbucket,
            opaque,
            cas,
            key,
        } => {
            if !owned(shared, node, vbucket) {
                return Some(ResponseWriter::error(
                    Opcode::Delete,
                    Status::NotMyVbucket,
                    opaque,
                ));
            }
            slow(key);
            let mut store = shared.store.lock().unwrap();
            match store.get(key) {
                None => Some(ResponseWriter::error(
                    Opcode::Delete,
                    Status::KeyNotFound,
                    opaque,
                )),
                Some(item) if cas != 0 && item.cas != cas => Some(ResponseWriter::error(
                    Opcode::Delete,
                    Status::KeyExists,
                    opaque,
                )),
                Some(_) => {
                    store.remove(key);
                    Some(ResponseWriter::success(Opcode::Delete, opaque, 0))
                }
            }
        }
        Command::Counter {
            opcode,
            vbucket,
            opaque,
            delta,
            initial,
            key,
            ..
        } => {
            if !owned(shared, node, vbucket) {
                return Some(ResponseWriter::error(opcode, Status::NotMyVbucket, opaque));
            }
            let mut store = shared.store.lock().unwrap();
            let current = match store.get(key) {
                Some(item) => match std::str::from_utf8(&item.value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    Some(n) => Some(n),
                    None => {
                        return Some(ResponseWriter::error(opcode, Status::DeltaBadval, opaque));
                    }
                },
                None => None,
            };
            let next = match current {
                None => initial,
                Some(n) if opcode == Opcode::Increment => n.wrapping_add(delta),
                Some(n) => n.saturating_sub(delta),
            };
            let new_cas = shared.next_cas.fetch_add(1, Ordering::Relaxed);
            store.insert(
                key.to_vec(),
                Stored {
                    value: next.to_string().into_bytes(),
                    flags: 0,
                    cas: new_cas,
                },
            );
            Some(ResponseWriter::counter(opcode, opaque, new_cas, next))
        }
        Command::Concat {
            opcode,
            vbucket,
            opaque,
            key,
            value,
            ..
        } => {
            if !owned(shared, node, vbucket) {
                return Some(ResponseWriter::error(opcode, Status::NotMyVbucket, opaque));
            }
            let mut store = shared.store.lock().unwrap();
            let Some(item) = store.get_mut(key) else {
                return Some(ResponseWriter::error(opcode, Status::ItemNotStored, opaque));
            };
            if opcode == Opcode::Append {
                item.value.extend_from_slice(value);
            } else {
                let mut joined = value.to_vec();
                joined.extend_from_slice(&item.value);
                item.value = joined;
            }
            item.cas = shared.next_cas.fetch_add(1, Ordering::Relaxed);
            Some(ResponseWriter::success(opcode, opaque, item.cas))
        }
        Command::Expiry {
            opcode,
            vbucket,
            opaque,
            key,
            ..
        } => {
            if !owned(shared, node, vbucket) {
                return Some(ResponseWriter::error(opcode, Status::NotMyVbucket, opaque));
            }
            let store = shared.store.lock().unwrap();
            match store.get(key) {
                None => Some(ResponseWriter::error(opcode, Status::KeyNotFound, opaque)),
                Some(_) if opcode == Opcode::Touch => {
                    Some(ResponseWriter::success(opcode, opaque, 0))
                }
                Some(item) => Some(ResponseWriter::value(
                    opcode, opaque, item.cas, item.flags, &item.value,
                )),
            }
        }
        Command::Unlock {
            vbucket,
            opaque,
            key,
            ..
        } => {
            if !owned(shared, node, vbucket) {
                return Some(ResponseWriter::error(
                    Opcode::UnlockKey,
                    Status::NotMyVbucket,
                    opaque,
                ));
            }
            let store = shared.store.lock().unwrap();
            if store.contains_key(key) {
                Some(ResponseWriter::success(Opcode::UnlockKey, opaque, 0))
            } else {
                Some(ResponseWriter::error(
                    Opcode::UnlockKey,
                    Status::KeyNotFound,
                    opaque,
                ))
            }
        }
        Command::Evict {
            vbucket, opaque, ..
        } => {
            if !owned(shared, node, vbucket) {
                return Some(ResponseWriter::error(
                    Opcode::EvictKey,
                    Status::NotMyVbucket,
                    opaque,
                ));
            }
            Some(ResponseWriter::success(Opcode::EvictKey, opaque, 0))
        }
        Command::Noop { opaque } => Some(ResponseWriter::success(Opcode::Noop, opaque, 0)),
        Command::Version { opaque } => Some(ResponseWriter::version(opaque, b"1.7.mock")),
        Command::Quit { opaque } => Some(ResponseWriter::success(Opcode::Quit, opaque, 0)),
        Command::Stat { opaque, .. } => {
            let store = shared.store.lock().unwrap();
            let mut reply = ResponseWriter::stat_entry(
                opaque,
                b"curr_items",
                store.len().to_string().as_bytes(),
            );
            reply.extend_from_slice(&ResponseWriter::stat_entry(
                opaque,
                b"node",
                node.to_string().as_bytes(),
            ));
            reply.extend_from_slice(&ResponseWriter::stat_end(opaque));
            Some(reply)
        }
        Command::Flush { opaque, .. } => {
            shared.store.lock().unwrap().clear();
            Some(ResponseWriter::success(Opcode::Flush, opaque, 0))
        }
        Command::SaslListMechs { opaque } => {
            Some(ResponseWriter::payload(Opcode::SaslListMechs, opaque, b"PLAIN"))
        }
        Command::Sasl {
            opcode,
            opaque,
            mechanism,
            data,
        } => {
            let accepted = mechanism == b"PLAIN" && data.split(|b| *b == 0).nth(2) == Some(b"secret");
            if accepted {
                Some(ResponseWriter::payload(opcode, opaque, b""))
            } else {
                Some(ResponseWriter::error(opcode, Status::AuthError, opaque))
            }
        }
        Command::SelectBucket { opaque, .. } => {
            Some(ResponseWriter::success(Opcode::SelectBucket, opaque, 0))
        }
        Command::SetVbucketState { opaque, .. } => {
            Some(ResponseWriter::success(Opcode::SetVbucketState, opaque, 0))
        }
        Command::GetVbucketState { opaque, .. } => {
            Some(ResponseWriter::vbucket_state(opaque, VbucketState::Active))
        }
        Command::Sync { opaque, specs, .. } => {
            let store = shared.store.lock().unwrap();
            let items: Vec<SyncItem> = specs
                .iter()
                .map(|spec| match store.get(spec.key) {
                    None => SyncItem {
                        cas: 0,
                        vbucket: spec.vbucket,
                        key: spec.key.to_vec(),
                        event: SyncEvent::InvalidKey,
                    },
                    Some(item) if spec.cas != 0 && item.cas != spec.cas => SyncItem {
                        cas: item.cas,
                        vbucket: spec.vbucket,
                        key: spec.key.to_vec(),
                        event: SyncEvent::InvalidCas,
                    },
                    Some(item) => SyncItem {
                        cas: item.cas,
                        vbucket: spec.vbucket,
                        key: spec.key.to_vec(),
                        event: SyncEvent::Persisted,
                    },
                })
                .collect();
            Some(ResponseWriter::sync(opaque, &encode_sync_items(&items)))
        }
        Command::TapConnect { .. } => {
            // Dump every stored item as a TAP mutation stream.
            let store = shared.store.lock().unwrap();
            let mut reply = Vec::new();
            for (key, item) in store.iter() {
                reply.extend_from_slice(&tap_mutation(key, &item.value, item.flags, item.cas));
            }
            Some(reply)
        }
        Command::Other { opcode, opaque } => {
            Some(ResponseWriter::error(opcode, Status::UnknownCommand, opaque))
        }
    }
}

/// Build one server-pushed TAP_MUTATION packet.
fn tap_mutation(key: &[u8], value: &[u8], flags: u32, cas: u64) -> Vec<u8> {
    let mut extras = [0u8; 16];
    extras[8..12].copy_from_slice(&flags.to_be_bytes());

    let mut header = RequestHeader::new(Opcode::TapMutation);
    header.extras_len = 16;
    header.key_len = key.len() as u16;
    header.cas = cas;
    header.body_len = (16 + key.len() + value.len()) as u32;

    let mut packet = Vec::with_capacity(HEADER_LEN + header.body_len as usize);
    let mut head = [0u8; HEADER_LEN];
    header.pack(&mut head);
    packet.extend_from_slice(&head);
    packet.extend_from_slice(&extras);
    packet.extend_from_slice(key);
    packet.extend_from_slice(value);
    packet
}
