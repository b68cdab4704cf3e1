//! Blocking single-connection client.
//!
//! One [`Conn`] wraps one TCP socket. Exactly one request is in flight at a
//! time (the multi-get pipeline being the one deliberate exception), and
//! every response is correlated back to its request through the opaque
//! field. All methods block until the response arrives or the socket fails.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use protocol_membase::{
    HEADER_LEN, Opcode, ParsedResponse, Status, SyncItem, SyncKeyspec, TapEvent, VbucketState,
    request,
};

use crate::error::Error;
use crate::metrics::{CONNECTIONS_CLOSED, CONNECTIONS_OPENED};

/// A stored value with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// Result of an increment or decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    pub value: u64,
    pub cas: u64,
}

/// Outcome of one SASL exchange step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslOutcome {
    /// Authentication complete; the payload is the server's final data.
    Done(Vec<u8>),
    /// The server expects another step with this challenge.
    Continue(Vec<u8>),
}

/// A blocking connection to one memcached node.
pub struct Conn {
    stream: TcpStream,
    buf: Vec<u8>,
    opaque: u32,
}

impl Conn {
    /// Connect to `addr` ("host:port"). Resolution picks the first address.
    pub fn connect(addr: &str, connect_timeout: Duration, tcp_nodelay: bool) -> Result<Self, Error> {
        let resolved = addr.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {addr}"),
            )
        })?;
        let stream = TcpStream::connect_timeout(&resolved, connect_timeout)?;
        stream.set_nodelay(tcp_nodelay)?;
        CONNECTIONS_OPENED.increment();
        log::debug!("connected to {addr}");
        Ok(Self {
            stream,
            buf: Vec::with_capacity(4096),
            opaque: seed_opaque(),
        })
    }

    fn next_opaque(&mut self) -> u32 {
        self.opaque = self.opaque.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.opaque
    }

    fn send(&mut self, packet: &[u8]) -> Result<(), Error> {
        self.stream.write_all(packet)?;
        Ok(())
    }

    fn fill(&mut self) -> Result<(), Error> {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Read one complete packet (header plus body) off the socket. The
    /// body length lives at the same offset for requests and responses,
    /// so this also frames server-pushed TAP packets.
    fn read_packet(&mut self) -> Result<Vec<u8>, Error> {
        loop {
            if self.buf.len() >= HEADER_LEN {
                let body_len =
                    u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]])
                        as usize;
                let total = HEADER_LEN + body_len;
                if self.buf.len() >= total {
                    let rest = self.buf.split_off(total);
                    return Ok(std::mem::replace(&mut self.buf, rest));
                }
            }
            self.fill()?;
        }
    }

    // ── Round-trip helpers ───────────────────────────────────────

    /// Send, read the one response, and return the CAS from a bodyless
    /// success. The shape shared by every mutation command.
    fn mutate(&mut self, packet: Vec<u8>, opaque: u32) -> Result<u64, Error> {
        self.send(&packet)?;
        let reply = self.read_packet()?;
        let (parsed, _) = ParsedResponse::parse(&reply)?;
        check_opaque(opaque, parsed.opaque())?;
        match parsed {
            ParsedResponse::Success { cas, .. } => Ok(cas),
            other => Err(fail_or_unexpected(other)),
        }
    }

    /// Send and read a GET-family response. A `KeyNotFound` status is a
    /// miss, not an error.
    fn fetch(&mut self, packet: Vec<u8>, opaque: u32) -> Result<Option<Item>, Error> {
        self.send(&packet)?;
        let reply = self.read_packet()?;
        let (parsed, _) = ParsedResponse::parse(&reply)?;
        check_opaque(opaque, parsed.opaque())?;
        match parsed {
            ParsedResponse::Value {
                cas, flags, value, ..
            } => Ok(Some(Item {
                value: Bytes::copy_from_slice(value),
                flags,
                cas,
            })),
            ParsedResponse::Fail {
                status: Status::KeyNotFound,
                ..
            } => Ok(None),
            other => Err(fail_or_unexpected(other)),
        }
    }

    // ── Key commands ─────────────────────────────────────────────

    pub fn get(&mut self, key: &[u8], vbucket: u16) -> Result<Option<Item>, Error> {
        let opaque = self.next_opaque();
        self.fetch(request::get(key, vbucket, opaque), opaque)
    }

    /// SET is an upsert; pass a non-zero `cas` for compare-and-swap.
    pub fn set(
        &mut self,
        key: &[u8],
        value: &[u8],
        vbucket: u16,
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Result<u64, Error> {
        let opaque = self.next_opaque();
        self.mutate(
            request::set(key, value, vbucket, flags, expiration, cas, opaque),
            opaque,
        )
    }

    pub fn add(
        &mut self,
        key: &[u8],
        value: &[u8],
        vbucket: u16,
        flags: u32,
        expiration: u32,
    ) -> Result<u64, Error> {
        let opaque = self.next_opaque();
        self.mutate(
            request::add(key, value, vbucket, flags, expiration, opaque),
            opaque,
        )
    }

    pub fn replace(
        &mut self,
        key: &[u8],
        value: &[u8],
        vbucket: u16,
        flags: u32,
        expiration: u32,
        cas: u64,
    ) -> Result<u64, Error> {
        let opaque = self.next_opaque();
        self.mutate(
            request::replace(key, value, vbucket, flags, expiration, cas, opaque),
            opaque,
        )
    }

    pub fn delete(&mut self, key: &[u8], vbucket: u16, cas: u64) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::delete(key, vbucket, cas, opaque), opaque)?;
        Ok(())
    }

    fn counter(&mut self, packet: Vec<u8>, opaque: u32) -> Result<CounterValue, Error> {
        self.send(&packet)?;
        let reply = self.read_packet()?;
        let (parsed, _) = ParsedResponse::parse(&reply)?;
        check_opaque(opaque, parsed.opaque())?;
        match parsed {
            ParsedResponse::Counter { cas, value, .. } => Ok(CounterValue { value, cas }),
            other => Err(fail_or_unexpected(other)),
        }
    }

    pub fn increment(
        &mut self,
        key: &[u8],
        vbucket: u16,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<CounterValue, Error> {
        let opaque = self.next_opaque();
        self.counter(
            request::increment(key, vbucket, delta, initial, expiration, opaque),
            opaque,
        )
    }

    pub fn decrement(
        &mut self,
        key: &[u8],
        vbucket: u16,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<CounterValue, Error> {
        let opaque = self.next_opaque();
        self.counter(
            request::decrement(key, vbucket, delta, initial, expiration, opaque),
            opaque,
        )
    }

    pub fn append(
        &mut self,
        key: &[u8],
        value: &[u8],
        vbucket: u16,
        cas: u64,
    ) -> Result<u64, Error> {
        let opaque = self.next_opaque();
        self.mutate(request::append(key, value, vbucket, cas, opaque), opaque)
    }

    pub fn prepend(
        &mut self,
        key: &[u8],
        value: &[u8],
        vbucket: u16,
        cas: u64,
    ) -> Result<u64, Error> {
        let opaque = self.next_opaque();
        self.mutate(request::prepend(key, value, vbucket, cas, opaque), opaque)
    }

    pub fn touch(&mut self, key: &[u8], vbucket: u16, expiration: u32) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::touch(key, vbucket, expiration, opaque), opaque)?;
        Ok(())
    }

    /// Get-and-touch.
    pub fn gat(
        &mut self,
        key: &[u8],
        vbucket: u16,
        expiration: u32,
    ) -> Result<Option<Item>, Error> {
        let opaque = self.next_opaque();
        self.fetch(request::gat(key, vbucket, expiration, opaque), opaque)
    }

    pub fn get_locked(
        &mut self,
        key: &[u8],
        vbucket: u16,
        lock_expiry: u32,
    ) -> Result<Option<Item>, Error> {
        let opaque = self.next_opaque();
        self.fetch(request::get_locked(key, vbucket, lock_expiry, opaque), opaque)
    }

    pub fn unlock(&mut self, key: &[u8], vbucket: u16, cas: u64) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::unlock(key, vbucket, cas, opaque), opaque)?;
        Ok(())
    }

    pub fn evict(&mut self, key: &[u8], vbucket: u16) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::evict(key, vbucket, opaque), opaque)?;
        Ok(())
    }

    /// Pipelined multi-get: one quiet GET per key, a NOOP sentinel, then
    /// read value responses until the sentinel. Misses simply do not
    /// appear in the result.
    pub fn get_multi(&mut self, keys: &[(Vec<u8>, u16)]) -> Result<Vec<(Vec<u8>, Item)>, Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipeline = Vec::new();
        let mut by_opaque: HashMap<u32, usize> = HashMap::with_capacity(keys.len());
        for (index, (key, vbucket)) in keys.iter().enumerate() {
            let opaque = self.next_opaque();
            by_opaque.insert(opaque, index);
            pipeline.extend_from_slice(&request::getq(key, *vbucket, opaque));
        }
        let sentinel = self.next_opaque();
        pipeline.extend_from_slice(&request::noop(sentinel));
        self.send(&pipeline)?;

        let mut hits = Vec::new();
        loop {
            let reply = self.read_packet()?;
            let (parsed, _) = ParsedResponse::parse(&reply)?;
            match parsed {
                ParsedResponse::Success {
                    opcode: Opcode::Noop,
                    opaque,
                    ..
                } => {
                    check_opaque(sentinel, opaque)?;
                    return Ok(hits);
                }
                ParsedResponse::Value {
                    opaque,
                    cas,
                    flags,
                    value,
                    ..
                } => {
                    let index = *by_opaque
                        .get(&opaque)
                        .ok_or(Error::OpaqueMismatch {
                            expected: sentinel,
                            got: opaque,
                        })?;
                    hits.push((
                        keys[index].0.clone(),
                        Item {
                            value: Bytes::copy_from_slice(value),
                            flags,
                            cas,
                        },
                    ));
                }
                other => return Err(fail_or_unexpected(other)),
            }
        }
    }

    // ── Node commands ────────────────────────────────────────────

    pub fn noop(&mut self) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::noop(opaque), opaque)?;
        Ok(())
    }

    pub fn version(&mut self) -> Result<String, Error> {
        let opaque = self.next_opaque();
        self.send(&request::version(opaque))?;
        let reply = self.read_packet()?;
        let (parsed, _) = ParsedResponse::parse(&reply)?;
        check_opaque(opaque, parsed.opaque())?;
        match parsed {
            ParsedResponse::Version { version, .. } => {
                Ok(String::from_utf8_lossy(version).into_owned())
            }
            other => Err(fail_or_unexpected(other)),
        }
    }

    /// Collect one stat group. Entries stream in until an empty-key,
    /// empty-value terminator.
    pub fn stats(&mut self, sub: &[u8]) -> Result<Vec<(String, String)>, Error> {
        let opaque = self.next_opaque();
        self.send(&request::stat(sub, opaque))?;
        let mut entries = Vec::new();
        loop {
            let reply = self.read_packet()?;
            let (parsed, _) = ParsedResponse::parse(&reply)?;
            check_opaque(opaque, parsed.opaque())?;
            match parsed {
                ParsedResponse::Stat { key, value, .. } => {
                    if key.is_empty() && value.is_empty() {
                        return Ok(entries);
                    }
                    entries.push((
                        String::from_utf8_lossy(key).into_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    ));
                }
                other => return Err(fail_or_unexpected(other)),
            }
        }
    }

    pub fn flush(&mut self, expiration: u32) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::flush(expiration, opaque), opaque)?;
        Ok(())
    }

    // ── SASL ─────────────────────────────────────────────────────

    pub fn sasl_mechanisms(&mut self) -> Result<Vec<String>, Error> {
        let opaque = self.next_opaque();
        self.send(&request::sasl_list_mechs(opaque))?;
        let reply = self.read_packet()?;
        let (parsed, _) = ParsedResponse::parse(&reply)?;
        check_opaque(opaque, parsed.opaque())?;
        match parsed {
            ParsedResponse::Payload { data, .. } => Ok(String::from_utf8_lossy(data)
                .split_whitespace()
                .map(str::to_owned)
                .collect()),
            other => Err(fail_or_unexpected(other)),
        }
    }

    fn sasl_exchange(&mut self, packet: Vec<u8>, opaque: u32) -> Result<SaslOutcome, Error> {
        self.send(&packet)?;
        let reply = self.read_packet()?;
        let (parsed, _) = ParsedResponse::parse(&reply)?;
        check_opaque(opaque, parsed.opaque())?;
        match parsed {
            ParsedResponse::Payload { data, .. } => Ok(SaslOutcome::Done(data.to_vec())),
            ParsedResponse::Success { .. } => Ok(SaslOutcome::Done(Vec::new())),
            ParsedResponse::Fail {
                status: Status::AuthContinue,
                message,
                ..
            } => Ok(SaslOutcome::Continue(message.to_vec())),
            ParsedResponse::Fail {
                status: Status::AuthError,
                message,
                ..
            } => Err(Error::Auth(String::from_utf8_lossy(message).into_owned())),
            other => Err(fail_or_unexpected(other)),
        }
    }

    pub fn sasl_auth(&mut self, mechanism: &[u8], data: &[u8]) -> Result<SaslOutcome, Error> {
        let opaque = self.next_opaque();
        self.sasl_exchange(request::sasl_auth(mechanism, data, opaque), opaque)
    }

    pub fn sasl_step(&mut self, mechanism: &[u8], data: &[u8]) -> Result<SaslOutcome, Error> {
        let opaque = self.next_opaque();
        self.sasl_exchange(request::sasl_step(mechanism, data, opaque), opaque)
    }

    /// One-shot PLAIN authentication.
    pub fn sasl_plain(&mut self, username: &str, password: &str) -> Result<(), Error> {
        let mut data = Vec::with_capacity(username.len() + password.len() + 2);
        data.push(0);
        data.extend_from_slice(username.as_bytes());
        data.push(0);
        data.extend_from_slice(password.as_bytes());
        match self.sasl_auth(b"PLAIN", &data)? {
            SaslOutcome::Done(_) => Ok(()),
            SaslOutcome::Continue(_) => {
                Err(Error::Auth("server requested a step for PLAIN".to_string()))
            }
        }
    }

    pub fn select_bucket(&mut self, name: &[u8]) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::select_bucket(name, opaque), opaque)?;
        Ok(())
    }

    /// `config` is the engine configuration string for the new bucket.
    pub fn create_bucket(&mut self, name: &[u8], config: &[u8]) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::create_bucket(name, config, opaque), opaque)?;
        Ok(())
    }

    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::delete_bucket(name, opaque), opaque)?;
        Ok(())
    }

    // ── Restore ──────────────────────────────────────────────────

    /// Start restoring from a backup file on the node.
    pub fn restore_file(&mut self, name: &[u8]) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::restore_file(name, opaque), opaque)?;
        Ok(())
    }

    pub fn restore_abort(&mut self) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::restore_abort(opaque), opaque)?;
        Ok(())
    }

    pub fn restore_complete(&mut self) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::restore_complete(opaque), opaque)?;
        Ok(())
    }

    // ── vbucket management ───────────────────────────────────────

    pub fn set_vbucket_state(&mut self, vbucket: u16, state: VbucketState) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::set_vbucket_state(vbucket, state, opaque), opaque)?;
        Ok(())
    }

    pub fn get_vbucket_state(&mut self, vbucket: u16) -> Result<VbucketState, Error> {
        let opaque = self.next_opaque();
        self.send(&request::get_vbucket_state(vbucket, opaque))?;
        let reply = self.read_packet()?;
        let (parsed, _) = ParsedResponse::parse(&reply)?;
        check_opaque(opaque, parsed.opaque())?;
        match parsed {
            ParsedResponse::VbucketState { state, .. } => Ok(state),
            other => Err(fail_or_unexpected(other)),
        }
    }

    pub fn delete_vbucket(&mut self, vbucket: u16) -> Result<(), Error> {
        let opaque = self.next_opaque();
        self.mutate(request::delete_vbucket(vbucket, opaque), opaque)?;
        Ok(())
    }

    // ── SYNC and TAP ─────────────────────────────────────────────

    /// Block until the server acknowledges the requested events for the
    /// given keyspecs.
    pub fn sync(&mut self, keyspecs: &[SyncKeyspec], flags: u32) -> Result<Vec<SyncItem>, Error> {
        let opaque = self.next_opaque();
        self.send(&request::sync(keyspecs, flags, opaque))?;
        let reply = self.read_packet()?;
        let (parsed, _) = ParsedResponse::parse(&reply)?;
        check_opaque(opaque, parsed.opaque())?;
        match parsed {
            ParsedResponse::Sync { items, .. } => Ok(items),
            other => Err(fail_or_unexpected(other)),
        }
    }

    /// Open a TAP stream. Consumes the connection: once the server starts
    /// pushing, it is no longer usable for request/response traffic.
    pub fn tap_stream(
        mut self,
        name: &[u8],
        flags: u32,
        backfill_ts: Option<u64>,
    ) -> Result<TapStream, Error> {
        let opaque = self.next_opaque();
        self.send(&request::tap_connect(name, flags, backfill_ts, opaque))?;
        Ok(TapStream { conn: self })
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        CONNECTIONS_CLOSED.increment();
    }
}

/// A connection turned into a one-way TAP stream.
pub struct TapStream {
    conn: Conn,
}

impl TapStream {
    /// Block for the next server-pushed event.
    pub fn next_event(&mut self) -> Result<TapEvent, Error> {
        let packet = self.conn.read_packet()?;
        let (event, _) = TapEvent::parse(&packet)?;
        Ok(event)
    }
}

fn check_opaque(expected: u32, got: u32) -> Result<(), Error> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::OpaqueMismatch { expected, got })
    }
}

fn fail_or_unexpected(parsed: ParsedResponse<'_>) -> Error {
    match parsed {
        ParsedResponse::Fail {
            status, message, ..
        } => Error::from_fail(status, message),
        _ => Error::UnexpectedResponse,
    }
}

fn seed_opaque() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    nanos.wrapping_mul(2_654_435_761) | 1
}
