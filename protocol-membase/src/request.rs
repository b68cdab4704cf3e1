//! Client-side request encoding.
//!
//! Every encoder produces one complete wire packet: the 24-byte header
//! followed by extras, key, and value in that order. Encoders for keyed
//! operations take the vbucket id the key hashes to; the opaque is chosen
//! by the caller and echoed back by the server.

use crate::header::{HEADER_LEN, Opcode, RequestHeader};

/// vbucket states for [`set_vbucket_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VbucketState {
    Active = 1,
    Replica = 2,
    Pending = 3,
    Dead = 4,
}

impl VbucketState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(VbucketState::Active),
            2 => Some(VbucketState::Replica),
            3 => Some(VbucketState::Pending),
            4 => Some(VbucketState::Dead),
            _ => None,
        }
    }
}

/// One key in a SYNC request: which vbucket it lives in and, optionally,
/// the CAS the caller wants acknowledged (0 = any mutation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncKeyspec {
    pub cas: u64,
    pub vbucket: u16,
    pub key: Vec<u8>,
}

/// Assemble a packet from its parts. Body order is extras, key, value.
fn frame(
    opcode: Opcode,
    vbucket: u16,
    cas: u64,
    opaque: u32,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    debug_assert!(extras.len() <= u8::MAX as usize);
    debug_assert!(key.len() <= u16::MAX as usize);

    let mut header = RequestHeader::new(opcode);
    header.key_len = key.len() as u16;
    header.extras_len = extras.len() as u8;
    header.vbucket = vbucket;
    header.body_len = (extras.len() + key.len() + value.len()) as u32;
    header.opaque = opaque;
    header.cas = cas;

    let mut buf = Vec::with_capacity(HEADER_LEN + header.body_len as usize);
    let mut head = [0u8; HEADER_LEN];
    header.pack(&mut head);
    buf.extend_from_slice(&head);
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

pub fn get(key: &[u8], vbucket: u16, opaque: u32) -> Vec<u8> {
    frame(Opcode::Get, vbucket, 0, opaque, &[], key, &[])
}

/// Quiet GET: the server sends no response on a miss. Used by the
/// multi-get pipeline, terminated by a [`noop`] sentinel.
pub fn getq(key: &[u8], vbucket: u16, opaque: u32) -> Vec<u8> {
    frame(Opcode::GetQ, vbucket, 0, opaque, &[], key, &[])
}

fn store_extras(flags: u32, expiration: u32) -> [u8; 8] {
    let mut extras = [0u8; 8];
    extras[..4].copy_from_slice(&flags.to_be_bytes());
    extras[4..].copy_from_slice(&expiration.to_be_bytes());
    extras
}

/// SET is an upsert. A non-zero `cas` turns it into a compare-and-swap:
/// the server rejects with `KeyExists` when the live CAS differs.
pub fn set(
    key: &[u8],
    value: &[u8],
    vbucket: u16,
    flags: u32,
    expiration: u32,
    cas: u64,
    opaque: u32,
) -> Vec<u8> {
    let extras = store_extras(flags, expiration);
    frame(Opcode::Set, vbucket, cas, opaque, &extras, key, value)
}

/// ADD fails with `KeyExists` when the key is already stored.
pub fn add(
    key: &[u8],
    value: &[u8],
    vbucket: u16,
    flags: u32,
    expiration: u32,
    opaque: u32,
) -> Vec<u8> {
    let extras = store_extras(flags, expiration);
    frame(Opcode::Add, vbucket, 0, opaque, &extras, key, value)
}

/// REPLACE fails with `KeyNotFound` when the key is absent.
pub fn replace(
    key: &[u8],
    value: &[u8],
    vbucket: u16,
    flags: u32,
    expiration: u32,
    cas: u64,
    opaque: u32,
) -> Vec<u8> {
    let extras = store_extras(flags, expiration);
    frame(Opcode::Replace, vbucket, cas, opaque, &extras, key, value)
}

/// A non-zero `cas` makes the delete conditional.
pub fn delete(key: &[u8], vbucket: u16, cas: u64, opaque: u32) -> Vec<u8> {
    frame(Opcode::Delete, vbucket, cas, opaque, &[], key, &[])
}

fn counter_extras(delta: u64, initial: u64, expiration: u32) -> [u8; 20] {
    let mut extras = [0u8; 20];
    extras[..8].copy_from_slice(&delta.to_be_bytes());
    extras[8..16].copy_from_slice(&initial.to_be_bytes());
    extras[16..].copy_from_slice(&expiration.to_be_bytes());
    extras
}

pub fn increment(
    key: &[u8],
    vbucket: u16,
    delta: u64,
    initial: u64,
    expiration: u32,
    opaque: u32,
) -> Vec<u8> {
    let extras = counter_extras(delta, initial, expiration);
    frame(Opcode::Increment, vbucket, 0, opaque, &extras, key, &[])
}

pub fn decrement(
    key: &[u8],
    vbucket: u16,
    delta: u64,
    initial: u64,
    expiration: u32,
    opaque: u32,
) -> Vec<u8> {
    let extras = counter_extras(delta, initial, expiration);
    frame(Opcode::Decrement, vbucket, 0, opaque, &extras, key, &[])
}

/// The fragment is concatenated server-side; the client never sends
/// the full document.
pub fn append(key: &[u8], value: &[u8], vbucket: u16, cas: u64, opaque: u32) -> Vec<u8> {
    frame(Opcode::Append, vbucket, cas, opaque, &[], key, value)
}

pub fn prepend(key: &[u8], value: &[u8], vbucket: u16, cas: u64, opaque: u32) -> Vec<u8> {
    frame(Opcode::Prepend, vbucket, cas, opaque, &[], key, value)
}

pub fn touch(key: &[u8], vbucket: u16, expiration: u32, opaque: u32) -> Vec<u8> {
    frame(
        Opcode::Touch,
        vbucket,
        0,
        opaque,
        &expiration.to_be_bytes(),
        key,
        &[],
    )
}

/// Get-and-touch: reads the value and updates the expiry in one round trip.
pub fn gat(key: &[u8], vbucket: u16, expiration: u32, opaque: u32) -> Vec<u8> {
    frame(
        Opcode::Gat,
        vbucket,
        0,
        opaque,
        &expiration.to_be_bytes(),
        key,
        &[],
    )
}

pub fn get_locked(key: &[u8], vbucket: u16, lock_expiry: u32, opaque: u32) -> Vec<u8> {
    frame(
        Opcode::GetLocked,
        vbucket,
        0,
        opaque,
        &lock_expiry.to_be_bytes(),
        key,
        &[],
    )
}

pub fn unlock(key: &[u8], vbucket: u16, cas: u64, opaque: u32) -> Vec<u8> {
    frame(Opcode::UnlockKey, vbucket, cas, opaque, &[], key, &[])
}

pub fn evict(key: &[u8], vbucket: u16, opaque: u32) -> Vec<u8> {
    frame(Opcode::EvictKey, vbucket, 0, opaque, &[], key, &[])
}

pub fn noop(opaque: u32) -> Vec<u8> {
    frame(Opcode::Noop, 0, 0, opaque, &[], &[], &[])
}

pub fn version(opaque: u32) -> Vec<u8> {
    frame(Opcode::Version, 0, 0, opaque, &[], &[], &[])
}

pub fn quit(opaque: u32) -> Vec<u8> {
    frame(Opcode::Quit, 0, 0, opaque, &[], &[], &[])
}

/// `sub` selects a stat group; empty requests the default group.
pub fn stat(sub: &[u8], opaque: u32) -> Vec<u8> {
    frame(Opcode::Stat, 0, 0, opaque, &[], sub, &[])
}

/// `expiration` of 0 flushes immediately and sends no extras.
pub fn flush(expiration: u32, opaque: u32) -> Vec<u8> {
    if expiration == 0 {
        frame(Opcode::Flush, 0, 0, opaque, &[], &[], &[])
    } else {
        frame(
            Opcode::Flush,
            0,
            0,
            opaque,
            &expiration.to_be_bytes(),
            &[],
            &[],
        )
    }
}

pub fn sasl_list_mechs(opaque: u32) -> Vec<u8> {
    frame(Opcode::SaslListMechs, 0, 0, opaque, &[], &[], &[])
}

/// Key carries the mechanism name, value the initial client response.
pub fn sasl_auth(mechanism: &[u8], data: &[u8], opaque: u32) -> Vec<u8> {
    frame(Opcode::SaslAuth, 0, 0, opaque, &[], mechanism, data)
}

pub fn sasl_step(mechanism: &[u8], data: &[u8], opaque: u32) -> Vec<u8> {
    frame(Opcode::SaslStep, 0, 0, opaque, &[], mechanism, data)
}

pub fn select_bucket(name: &[u8], opaque: u32) -> Vec<u8> {
    frame(Opcode::SelectBucket, 0, 0, opaque, &[], name, &[])
}

/// Value carries the engine configuration string.
pub fn create_bucket(name: &[u8], config: &[u8], opaque: u32) -> Vec<u8> {
    frame(Opcode::CreateBucket, 0, 0, opaque, &[], name, config)
}

pub fn delete_bucket(name: &[u8], opaque: u32) -> Vec<u8> {
    frame(Opcode::DeleteBucket, 0, 0, opaque, &[], name, &[])
}

pub fn set_vbucket_state(vbucket: u16, state: VbucketState, opaque: u32) -> Vec<u8> {
    frame(
        Opcode::SetVbucketState,
        vbucket,
        0,
        opaque,
        &(state as u32).to_be_bytes(),
        &[],
        &[],
    )
}

pub fn get_vbucket_state(vbucket: u16, opaque: u32) -> Vec<u8> {
    frame(Opcode::GetVbucketState, vbucket, 0, opaque, &[], &[], &[])
}

pub fn delete_vbucket(vbucket: u16, opaque: u32) -> Vec<u8> {
    frame(Opcode::DeleteVbucket, vbucket, 0, opaque, &[], &[], &[])
}

/// Begin restoring from a backup file on the node; the key names the file.
pub fn restore_file(name: &[u8], opaque: u32) -> Vec<u8> {
    frame(Opcode::RestoreFile, 0, 0, opaque, &[], name, &[])
}

pub fn restore_abort(opaque: u32) -> Vec<u8> {
    frame(Opcode::RestoreAbort, 0, 0, opaque, &[], &[], &[])
}

pub fn restore_complete(opaque: u32) -> Vec<u8> {
    frame(Opcode::RestoreComplete, 0, 0, opaque, &[], &[], &[])
}

/// TAP connect flags.
pub mod tap_flags {
    pub const BACKFILL: u32 = 0x01;
    pub const DUMP: u32 = 0x02;
    pub const LIST_VBUCKETS: u32 = 0x04;
    pub const TAKEOVER_VBUCKETS: u32 = 0x08;
}

/// Open a TAP stream. With `BACKFILL`, `backfill_ts` names the point the
/// backfill starts from and is carried as an 8-byte value.
pub fn tap_connect(name: &[u8], flags: u32, backfill_ts: Option<u64>, opaque: u32) -> Vec<u8> {
    let value;
    let value_bytes: &[u8] = match backfill_ts {
        Some(ts) => {
            value = ts.to_be_bytes();
            &value
        }
        None => &[],
    };
    frame(
        Opcode::TapConnect,
        0,
        0,
        opaque,
        &flags.to_be_bytes(),
        name,
        value_bytes,
    )
}

/// SYNC flags: which acknowledgements the caller wants.
pub mod sync_flags {
    pub const PERSIST: u32 = 0x01;
    pub const MUTATION: u32 = 0x02;
    pub const DELETION: u32 = 0x04;
    pub const REPLICATE: u32 = 0x08;
}

/// Body layout: 4-byte flags, 2-byte keyspec count, then per keyspec
/// an 8-byte cas, 2-byte vbucket, 2-byte key length, and the key.
pub fn sync(keyspecs: &[SyncKeyspec], flags: u32, opaque: u32) -> Vec<u8> {
    debug_assert!(keyspecs.len() <= u16::MAX as usize);
    let mut value = Vec::with_capacity(6 + keyspecs.len() * 16);
    value.extend_from_slice(&flags.to_be_bytes());
    value.extend_from_slice(&(keyspecs.len() as u16).to_be_bytes());
    for spec in keyspecs {
        value.extend_from_slice(&spec.cas.to_be_bytes());
        value.extend_from_slice(&spec.vbucket.to_be_bytes());
        value.extend_from_slice(&(spec.key.len() as u16).to_be_bytes());
        value.extend_from_slice(&spec.key);
    }
    frame(Opcode::Sync, 0, 0, opaque, &[], &[], &value)
}
