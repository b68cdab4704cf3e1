//! Binary protocol codec for membase-flavored memcached.
//!
//! Covers the fixed 24-byte header, the membase opcode and status tables,
//! request encoding, response parsing, and the TAP and SYNC extensions.
//! The codec is transport-agnostic: it never reads sockets, it only turns
//! byte slices into typed packets and back.

mod command;
mod error;
mod header;
mod response;

/// Request encoders; call sites read as `request::get(..)`.
pub mod request;

pub use command::{Command, ResponseWriter, SyncSpec};
pub use error::ParseError;
pub use header::{
    HEADER_LEN, Opcode, REQ_MAGIC, RES_MAGIC, RequestHeader, ResponseHeader, Status,
};
pub use request::{SyncKeyspec, VbucketState, sync_flags, tap_flags};
pub use response::{ParsedResponse, SyncEvent, SyncItem, TapEvent, encode_sync_items};
