//! Fixed 24-byte binary protocol headers.
//!
//! Requests and responses share the same header size and layout; the only
//! difference is the magic byte and the meaning of bytes 6..8, which carry
//! the vbucket id on requests and the status code on responses.

use crate::error::ParseError;

/// Magic byte for request packets.
pub const REQ_MAGIC: u8 = 0x80;

/// Magic byte for response packets.
pub const RES_MAGIC: u8 = 0x81;

/// Size of the fixed header, identical for requests and responses.
pub const HEADER_LEN: usize = 24;

/// Binary protocol opcodes understood by this codec.
///
/// This is the membase-era opcode table: the memcached core commands plus
/// the SASL, bucket, vbucket-state, TAP and SYNC extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    SetVbucketState = 0x3d,
    GetVbucketState = 0x3e,
    DeleteVbucket = 0x3f,
    TapConnect = 0x40,
    TapMutation = 0x41,
    TapDelete = 0x42,
    TapFlush = 0x43,
    TapOpaque = 0x44,
    TapVbucketSet = 0x45,
    CreateBucket = 0x85,
    DeleteBucket = 0x86,
    SelectBucket = 0x89,
    EvictKey = 0x93,
    GetLocked = 0x94,
    UnlockKey = 0x95,
    Sync = 0x96,
    RestoreFile = 0x98,
    RestoreAbort = 0x99,
    RestoreComplete = 0x9a,
}

impl Opcode {
    /// Convert a wire byte to an opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::Add),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Delete),
            0x05 => Some(Opcode::Increment),
            0x06 => Some(Opcode::Decrement),
            0x07 => Some(Opcode::Quit),
            0x08 => Some(Opcode::Flush),
            0x09 => Some(Opcode::GetQ),
            0x0a => Some(Opcode::Noop),
            0x0b => Some(Opcode::Version),
            0x0e => Some(Opcode::Append),
            0x0f => Some(Opcode::Prepend),
            0x10 => Some(Opcode::Stat),
            0x1c => Some(Opcode::Touch),
            0x1d => Some(Opcode::Gat),
            0x1e => Some(Opcode::GatQ),
            0x20 => Some(Opcode::SaslListMechs),
            0x21 => Some(Opcode::SaslAuth),
            0x22 => Some(Opcode::SaslStep),
            0x3d => Some(Opcode::SetVbucketState),
            0x3e => Some(Opcode::GetVbucketState),
            0x3f => Some(Opcode::DeleteVbucket),
            0x40 => Some(Opcode::TapConnect),
            0x41 => Some(Opcode::TapMutation),
            0x42 => Some(Opcode::TapDelete),
            0x43 => Some(Opcode::TapFlush),
            0x44 => Some(Opcode::TapOpaque),
            0x45 => Some(Opcode::TapVbucketSet),
            0x85 => Some(Opcode::CreateBucket),
            0x86 => Some(Opcode::DeleteBucket),
            0x89 => Some(Opcode::SelectBucket),
            0x93 => Some(Opcode::EvictKey),
            0x94 => Some(Opcode::GetLocked),
            0x95 => Some(Opcode::UnlockKey),
            0x96 => Some(Opcode::Sync),
            0x98 => Some(Opcode::RestoreFile),
            0x99 => Some(Opcode::RestoreAbort),
            0x9a => Some(Opcode::RestoreComplete),
            _ => None,
        }
    }

    /// Returns true for "quiet" opcodes, which suppress the response on a miss.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Opcode::GetQ | Opcode::GatQ)
    }

    /// Returns true for the TAP stream opcodes the server pushes to the client.
    pub fn is_tap(&self) -> bool {
        matches!(
            self,
            Opcode::TapMutation
                | Opcode::TapDelete
                | Opcode::TapFlush
                | Opcode::TapOpaque
                | Opcode::TapVbucketSet
        )
    }
}

/// Response status codes (membase numbering).
///
/// `NotMyVbucket` (0x07) is not a failure from the dispatcher's point of
/// view: it drives a topology refresh and a re-dispatch of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    NoError = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    ValueTooLarge = 0x0003,
    InvalidArguments = 0x0004,
    ItemNotStored = 0x0005,
    DeltaBadval = 0x0006,
    NotMyVbucket = 0x0007,
    AuthError = 0x0020,
    AuthContinue = 0x0021,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
    NotSupported = 0x0083,
    InternalError = 0x0084,
    Busy = 0x0085,
    TempFailure = 0x0086,
}

impl Status {
    /// Convert a wire status to the typed code.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Status::NoError),
            0x0001 => Some(Status::KeyNotFound),
            0x0002 => Some(Status::KeyExists),
            0x0003 => Some(Status::ValueTooLarge),
            0x0004 => Some(Status::InvalidArguments),
            0x0005 => Some(Status::ItemNotStored),
            0x0006 => Some(Status::DeltaBadval),
            0x0007 => Some(Status::NotMyVbucket),
            0x0020 => Some(Status::AuthError),
            0x0021 => Some(Status::AuthContinue),
            0x0081 => Some(Status::UnknownCommand),
            0x0082 => Some(Status::OutOfMemory),
            0x0083 => Some(Status::NotSupported),
            0x0084 => Some(Status::InternalError),
            0x0085 => Some(Status::Busy),
            0x0086 => Some(Status::TempFailure),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Status::NoError
    }

    /// The numeric wire value.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Short human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::NoError => "no error",
            Status::KeyNotFound => "key not found",
            Status::KeyExists => "key exists",
            Status::ValueTooLarge => "value too large",
            Status::InvalidArguments => "invalid arguments",
            Status::ItemNotStored => "item not stored",
            Status::DeltaBadval => "non-numeric value for incr/decr",
            Status::NotMyVbucket => "not my vbucket",
            Status::AuthError => "authentication failed",
            Status::AuthContinue => "authentication continue",
            Status::UnknownCommand => "unknown command",
            Status::OutOfMemory => "out of memory",
            Status::NotSupported => "not supported",
            Status::InternalError => "internal error",
            Status::Busy => "busy",
            Status::TempFailure => "temporary failure",
        }
    }
}

/// Request header. Bytes 6..8 carry the vbucket id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub vbucket: u16,
    /// Total body length = extras_len + key_len + value length.
    pub body_len: u32,
    /// Correlates the response with this request.
    pub opaque: u32,
    /// Opaque 64-bit compare token; equality only, never arithmetic.
    pub cas: u64,
}

impl RequestHeader {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            key_len: 0,
            extras_len: 0,
            data_type: 0,
            vbucket: 0,
            body_len: 0,
            opaque: 0,
            cas: 0,
        }
    }

    /// Serialize into the fixed big-endian wire layout.
    pub fn pack(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0] = REQ_MAGIC;
        buf[1] = self.opcode as u8;
        buf[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        buf[4] = self.extras_len;
        buf[5] = self.data_type;
        buf[6..8].copy_from_slice(&self.vbucket.to_be_bytes());
        buf[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
    }

    /// Parse the fixed header. Requires exactly `HEADER_LEN` bytes up front;
    /// callers reading from a socket must keep reading until that many bytes
    /// are available, then read `body_len` more.
    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Incomplete);
        }
        if data[0] != REQ_MAGIC {
            return Err(ParseError::BadMagic(data[0]));
        }
        let opcode = Opcode::from_u8(data[1]).ok_or(ParseError::UnknownOpcode(data[1]))?;
        Ok(Self {
            opcode,
            key_len: u16::from_be_bytes([data[2], data[3]]),
            extras_len: data[4],
            data_type: data[5],
            vbucket: u16::from_be_bytes([data[6], data[7]]),
            body_len: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            opaque: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            cas: u64::from_be_bytes([
                data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
            ]),
        })
    }

    /// Length of the value portion of the body. Saturates at zero for a
    /// header whose extras and key lengths overrun the body length; the
    /// parse paths reject such headers as malformed.
    pub fn value_len(&self) -> usize {
        (self.body_len as usize).saturating_sub(self.extras_len as usize + self.key_len as usize)
    }
}

/// Response header. Bytes 6..8 carry the status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: Opcode,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub status: Status,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn new(opcode: Opcode, status: Status) -> Self {
        Self {
            opcode,
            key_len: 0,
            extras_len: 0,
            data_type: 0,
            status,
            body_len: 0,
            opaque: 0,
            cas: 0,
        }
    }

    pub fn pack(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0] = RES_MAGIC;
        buf[1] = self.opcode as u8;
        buf[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        buf[4] = self.extras_len;
        buf[5] = self.data_type;
        buf[6..8].copy_from_slice(&self.status.code().to_be_bytes());
        buf[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
    }

    pub fn unpack(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Incomplete);
        }
        if data[0] != RES_MAGIC {
            return Err(ParseError::BadMagic(data[0]));
        }
        let opcode = Opcode::from_u8(data[1]).ok_or(ParseError::UnknownOpcode(data[1]))?;
        let raw_status = u16::from_be_bytes([data[6], data[7]]);
        let status = Status::from_u16(raw_status).ok_or(ParseError::UnknownStatus(raw_status))?;
        Ok(Self {
            opcode,
            key_len: u16::from_be_bytes([data[2], data[3]]),
            extras_len: data[4],
            data_type: data[5],
            status,
            body_len: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            opaque: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            cas: u64::from_be_bytes([
                data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
            ]),
        })
    }

    /// Length of the value portion of the body. Saturates at zero for a
    /// header whose extras and key lengths overrun the body length; the
    /// parse paths reject such headers as malformed.
    pub fn value_len(&self) -> usize {
        (self.body_len as usize).saturating_sub(self.extras_len as usize + self.key_len as usize)
    }
}
