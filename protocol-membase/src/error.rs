//! Codec error type.

/// Errors produced while encoding or parsing binary protocol packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data. Not fatal: buffer more bytes and retry.
    #[error("incomplete packet")]
    Incomplete,

    /// Packet structure violates the protocol.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// First byte is neither the request nor the response magic.
    #[error("bad magic byte: {0:#04x}")]
    BadMagic(u8),

    /// Opcode byte is not in the known table.
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// Status field is not in the known table.
    #[error("unknown status: {0:#06x}")]
    UnknownStatus(u16),
}

impl ParseError {
    /// True when the caller should read more bytes and retry.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }
}
