//! Client-side response parsing.
//!
//! [`ParsedResponse::parse`] consumes one complete response packet and
//! returns a typed view plus the number of bytes consumed. Non-zero status
//! packets become [`ParsedResponse::Fail`] carrying the status and any
//! diagnostic body; `NotMyVbucket` is an ordinary `Fail` here and gains its
//! special re-dispatch meaning one layer up, in the client.

use crate::error::ParseError;
use crate::header::{HEADER_LEN, Opcode, ResponseHeader, Status};
use crate::request::VbucketState;

/// Ack events in a SYNC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncEvent {
    Persisted = 1,
    Modified = 2,
    Deleted = 3,
    Replicated = 4,
    InvalidKey = 5,
    InvalidCas = 6,
}

impl SyncEvent {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SyncEvent::Persisted),
            2 => Some(SyncEvent::Modified),
            3 => Some(SyncEvent::Deleted),
            4 => Some(SyncEvent::Replicated),
            5 => Some(SyncEvent::InvalidKey),
            6 => Some(SyncEvent::InvalidCas),
            _ => None,
        }
    }
}

/// One acknowledgement in a SYNC reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItem {
    pub cas: u64,
    pub vbucket: u16,
    pub key: Vec<u8>,
    pub event: SyncEvent,
}

/// A parsed response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponse<'a> {
    /// GET / GETQ / GAT / GET_LOCKED hit: 4-byte flags extra, then the value.
    Value {
        opcode: Opcode,
        opaque: u32,
        cas: u64,
        flags: u32,
        value: &'a [u8],
    },
    /// INCREMENT / DECREMENT: 8-byte counter value in the body.
    Counter { opaque: u32, cas: u64, value: u64 },
    /// One STAT entry. The terminator has an empty key and empty value.
    Stat {
        opaque: u32,
        key: &'a [u8],
        value: &'a [u8],
    },
    Version { opaque: u32, version: &'a [u8] },
    /// GET_VBUCKET_STATE reply.
    VbucketState { opaque: u32, state: VbucketState },
    /// SYNC reply: one ack per keyspec.
    Sync { opaque: u32, items: Vec<SyncItem> },
    /// SASL list-mechs / auth payloads and any other success with a body
    /// the caller interprets (e.g. "PLAIN CRAM-MD5").
    Payload {
        opcode: Opcode,
        opaque: u32,
        data: &'a [u8],
    },
    /// Bodyless success (SET, DELETE, TOUCH, NOOP, ...). CAS is the
    /// mutation token for store operations.
    Success {
        opcode: Opcode,
        opaque: u32,
        cas: u64,
    },
    /// Non-zero status. `AuthContinue` also lands here; its body is the
    /// server's SASL challenge.
    Fail {
        opcode: Opcode,
        status: Status,
        opaque: u32,
        message: &'a [u8],
    },
}

impl<'a> ParsedResponse<'a> {
    /// Parse one response packet. Returns the packet and its total length.
    pub fn parse(data: &'a [u8]) -> Result<(Self, usize), ParseError> {
        let header = ResponseHeader::unpack(data)?;

        let total_len = HEADER_LEN + header.body_len as usize;
        if data.len() < total_len {
            return Err(ParseError::Incomplete);
        }

        let extras_len = header.extras_len as usize;
        let key_len = header.key_len as usize;
        if extras_len + key_len > header.body_len as usize {
            return Err(ParseError::Malformed("extras + key exceed body length"));
        }

        let body = &data[HEADER_LEN..total_len];

        if !header.status.is_success() {
            return Ok((
                ParsedResponse::Fail {
                    opcode: header.opcode,
                    status: header.status,
                    opaque: header.opaque,
                    message: body,
                },
                total_len,
            ));
        }

        let parsed = match header.opcode {
            Opcode::Get | Opcode::GetQ | Opcode::Gat | Opcode::GatQ | Opcode::GetLocked => {
                if extras_len < 4 {
                    return Err(ParseError::Malformed("get reply missing flags extra"));
                }
                let flags = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                ParsedResponse::Value {
                    opcode: header.opcode,
                    opaque: header.opaque,
                    cas: header.cas,
                    flags,
                    value: &body[extras_len + key_len..],
                }
            }
            Opcode::Increment | Opcode::Decrement => {
                if body.len() < 8 {
                    return Err(ParseError::Malformed("counter reply shorter than 8 bytes"));
                }
                let value = u64::from_be_bytes([
                    body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
                ]);
                ParsedResponse::Counter {
                    opaque: header.opaque,
                    cas: header.cas,
                    value,
                }
            }
            Opcode::Stat => ParsedResponse::Stat {
                opaque: header.opaque,
                key: &body[..key_len],
                value: &body[key_len..],
            },
            Opcode::Version => ParsedResponse::Version {
                opaque: header.opaque,
                version: body,
            },
            Opcode::GetVbucketState => {
                if body.len() < 4 {
                    return Err(ParseError::Malformed("vbucket state reply too short"));
                }
                let raw = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                let state = VbucketState::from_u32(raw)
                    .ok_or(ParseError::Malformed("unknown vbucket state"))?;
                ParsedResponse::VbucketState {
                    opaque: header.opaque,
                    state,
                }
            }
            Opcode::Sync => ParsedResponse::Sync {
                opaque: header.opaque,
                items: decode_sync_items(body)?,
            },
            Opcode::SaslListMechs | Opcode::SaslAuth | Opcode::SaslStep => {
                ParsedResponse::Payload {
                    opcode: header.opcode,
                    opaque: header.opaque,
                    data: body,
                }
            }
            _ => ParsedResponse::Success {
                opcode: header.opcode,
                opaque: header.opaque,
                cas: header.cas,
            },
        };

        Ok((parsed, total_len))
    }

    /// The opaque echoed from the request.
    pub fn opaque(&self) -> u32 {
        match self {
            ParsedResponse::Value { opaque, .. }
            | ParsedResponse::Counter { opaque, .. }
            | ParsedResponse::Stat { opaque, .. }
            | ParsedResponse::Version { opaque, .. }
            | ParsedResponse::VbucketState { opaque, .. }
            | ParsedResponse::Sync { opaque, .. }
            | ParsedResponse::Payload { opaque, .. }
            | ParsedResponse::Success { opaque, .. }
            | ParsedResponse::Fail { opaque, .. } => *opaque,
        }
    }
}

/// Decode a SYNC reply body: 2-byte count, then per item an 8-byte cas,
/// 2-byte vbucket, 2-byte key length, 1-byte event, and the key.
fn decode_sync_items(body: &[u8]) -> Result<Vec<SyncItem>, ParseError> {
    if body.len() < 2 {
        return Err(ParseError::Malformed("sync reply shorter than count field"));
    }
    let count = u16::from_be_bytes([body[0], body[1]]) as usize;
    let mut items = Vec::with_capacity(count);
    let mut at = 2;
    for _ in 0..count {
        if body.len() < at + 13 {
            return Err(ParseError::Malformed("sync reply truncated"));
        }
        let cas = u64::from_be_bytes([
            body[at],
            body[at + 1],
            body[at + 2],
            body[at + 3],
            body[at + 4],
            body[at + 5],
            body[at + 6],
            body[at + 7],
        ]);
        let vbucket = u16::from_be_bytes([body[at + 8], body[at + 9]]);
        let key_len = u16::from_be_bytes([body[at + 10], body[at + 11]]) as usize;
        let event = SyncEvent::from_u8(body[at + 12])
            .ok_or(ParseError::Malformed("unknown sync event"))?;
        at += 13;
        if body.len() < at + key_len {
            return Err(ParseError::Malformed("sync reply key truncated"));
        }
        items.push(SyncItem {
            cas,
            vbucket,
            key: body[at..at + key_len].to_vec(),
            event,
        });
        at += key_len;
    }
    Ok(items)
}

/// Encode a SYNC reply body. Server-side counterpart of
/// [`decode_sync_items`], used by the in-tree mock server.
pub fn encode_sync_items(items: &[SyncItem]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + items.len() * 16);
    body.extend_from_slice(&(items.len() as u16).to_be_bytes());
    for item in items {
        body.extend_from_slice(&item.cas.to_be_bytes());
        body.extend_from_slice(&item.vbucket.to_be_bytes());
        body.extend_from_slice(&(item.key.len() as u16).to_be_bytes());
        body.push(item.event as u8);
        body.extend_from_slice(&item.key);
    }
    body
}

/// One event read off a TAP stream.
///
/// TAP packets arrive with the *request* magic: after `tap_connect` the
/// server pushes commands at the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapEvent {
    Mutation {
        vbucket: u16,
        cas: u64,
        flags: u32,
        expiration: u32,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        vbucket: u16,
        cas: u64,
        key: Vec<u8>,
    },
    Flush,
    Opaque {
        vbucket: u16,
        data: Vec<u8>,
    },
    VbucketSet {
        vbucket: u16,
        state: VbucketState,
    },
}

impl TapEvent {
    /// Parse one TAP packet. Mutation extras are 16 bytes (engine-private
    /// length, tap flags, ttl, reserved, item flags, item expiry); the
    /// other events carry the 8-byte prefix only.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let header = crate::header::RequestHeader::unpack(data)?;
        if !header.opcode.is_tap() {
            return Err(ParseError::Malformed("not a tap opcode"));
        }

        let total_len = HEADER_LEN + header.body_len as usize;
        if data.len() < total_len {
            return Err(ParseError::Incomplete);
        }

        let extras_len = header.extras_len as usize;
        let key_len = header.key_len as usize;
        if extras_len + key_len > header.body_len as usize {
            return Err(ParseError::Malformed("extras + key exceed body length"));
        }

        let body = &data[HEADER_LEN..total_len];
        if extras_len < 8 {
            return Err(ParseError::Malformed("tap extras shorter than 8 bytes"));
        }
        let engine_len = u16::from_be_bytes([body[0], body[1]]) as usize;

        let event = match header.opcode {
            Opcode::TapMutation => {
                if extras_len < 16 {
                    return Err(ParseError::Malformed("tap mutation extras too short"));
                }
                let flags = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
                let expiration = u32::from_be_bytes([body[12], body[13], body[14], body[15]]);
                let key_start = extras_len + engine_len;
                if key_start + key_len > body.len() {
                    return Err(ParseError::Malformed("tap mutation key truncated"));
                }
                TapEvent::Mutation {
                    vbucket: header.vbucket,
                    cas: header.cas,
                    flags,
                    expiration,
                    key: body[key_start..key_start + key_len].to_vec(),
                    value: body[key_start + key_len..].to_vec(),
                }
            }
            Opcode::TapDelete => {
                let key_start = extras_len + engine_len;
                if key_start + key_len > body.len() {
                    return Err(ParseError::Malformed("tap delete key truncated"));
                }
                TapEvent::Delete {
                    vbucket: header.vbucket,
                    cas: header.cas,
                    key: body[key_start..key_start + key_len].to_vec(),
                }
            }
            Opcode::TapFlush => TapEvent::Flush,
            Opcode::TapOpaque => TapEvent::Opaque {
                vbucket: header.vbucket,
                data: body[extras_len..].to_vec(),
            },
            Opcode::TapVbucketSet => {
                let rest = &body[extras_len..];
                if rest.len() < 4 {
                    return Err(ParseError::Malformed("tap vbucket-set missing state"));
                }
                let raw = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let state = VbucketState::from_u32(raw)
                    .ok_or(ParseError::Malformed("unknown vbucket state"))?;
                TapEvent::VbucketSet {
                    vbucket: header.vbucket,
                    state,
                }
            }
            _ => unreachable!("is_tap() checked above"),
        };

        Ok((event, total_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::RequestHeader;

    fn response_bytes(header: &ResponseHeader, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        let mut head = [0u8; HEADER_LEN];
        header.pack(&mut head);
        buf.copy_from_slice(&head);
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn parse_get_hit() {
        let mut header = ResponseHeader::new(Opcode::Get, Status::NoError);
        header.extras_len = 4;
        header.body_len = 4 + 5;
        header.opaque = 11;
        header.cas = 900;
        let mut body = 7u32.to_be_bytes().to_vec();
        body.extend_from_slice(b"world");
        let data = response_bytes(&header, &body);

        let (parsed, used) = ParsedResponse::parse(&data).unwrap();
        assert_eq!(used, data.len());
        match parsed {
            ParsedResponse::Value {
                opaque,
                cas,
                flags,
                value,
                ..
            } => {
                assert_eq!(opaque, 11);
                assert_eq!(cas, 900);
                assert_eq!(flags, 7);
                assert_eq!(value, b"world");
            }
            other => panic!("expected Value, got {other:?}"),
        }
    }

    #[test]
    fn parse_counter() {
        let mut header = ResponseHeader::new(Opcode::Increment, Status::NoError);
        header.body_len = 8;
        header.cas = 3;
        let data = response_bytes(&header, &42u64.to_be_bytes());

        let (parsed, _) = ParsedResponse::parse(&data).unwrap();
        assert_eq!(
            parsed,
            ParsedResponse::Counter {
                opaque: 0,
                cas: 3,
                value: 42
            }
        );
    }

    #[test]
    fn parse_not_my_vbucket_fail() {
        let mut header = ResponseHeader::new(Opcode::Set, Status::NotMyVbucket);
        header.body_len = 3;
        header.opaque = 4;
        let data = response_bytes(&header, b"nmv");

        let (parsed, _) = ParsedResponse::parse(&data).unwrap();
        match parsed {
            ParsedResponse::Fail {
                status, message, ..
            } => {
                assert_eq!(status, Status::NotMyVbucket);
                assert_eq!(message, b"nmv");
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn parse_incomplete_body() {
        let mut header = ResponseHeader::new(Opcode::Get, Status::NoError);
        header.extras_len = 4;
        header.body_len = 20;
        let mut data = vec![0u8; HEADER_LEN];
        let mut head = [0u8; HEADER_LEN];
        header.pack(&mut head);
        data.copy_from_slice(&head);
        data.extend_from_slice(&[0u8; 4]);

        assert!(matches!(
            ParsedResponse::parse(&data),
            Err(ParseError::Incomplete)
        ));
    }

    #[test]
    fn parse_rejects_inconsistent_lengths() {
        let mut header = ResponseHeader::new(Opcode::Get, Status::NoError);
        header.extras_len = 10;
        header.key_len = 10;
        header.body_len = 5;
        let data = response_bytes(&header, &[0u8; 5]);
        assert!(matches!(
            ParsedResponse::parse(&data),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn stat_entry_and_terminator() {
        let mut header = ResponseHeader::new(Opcode::Stat, Status::NoError);
        header.key_len = 3;
        header.body_len = 3 + 2;
        header.opaque = 1;
        let data = response_bytes(&header, b"pid42");
        let (parsed, _) = ParsedResponse::parse(&data).unwrap();
        assert_eq!(
            parsed,
            ParsedResponse::Stat {
                opaque: 1,
                key: b"pid",
                value: b"42"
            }
        );

        let terminator = ResponseHeader::new(Opcode::Stat, Status::NoError);
        let data = response_bytes(&terminator, &[]);
        let (parsed, _) = ParsedResponse::parse(&data).unwrap();
        assert_eq!(
            parsed,
            ParsedResponse::Stat {
                opaque: 0,
                key: b"",
                value: b""
            }
        );
    }

    #[test]
    fn sync_items_round_trip() {
        let items = vec![
            SyncItem {
                cas: 10,
                vbucket: 3,
                key: b"alpha".to_vec(),
                event: SyncEvent::Persisted,
            },
            SyncItem {
                cas: 0,
                vbucket: 9,
                key: b"b".to_vec(),
                event: SyncEvent::InvalidCas,
            },
        ];
        let body = encode_sync_items(&items);

        let mut header = ResponseHeader::new(Opcode::Sync, Status::NoError);
        header.body_len = body.len() as u32;
        header.opaque = 2;
        let data = response_bytes(&header, &body);

        let (parsed, _) = ParsedResponse::parse(&data).unwrap();
        assert_eq!(
            parsed,
            ParsedResponse::Sync {
                opaque: 2,
                items
            }
        );
    }

    #[test]
    fn tap_mutation_round_trip() {
        // Build a TAP_MUTATION request packet by hand.
        let key = b"doc";
        let value = b"payload";
        let mut extras = [0u8; 16];
        extras[8..12].copy_from_slice(&5u32.to_be_bytes());
        extras[12..16].copy_from_slice(&60u32.to_be_bytes());

        let mut header = RequestHeader::new(Opcode::TapMutation);
        header.extras_len = 16;
        header.key_len = key.len() as u16;
        header.vbucket = 8;
        header.cas = 77;
        header.body_len = (16 + key.len() + value.len()) as u32;

        let mut data = vec![0u8; HEADER_LEN];
        let mut head = [0u8; HEADER_LEN];
        header.pack(&mut head);
        data.copy_from_slice(&head);
        data.extend_from_slice(&extras);
        data.extend_from_slice(key);
        data.extend_from_slice(value);

        let (event, used) = TapEvent::parse(&data).unwrap();
        assert_eq!(used, data.len());
        assert_eq!(
            event,
            TapEvent::Mutation {
                vbucket: 8,
                cas: 77,
                flags: 5,
                expiration: 60,
                key: key.to_vec(),
                value: value.to_vec(),
            }
        );
    }

    #[test]
    fn tap_rejects_non_tap_opcode() {
        let mut header = RequestHeader::new(Opcode::Get);
        header.key_len = 1;
        header.body_len = 1;
        let mut data = vec![0u8; HEADER_LEN];
        let mut head = [0u8; HEADER_LEN];
        header.pack(&mut head);
        data.copy_from_slice(&head);
        data.push(b'k');
        assert!(matches!(
            TapEvent::parse(&data),
            Err(ParseError::Malformed(_))
        ));
    }
}
