//! Server-side request parsing and response encoding.
//!
//! This is the other half of the codec: [`Command::parse`] turns a request
//! packet into a typed command, and [`ResponseWriter`] builds the matching
//! reply packets. The client crate's test harness uses these to stand up an
//! in-process server speaking the same wire format.

use crate::error::ParseError;
use crate::header::{HEADER_LEN, Opcode, RequestHeader, ResponseHeader, Status};
use crate::request::VbucketState;

/// One keyspec decoded from a SYNC request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSpec<'a> {
    pub cas: u64,
    pub vbucket: u16,
    pub key: &'a [u8],
}

/// A parsed request packet, borrowed from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Get {
        opcode: Opcode,
        vbucket: u16,
        opaque: u32,
        key: &'a [u8],
    },
    /// SET / ADD / REPLACE share the 8-byte flags+expiration extras.
    Store {
        opcode: Opcode,
        vbucket: u16,
        opaque: u32,
        cas: u64,
        flags: u32,
        expiration: u32,
        key: &'a [u8],
        value: &'a [u8],
    },
    Delete {
        vbucket: u16,
        opaque: u32,
        cas: u64,
        key: &'a [u8],
    },
    Counter {
        opcode: Opcode,
        vbucket: u16,
        opaque: u32,
        delta: u64,
        initial: u64,
        expiration: u32,
        key: &'a [u8],
    },
    /// APPEND / PREPEND.
    Concat {
        opcode: Opcode,
        vbucket: u16,
        opaque: u32,
        cas: u64,
        key: &'a [u8],
        value: &'a [u8],
    },
    /// TOUCH / GAT / GET_LOCKED: a 4-byte expiry extra plus the key.
    Expiry {
        opcode: Opcode,
        vbucket: u16,
        opaque: u32,
        expiration: u32,
        key: &'a [u8],
    },
    Unlock {
        vbucket: u16,
        opaque: u32,
        cas: u64,
        key: &'a [u8],
    },
    Evict {
        vbucket: u16,
        opaque: u32,
        key: &'a [u8],
    },
    Noop {
        opaque: u32,
    },
    Version {
        opaque: u32,
    },
    Quit {
        opaque: u32,
    },
    Stat {
        opaque: u32,
        sub: &'a [u8],
    },
    Flush {
        opaque: u32,
        expiration: u32,
    },
    SaslListMechs {
        opaque: u32,
    },
    /// SASL_AUTH / SASL_STEP.
    Sasl {
        opcode: Opcode,
        opaque: u32,
        mechanism: &'a [u8],
        data: &'a [u8],
    },
    SelectBucket {
        opaque: u32,
        name: &'a [u8],
    },
    SetVbucketState {
        vbucket: u16,
        opaque: u32,
        state: VbucketState,
    },
    GetVbucketState {
        vbucket: u16,
        opaque: u32,
    },
    Sync {
        opaque: u32,
        flags: u32,
        specs: Vec<SyncSpec<'a>>,
    },
    TapConnect {
        opaque: u32,
        flags: u32,
        name: &'a [u8],
    },
    /// Any request this server does not model; answered with
    /// `UnknownCommand`.
    Other {
        opcode: Opcode,
        opaque: u32,
    },
}

impl<'a> Command<'a> {
    /// Parse one request packet. Returns the command and its total length.
    pub fn parse(data: &'a [u8]) -> Result<(Self, usize), ParseError> {
        let header = RequestHeader::unpack(data)?;

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
        let extras = &body[..extras_len];
        let key = &body[extras_len..extras_len + key_len];
        let value = &body[extras_len + key_len..];

        let command = match header.opcode {
            Opcode::Get | Opcode::GetQ => Command::Get {
                opcode: header.opcode,
                vbucket: header.vbucket,
                opaque: header.opaque,
                key,
            },
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                if extras.len() < 8 {
                    return Err(ParseError::Malformed("store missing flags extras"));
                }
                Command::Store {
                    opcode: header.opcode,
                    vbucket: header.vbucket,
                    opaque: header.opaque,
                    cas: header.cas,
                    flags: u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
                    expiration: u32::from_be_bytes([extras[4], extras[5], extras[6], extras[7]]),
                    key,
                    value,
                }
            }
            Opcode::Delete => Command::Delete {
                vbucket: header.vbucket,
                opaque: header.opaque,
                cas: header.cas,
                key,
            },
            Opcode::Increment | Opcode::Decrement => {
                if extras.len() < 20 {
                    return Err(ParseError::Malformed("counter missing extras"));
                }
                Command::Counter {
                    opcode: header.opcode,
                    vbucket: header.vbucket,
                    opaque: header.opaque,
                    delta: u64::from_be_bytes([
                        extras[0], extras[1], extras[2], extras[3], extras[4], extras[5],
                        extras[6], extras[7],
                    ]),
                    initial: u64::from_be_bytes([
                        extras[8], extras[9], extras[10], extras[11], extras[12], extras[13],
                        extras[14], extras[15],
                    ]),
                    expiration: u32::from_be_bytes([
                        extras[16], extras[17], extras[18], extras[19],
                    ]),
                    key,
                }
            }
            Opcode::Append | Opcode::Prepend => Command::Concat {
                opcode: header.opcode,
                vbucket: header.vbucket,
                opaque: header.opaque,
                cas: header.cas,
                key,
                value,
            },
            Opcode::Touch | Opcode::Gat | Opcode::GatQ | Opcode::GetLocked => {
                if extras.len() < 4 {
                    return Err(ParseError::Malformed("missing expiry extras"));
                }
                Command::Expiry {
                    opcode: header.opcode,
                    vbucket: header.vbucket,
                    opaque: header.opaque,
                    expiration: u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
                    key,
                }
            }
            Opcode::UnlockKey => Command::Unlock {
                vbucket: header.vbucket,
                opaque: header.opaque,
                cas: header.cas,
                key,
            },
            Opcode::EvictKey => Command::Evict {
                vbucket: header.vbucket,
                opaque: header.opaque,
                key,
            },
            Opcode::Noop => Command::Noop {
                opaque: header.opaque,
            },
            Opcode::Version => Command::Version {
                opaque: header.opaque,
            },
            Opcode::Quit => Command::Quit {
                opaque: header.opaque,
            },
            Opcode::Stat => Command::Stat {
                opaque: header.opaque,
                sub: key,
            },
            Opcode::Flush => {
                let expiration = if extras.len() >= 4 {
                    u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
                } else {
                    0
                };
                Command::Flush {
                    opaque: header.opaque,
                    expiration,
                }
            }
            Opcode::SaslListMechs => Command::SaslListMechs {
                opaque: header.opaque,
            },
            Opcode::SaslAuth | Opcode::SaslStep => Command::Sasl {
                opcode: header.opcode,
                opaque: header.opaque,
                mechanism: key,
                data: value,
            },
            Opcode::SelectBucket => Command::SelectBucket {
                opaque: header.opaque,
                name: key,
            },
            Opcode::SetVbucketState => {
                if extras.len() < 4 {
                    return Err(ParseError::Malformed("missing vbucket state extras"));
                }
                let raw = u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]);
                let state = VbucketState::from_u32(raw)
                    .ok_or(ParseError::Malformed("unknown vbucket state"))?;
                Command::SetVbucketState {
                    vbucket: header.vbucket,
                    opaque: header.opaque,
                    state,
                }
            }
            Opcode::GetVbucketState => Command::GetVbucketState {
                vbucket: header.vbucket,
                opaque: header.opaque,
            },
            Opcode::Sync => {
                let (flags, specs) = parse_sync_body(value)?;
                Command::Sync {
                    opaque: header.opaque,
                    flags,
                    specs,
                }
            }
            Opcode::TapConnect => {
                if extras.len() < 4 {
                    return Err(ParseError::Malformed("tap connect missing flags"));
                }
                Command::TapConnect {
                    opaque: header.opaque,
                    flags: u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]),
                    name: key,
                }
            }
            opcode => Command::Other {
                opcode,
                opaque: header.opaque,
            },
        };

        Ok((command, total_len))
    }
}

fn parse_sync_body(value: &[u8]) -> Result<(u32, Vec<SyncSpec<'_>>), ParseError> {
    if value.len() < 6 {
        return Err(ParseError::Malformed("sync body shorter than header"));
    }
    let flags = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
    let count = u16::from_be_bytes([value[4], value[5]]) as usize;
    let mut specs = Vec::with_capacity(count);
    let mut at = 6;
    for _ in 0..count {
        if value.len() < at + 12 {
            return Err(ParseError::Malformed("sync keyspec truncated"));
        }
        let cas = u64::from_be_bytes([
            value[at],
            value[at + 1],
            value[at + 2],
            value[at + 3],
            value[at + 4],
            value[at + 5],
            value[at + 6],
            value[at + 7],
        ]);
        let vbucket = u16::from_be_bytes([value[at + 8], value[at + 9]]);
        let key_len = u16::from_be_bytes([value[at + 10], value[at + 11]]) as usize;
        at += 12;
        if value.len() < at + key_len {
            return Err(ParseError::Malformed("sync key truncated"));
        }
        specs.push(SyncSpec {
            cas,
            vbucket,
            key: &value[at..at + key_len],
        });
        at += key_len;
    }
    Ok((flags, specs))
}

/// Builds response packets. Each method returns one complete packet.
pub struct ResponseWriter;

impl ResponseWriter {
    fn reply(
        opcode: Opcode,
        status: Status,
        opaque: u32,
        cas: u64,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> Vec<u8> {
        let mut header = ResponseHeader::new(opcode, status);
        header.key_len = key.len() as u16;
        header.extras_len = extras.len() as u8;
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

    /// GET-family hit: 4-byte flags extra, then the value.
    pub fn value(opcode: Opcode, opaque: u32, cas: u64, flags: u32, value: &[u8]) -> Vec<u8> {
        Self::reply(
            opcode,
            Status::NoError,
            opaque,
            cas,
            &flags.to_be_bytes(),
            &[],
            value,
        )
    }

    /// Bodyless success. CAS carries the mutation token for stores.
    pub fn success(opcode: Opcode, opaque: u32, cas: u64) -> Vec<u8> {
        Self::reply(opcode, Status::NoError, opaque, cas, &[], &[], &[])
    }

    pub fn counter(opcode: Opcode, opaque: u32, cas: u64, value: u64) -> Vec<u8> {
        Self::reply(
            opcode,
            Status::NoError,
            opaque,
            cas,
            &[],
            &[],
            &value.to_be_bytes(),
        )
    }

    pub fn stat_entry(opaque: u32, key: &[u8], value: &[u8]) -> Vec<u8> {
        Self::reply(Opcode::Stat, Status::NoError, opaque, 0, &[], key, value)
    }

    /// Empty key and value terminate a STAT response stream.
    pub fn stat_end(opaque: u32) -> Vec<u8> {
        Self::reply(Opcode::Stat, Status::NoError, opaque, 0, &[], &[], &[])
    }

    pub fn version(opaque: u32, version: &[u8]) -> Vec<u8> {
        Self::reply(Opcode::Version, Status::NoError, opaque, 0, &[], &[], version)
    }

    pub fn vbucket_state(opaque: u32, state: VbucketState) -> Vec<u8> {
        Self::reply(
            Opcode::GetVbucketState,
            Status::NoError,
            opaque,
            0,
            &[],
            &[],
            &(state as u32).to_be_bytes(),
        )
    }

    /// Success with an opaque payload body (SASL mechs list, etc).
    pub fn payload(opcode: Opcode, opaque: u32, data: &[u8]) -> Vec<u8> {
        Self::reply(opcode, Status::NoError, opaque, 0, &[], &[], data)
    }

    /// SYNC reply carrying the encoded ack items.
    pub fn sync(opaque: u32, body: &[u8]) -> Vec<u8> {
        Self::reply(Opcode::Sync, Status::NoError, opaque, 0, &[], &[], body)
    }

    /// Non-zero status with a diagnostic message body.
    pub fn error(opcode: Opcode, status: Status, opaque: u32) -> Vec<u8> {
        Self::reply(
            opcode,
            status,
            opaque,
            0,
            &[],
            &[],
            status.as_str().as_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request;
    use crate::response::ParsedResponse;

    #[test]
    fn parse_set_request() {
        let pkt = request::set(b"key", b"value", 7, 33, 120, 9, 1);
        let (command, used) = Command::parse(&pkt).unwrap();
        assert_eq!(used, pkt.len());
        assert_eq!(
            command,
            Command::Store {
                opcode: Opcode::Set,
                vbucket: 7,
                opaque: 1,
                cas: 9,
                flags: 33,
                expiration: 120,
                key: b"key",
                value: b"value",
            }
        );
    }

    #[test]
    fn parse_counter_request() {
        let pkt = request::decrement(b"n", 2, 5, 100, 0, 3);
        let (command, _) = Command::parse(&pkt).unwrap();
        assert_eq!(
            command,
            Command::Counter {
                opcode: Opcode::Decrement,
                vbucket: 2,
                opaque: 3,
                delta: 5,
                initial: 100,
                expiration: 0,
                key: b"n",
            }
        );
    }

    #[test]
    fn parse_sync_request() {
        let specs = vec![request::SyncKeyspec {
            cas: 8,
            vbucket: 4,
            key: b"doc".to_vec(),
        }];
        let pkt = request::sync(&specs, request::sync_flags::PERSIST, 6);
        let (command, _) = Command::parse(&pkt).unwrap();
        assert_eq!(
            command,
            Command::Sync {
                opaque: 6,
                flags: request::sync_flags::PERSIST,
                specs: vec![SyncSpec {
                    cas: 8,
                    vbucket: 4,
                    key: b"doc",
                }],
            }
        );
    }

    #[test]
    fn parse_incomplete_request() {
        let pkt = request::set(b"key", b"value", 0, 0, 0, 0, 0);
        assert!(matches!(
            Command::parse(&pkt[..pkt.len() - 1]),
            Err(ParseError::Incomplete)
        ));
    }

    #[test]
    fn unmodeled_opcode_is_other() {
        let pkt = request::create_bucket(b"default", b"", 2);
        let (command, _) = Command::parse(&pkt).unwrap();
        assert_eq!(
            command,
            Command::Other {
                opcode: Opcode::CreateBucket,
                opaque: 2,
            }
        );
    }

    #[test]
    fn value_reply_parses_back() {
        let pkt = ResponseWriter::value(Opcode::Get, 5, 42, 9, b"body");
        let (parsed, _) = ParsedResponse::parse(&pkt).unwrap();
        assert_eq!(
            parsed,
            ParsedResponse::Value {
                opcode: Opcode::Get,
                opaque: 5,
                cas: 42,
                flags: 9,
                value: b"body",
            }
        );
    }

    #[test]
    fn error_reply_parses_back() {
        let pkt = ResponseWriter::error(Opcode::Delete, Status::KeyNotFound, 8);
        let (parsed, _) = ParsedResponse::parse(&pkt).unwrap();
        match parsed {
            ParsedResponse::Fail {
                status, opaque, ..
            } => {
                assert_eq!(status, Status::KeyNotFound);
                assert_eq!(opaque, 8);
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }
}
