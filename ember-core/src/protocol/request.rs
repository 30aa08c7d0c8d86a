//! Typed requests and their frame encoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use super::frame::Frame;
use super::opcode::Opcode;
use super::subdoc::{
    decode_lookup_specs, decode_mutation_specs, encode_lookup_specs, encode_mutation_specs,
    LookupInSpec, MutateInSpec,
};
use crate::document::DurabilityLevel;
use crate::error::{EmberError, Result};

/// Which full-document store a [`Request::Store`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMode {
    /// Create or overwrite.
    Upsert,
    /// Create; fail if present.
    Insert,
    /// Overwrite; fail if absent.
    Replace,
}

impl StoreMode {
    fn opcode(self) -> Opcode {
        match self {
            Self::Upsert => Opcode::Upsert,
            Self::Insert => Opcode::Insert,
            Self::Replace => Opcode::Replace,
        }
    }
}

/// Direction of a counter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterDirection {
    /// Add the delta.
    Increment,
    /// Subtract the delta, saturating at zero.
    Decrement,
}

/// Which end a [`Request::Concat`] writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcatMode {
    /// Add bytes at the end.
    Append,
    /// Add bytes at the start.
    Prepend,
}

/// Document-level behavior of a sub-document mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreSemantics {
    /// The document must exist.
    #[default]
    Replace,
    /// Create the document if it does not exist.
    Upsert,
    /// The document must not exist.
    Insert,
}

/// A typed request, independent of routing.
///
/// Keys carried here are the bytes that go on the wire; for collection-aware
/// connections that includes the LEB128 collection prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Request {
    Get {
        key: Bytes,
    },
    GetMeta {
        key: Bytes,
    },
    GetAndTouch {
        key: Bytes,
        expiry: u32,
    },
    GetAndLock {
        key: Bytes,
        lock_time: u32,
    },
    Unlock {
        key: Bytes,
        cas: u64,
    },
    Touch {
        key: Bytes,
        expiry: u32,
    },
    Store {
        mode: StoreMode,
        key: Bytes,
        value: Bytes,
        flags: u32,
        expiry: u32,
        cas: u64,
        datatype: u8,
        durability: DurabilityLevel,
    },
    Remove {
        key: Bytes,
        cas: u64,
        durability: DurabilityLevel,
    },
    Counter {
        direction: CounterDirection,
        key: Bytes,
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
        durability: DurabilityLevel,
    },
    Concat {
        mode: ConcatMode,
        key: Bytes,
        value: Bytes,
        cas: u64,
        durability: DurabilityLevel,
    },
    LookupIn {
        key: Bytes,
        specs: Vec<LookupInSpec>,
        access_deleted: bool,
    },
    MutateIn {
        key: Bytes,
        specs: Vec<MutateInSpec>,
        cas: u64,
        expiry: Option<u32>,
        semantics: StoreSemantics,
        access_deleted: bool,
        durability: DurabilityLevel,
    },
    Noop,
    Hello {
        agent: String,
        features: Vec<u16>,
    },
    SaslAuth {
        mechanism: String,
        payload: Bytes,
    },
    SelectBucket {
        bucket: String,
    },
    GetClusterConfig,
    GetCollectionsManifest,
}

fn durability_framing(level: DurabilityLevel) -> Bytes {
    match level.code() {
        Some(code) => Bytes::from(vec![(FRAMING_ID_DURABILITY << 4) | 0x01, code]),
        None => Bytes::new(),
    }
}

fn parse_durability(framing: &[u8]) -> Result<DurabilityLevel> {
    let mut rest = framing;
    let mut level = DurabilityLevel::None;
    while let Some((&tag, tail)) = rest.split_first() {
        let id = tag >> 4;
        let len = (tag & 0x0f) as usize;
        if tail.len() < len {
            return Err(EmberError::Protocol("truncated framing extras".to_string()));
        }
        if id == FRAMING_ID_DURABILITY && len >= 1 {
            level = DurabilityLevel::from_code(tail[0]).ok_or_else(|| {
                EmberError::Protocol(format!("invalid durability level 0x{:02x}", tail[0]))
            })?;
        }
        rest = &tail[len..];
    }
    Ok(level)
}

fn extras_u32(extras: &[u8], offset: usize) -> Result<u32> {
    extras
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| EmberError::Protocol("extras too short".to_string()))
}

fn utf8(bytes: &Bytes, what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| EmberError::Protocol(format!("{} is not valid UTF-8", what)))
}

impl Request {
    /// Returns the opcode this request is sent with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Get { .. } => Opcode::Get,
            Self::GetMeta { .. } => Opcode::GetMeta,
            Self::GetAndTouch { .. } => Opcode::GetAndTouch,
            Self::GetAndLock { .. } => Opcode::GetAndLock,
            Self::Unlock { .. } => Opcode::Unlock,
            Self::Touch { .. } => Opcode::Touch,
            Self::Store { mode, .. } => mode.opcode(),
            Self::Remove { .. } => Opcode::Remove,
            Self::Counter { direction, .. } => match direction {
                CounterDirection::Increment => Opcode::Increment,
                CounterDirection::Decrement => Opcode::Decrement,
            },
            Self::Concat { mode, .. } => match mode {
                ConcatMode::Append => Opcode::Append,
                ConcatMode::Prepend => Opcode::Prepend,
            },
            Self::LookupIn { .. } => Opcode::LookupIn,
            Self::MutateIn { .. } => Opcode::MutateIn,
            Self::Noop => Opcode::Noop,
            Self::Hello { .. } => Opcode::Hello,
            Self::SaslAuth { .. } => Opcode::SaslAuth,
            Self::SelectBucket { .. } => Opcode::SelectBucket,
            Self::GetClusterConfig => Opcode::GetClusterConfig,
            Self::GetCollectionsManifest => Opcode::GetCollectionsManifest,
        }
    }

    /// Returns the document key for keyed requests.
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Self::Get { key }
            | Self::GetMeta { key }
            | Self::GetAndTouch { key, .. }
            | Self::GetAndLock { key, .. }
            | Self::Unlock { key, .. }
            | Self::Touch { key, .. }
            | Self::Store { key, .. }
            | Self::Remove { key, .. }
            | Self::Counter { key, .. }
            | Self::Concat { key, .. }
            | Self::LookupIn { key, .. }
            | Self::MutateIn { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Replaces the key of a keyed request. Unkeyed requests are returned unchanged.
    pub fn with_key(mut self, new_key: Bytes) -> Self {
        match &mut self {
            Self::Get { key }
            | Self::GetMeta { key }
            | Self::GetAndTouch { key, .. }
            | Self::GetAndLock { key, .. }
            | Self::Unlock { key, .. }
            | Self::Touch { key, .. }
            | Self::Store { key, .. }
            | Self::Remove { key, .. }
            | Self::Counter { key, .. }
            | Self::Concat { key, .. }
            | Self::LookupIn { key, .. }
            | Self::MutateIn { key, .. } => *key = new_key,
            _ => {}
        }
        self
    }

    /// Returns the CAS precondition, or 0 when none is set.
    pub fn cas(&self) -> u64 {
        match self {
            Self::Unlock { cas, .. }
            | Self::Store { cas, .. }
            | Self::Remove { cas, .. }
            | Self::Concat { cas, .. }
            | Self::MutateIn { cas, .. } => *cas,
            _ => 0,
        }
    }

    /// Returns the durability requirement of a mutation.
    pub fn durability(&self) -> DurabilityLevel {
        match self {
            Self::Store { durability, .. }
            | Self::Remove { durability, .. }
            | Self::Counter { durability, .. }
            | Self::Concat { durability, .. }
            | Self::MutateIn { durability, .. } => *durability,
            _ => DurabilityLevel::None,
        }
    }

    /// Returns `true` if sending this request twice has the same effect as sending it once.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::Get { .. }
                | Self::GetMeta { .. }
                | Self::GetAndTouch { .. }
                | Self::Touch { .. }
                | Self::LookupIn { .. }
                | Self::Noop
                | Self::Hello { .. }
                | Self::SaslAuth { .. }
                | Self::SelectBucket { .. }
                | Self::GetClusterConfig
                | Self::GetCollectionsManifest
        )
    }

    /// Returns the path of the sub-document spec at `index`, if any.
    pub fn subdoc_path(&self, index: usize) -> Option<&str> {
        match self {
            Self::LookupIn { specs, .. } => specs.get(index).map(|s| s.path.as_str()),
            Self::MutateIn { specs, .. } => specs.get(index).map(|s| s.path.as_str()),
            _ => None,
        }
    }

    /// Encodes this request into a frame addressed to `vbucket`.
    pub fn encode(&self, vbucket: u16, opaque: u32) -> Result<Frame> {
        let frame = Frame::request(self.opcode().code())
            .with_specific(vbucket)
            .with_opaque(opaque);

        let frame = match self {
            Self::Get { key } | Self::GetMeta { key } => frame.with_key(key.clone()),
            Self::GetAndTouch { key, expiry } | Self::Touch { key, expiry } => frame
                .with_key(key.clone())
                .with_extras(expiry.to_be_bytes().to_vec()),
            Self::GetAndLock { key, lock_time } => frame
                .with_key(key.clone())
                .with_extras(lock_time.to_be_bytes().to_vec()),
            Self::Unlock { key, cas } => frame.with_key(key.clone()).with_cas(*cas),
            Self::Store {
                mode,
                key,
                value,
                flags,
                expiry,
                cas,
                datatype,
                durability,
            } => {
                if *mode == StoreMode::Insert && *cas != 0 {
                    return Err(EmberError::InvalidArgument(
                        "insert does not accept a CAS".to_string(),
                    ));
                }
                let mut extras = BytesMut::with_capacity(8);
                extras.put_u32(*flags);
                extras.put_u32(*expiry);
                frame
                    .with_key(key.clone())
                    .with_extras(extras.freeze())
                    .with_value(value.clone())
                    .with_cas(*cas)
                    .with_datatype(*datatype)
                    .with_framing_extras(durability_framing(*durability))
            }
            Self::Remove {
                key,
                cas,
                durability,
            } => frame
                .with_key(key.clone())
                .with_cas(*cas)
                .with_framing_extras(durability_framing(*durability)),
            Self::Counter {
                key,
                delta,
                initial,
                expiry,
                durability,
                ..
            } => {
                let mut extras = BytesMut::with_capacity(20);
                extras.put_u64(*delta);
                extras.put_u64(initial.unwrap_or(0));
                extras.put_u32(if initial.is_some() {
                    *expiry
                } else {
                    COUNTER_NO_CREATE
                });
                frame
                    .with_key(key.clone())
                    .with_extras(extras.freeze())
                    .with_framing_extras(durability_framing(*durability))
            }
            Self::Concat {
                key,
                value,
                cas,
                durability,
                ..
            } => frame
                .with_key(key.clone())
                .with_value(value.clone())
                .with_cas(*cas)
                .with_framing_extras(durability_framing(*durability)),
            Self::LookupIn {
                key,
                specs,
                access_deleted,
            } => {
                let frame = frame
                    .with_key(key.clone())
                    .with_value(encode_lookup_specs(specs)?);
                if *access_deleted {
                    frame.with_extras(vec![SUBDOC_DOC_ACCESS_DELETED])
                } else {
                    frame
                }
            }
            Self::MutateIn {
                key,
                specs,
                cas,
                expiry,
                semantics,
                access_deleted,
                durability,
            } => {
                let mut doc_flags = match semantics {
                    StoreSemantics::Replace => 0,
                    StoreSemantics::Upsert => SUBDOC_DOC_MKDOC,
                    StoreSemantics::Insert => SUBDOC_DOC_ADD,
                };
                if *access_deleted {
                    doc_flags |= SUBDOC_DOC_ACCESS_DELETED;
                }
                let mut extras = BytesMut::with_capacity(5);
                if let Some(expiry) = expiry {
                    extras.put_u32(*expiry);
                }
                if doc_flags != 0 {
                    extras.put_u8(doc_flags);
                }
                frame
                    .with_key(key.clone())
                    .with_extras(extras.freeze())
                    .with_value(encode_mutation_specs(specs)?)
                    .with_cas(*cas)
                    .with_framing_extras(durability_framing(*durability))
            }
            Self::Noop | Self::GetClusterConfig | Self::GetCollectionsManifest => frame,
            Self::Hello { agent, features } => {
                let mut value = BytesMut::with_capacity(features.len() * 2);
                for feature in features {
                    value.put_u16(*feature);
                }
                frame
                    .with_key(agent.clone().into_bytes())
                    .with_value(value.freeze())
            }
            Self::SaslAuth { mechanism, payload } => frame
                .with_key(mechanism.clone().into_bytes())
                .with_value(payload.clone()),
            Self::SelectBucket { bucket } => frame.with_key(bucket.clone().into_bytes()),
        };

        Ok(frame)
    }

    /// Decodes a request frame. Used by servers and test doubles.
    pub fn decode(frame: &Frame) -> Result<Self> {
        if !frame.is_request() {
            return Err(EmberError::Protocol(
                "expected a request frame".to_string(),
            ));
        }
        let opcode = Opcode::from_code(frame.opcode).ok_or_else(|| {
            EmberError::Protocol(format!("unsupported opcode 0x{:02x}", frame.opcode))
        })?;
        let key = frame.key.clone();
        let durability = parse_durability(&frame.framing_extras)?;
        let extras = &frame.extras[..];

        let request = match opcode {
            Opcode::Get => Self::Get { key },
            Opcode::GetMeta => Self::GetMeta { key },
            Opcode::GetAndTouch => Self::GetAndTouch {
                key,
                expiry: extras_u32(extras, 0)?,
            },
            Opcode::Touch => Self::Touch {
                key,
                expiry: extras_u32(extras, 0)?,
            },
            Opcode::GetAndLock => Self::GetAndLock {
                key,
                lock_time: extras_u32(extras, 0)?,
            },
            Opcode::Unlock => Self::Unlock {
                key,
                cas: frame.cas,
            },
            Opcode::Upsert | Opcode::Insert | Opcode::Replace => Self::Store {
                mode: match opcode {
                    Opcode::Upsert => StoreMode::Upsert,
                    Opcode::Insert => StoreMode::Insert,
                    _ => StoreMode::Replace,
                },
                key,
                value: frame.value.clone(),
                flags: extras_u32(extras, 0)?,
                expiry: extras_u32(extras, 4)?,
                cas: frame.cas,
                datatype: frame.datatype,
                durability,
            },
            Opcode::Remove => Self::Remove {
                key,
                cas: frame.cas,
                durability,
            },
            Opcode::Increment | Opcode::Decrement => {
                if extras.len() < 20 {
                    return Err(EmberError::Protocol("counter extras too short".to_string()));
                }
                let mut buf = &extras[..20];
                let delta = buf.get_u64();
                let initial = buf.get_u64();
                let expiry = buf.get_u32();
                let (initial, expiry) = if expiry == COUNTER_NO_CREATE {
                    (None, 0)
                } else {
                    (Some(initial), expiry)
                };
                Self::Counter {
                    direction: if opcode == Opcode::Increment {
                        CounterDirection::Increment
                    } else {
                        CounterDirection::Decrement
                    },
                    key,
                    delta,
                    initial,
                    expiry,
                    durability,
                }
            }
            Opcode::Append | Opcode::Prepend => Self::Concat {
                mode: if opcode == Opcode::Append {
                    ConcatMode::Append
                } else {
                    ConcatMode::Prepend
                },
                key,
                value: frame.value.clone(),
                cas: frame.cas,
                durability,
            },
            Opcode::LookupIn => Self::LookupIn {
                key,
                specs: decode_lookup_specs(frame.value.clone())?,
                access_deleted: extras
                    .first()
                    .map_or(false, |f| f & SUBDOC_DOC_ACCESS_DELETED != 0),
            },
            Opcode::MutateIn => {
                let (expiry, doc_flags) = match extras.len() {
                    0 => (None, 0),
                    1 => (None, extras[0]),
                    4 => (Some(extras_u32(extras, 0)?), 0),
                    5 => (Some(extras_u32(extras, 0)?), extras[4]),
                    other => {
                        return Err(EmberError::Protocol(format!(
                            "invalid mutate_in extras length {}",
                            other
                        )))
                    }
                };
                let semantics = if doc_flags & SUBDOC_DOC_MKDOC != 0 {
                    StoreSemantics::Upsert
                } else if doc_flags & SUBDOC_DOC_ADD != 0 {
                    StoreSemantics::Insert
                } else {
                    StoreSemantics::Replace
                };
                Self::MutateIn {
                    key,
                    specs: decode_mutation_specs(frame.value.clone())?,
                    cas: frame.cas,
                    expiry,
                    semantics,
                    access_deleted: doc_flags & SUBDOC_DOC_ACCESS_DELETED != 0,
                    durability,
                }
            }
            Opcode::Noop => Self::Noop,
            Opcode::GetClusterConfig => Self::GetClusterConfig,
            Opcode::GetCollectionsManifest => Self::GetCollectionsManifest,
            Opcode::Hello => {
                let mut value = frame.value.clone();
                let mut features = Vec::with_capacity(value.len() / 2);
                while value.remaining() >= 2 {
                    features.push(value.get_u16());
                }
                Self::Hello {
                    agent: utf8(&key, "agent name")?,
                    features,
                }
            }
            Opcode::SaslAuth => Self::SaslAuth {
                mechanism: utf8(&key, "mechanism")?,
                payload: frame.value.clone(),
            },
            Opcode::SelectBucket => Self::SelectBucket {
                bucket: utf8(&key, "bucket name")?,
            },
        };

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameCodec;
    use crate::protocol::leb128::encode_collection_key;
    use tokio_util::codec::{Decoder, Encoder};

    fn key() -> Bytes {
        Bytes::from_static(b"\x00doc-1")
    }

    fn decode_back(request: &Request) -> Request {
        let frame = request.encode(12, 34).unwrap();
        assert_eq!(frame.vbucket(), 12);
        assert_eq!(frame.opaque, 34);
        Request::decode(&frame).unwrap()
    }

    fn every_request() -> Vec<Request> {
        vec![
            Request::Get { key: key() },
            Request::GetMeta { key: key() },
            Request::GetAndTouch {
                key: key(),
                expiry: 30,
            },
            Request::GetAndLock {
                key: key(),
                lock_time: 15,
            },
            Request::Unlock { key: key(), cas: 77 },
            Request::Touch {
                key: key(),
                expiry: 5,
            },
            Request::Store {
                mode: StoreMode::Replace,
                key: key(),
                value: Bytes::from_static(b"{\"a\":1}"),
                flags: FLAGS_JSON,
                expiry: 10,
                cas: 99,
                datatype: DATATYPE_JSON,
                durability: DurabilityLevel::Majority,
            },
            Request::Remove {
                key: key(),
                cas: 3,
                durability: DurabilityLevel::None,
            },
            Request::Counter {
                direction: CounterDirection::Decrement,
                key: key(),
                delta: 2,
                initial: Some(100),
                expiry: 0,
                durability: DurabilityLevel::None,
            },
            Request::Concat {
                mode: ConcatMode::Prepend,
                key: key(),
                value: Bytes::from_static(b"ab"),
                cas: 0,
                durability: DurabilityLevel::PersistToMajority,
            },
            Request::LookupIn {
                key: key(),
                specs: vec![LookupInSpec::get("a"), LookupInSpec::exists("b")],
                access_deleted: true,
            },
            Request::MutateIn {
                key: key(),
                specs: vec![MutateInSpec::upsert("a", &b"2"[..])],
                cas: 8,
                expiry: Some(60),
                semantics: StoreSemantics::Upsert,
                access_deleted: false,
                durability: DurabilityLevel::None,
            },
            Request::Noop,
            Request::Hello {
                agent: "ember/0.1".to_string(),
                features: vec![features::COLLECTIONS, features::XERROR],
            },
            Request::SaslAuth {
                mechanism: "PLAIN".to_string(),
                payload: Bytes::from_static(b"\0user\0pass"),
            },
            Request::SelectBucket {
                bucket: "travel".to_string(),
            },
            Request::GetClusterConfig,
            Request::GetCollectionsManifest,
        ]
    }

    #[test]
    fn test_every_opcode_decodes_back() {
        for request in every_request() {
            assert_eq!(decode_back(&request), request, "{:?}", request.opcode());
        }
    }

    #[test]
    fn test_every_opcode_survives_split_reads() {
        let requests = every_request();
        let mut stream = BytesMut::new();
        let mut codec = FrameCodec::new();
        for (index, request) in requests.iter().enumerate() {
            let frame = request.encode(index as u16, index as u32).unwrap();
            codec.encode(frame, &mut stream).unwrap();
        }

        // Chunk sizes cycle through values that cut inside headers, extras,
        // keys and values.
        let patterns: [&[usize]; 5] = [&[1], &[3, 1, 7], &[23, 2], &[24, 25, 5], &[11, 64, 2, 9]];
        for pattern in patterns {
            let mut decoder = FrameCodec::new();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            let mut offset = 0;
            for &size in pattern.iter().cycle() {
                if offset >= stream.len() {
                    break;
                }
                let end = (offset + size).min(stream.len());
                buf.extend_from_slice(&stream[offset..end]);
                offset = end;
                while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                    decoded.push(Request::decode(&frame).unwrap());
                }
            }

            assert!(buf.is_empty(), "pattern {:?} left bytes behind", pattern);
            assert_eq!(decoded, requests, "pattern {:?}", pattern);
        }
    }

    #[test]
    fn test_store_extras_layout() {
        let request = Request::Store {
            mode: StoreMode::Upsert,
            key: key(),
            value: Bytes::from_static(b"v"),
            flags: 0x0102_0304,
            expiry: 0x0a0b_0c0d,
            cas: 0,
            datatype: 0,
            durability: DurabilityLevel::None,
        };
        let frame = request.encode(0, 1).unwrap();
        assert_eq!(frame.opcode, 0x01);
        assert_eq!(&frame.extras[..], &[1, 2, 3, 4, 0x0a, 0x0b, 0x0c, 0x0d]);
        assert!(frame.framing_extras.is_empty());
    }

    #[test]
    fn test_durability_framing_extra() {
        let request = Request::Remove {
            key: key(),
            cas: 0,
            durability: DurabilityLevel::MajorityAndPersistActive,
        };
        let frame = request.encode(0, 1).unwrap();
        assert_eq!(&frame.framing_extras[..], &[0x11, 0x02]);
    }

    #[test]
    fn test_counter_without_initial() {
        let request = Request::Counter {
            direction: CounterDirection::Increment,
            key: key(),
            delta: 1,
            initial: None,
            expiry: 0,
            durability: DurabilityLevel::None,
        };
        let frame = request.encode(0, 1).unwrap();
        assert_eq!(&frame.extras[16..20], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(Request::decode(&frame).unwrap(), request);
    }

    #[test]
    fn test_insert_with_cas_rejected() {
        let request = Request::Store {
            mode: StoreMode::Insert,
            key: key(),
            value: Bytes::new(),
            flags: 0,
            expiry: 0,
            cas: 5,
            datatype: 0,
            durability: DurabilityLevel::None,
        };
        assert!(matches!(
            request.encode(0, 1),
            Err(EmberError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_idempotency_table() {
        assert!(Request::Get { key: key() }.is_idempotent());
        assert!(Request::Touch {
            key: key(),
            expiry: 1
        }
        .is_idempotent());
        assert!(!Request::GetAndLock {
            key: key(),
            lock_time: 1
        }
        .is_idempotent());
        assert!(!Request::Unlock { key: key(), cas: 1 }.is_idempotent());
        assert!(!Request::Remove {
            key: key(),
            cas: 0,
            durability: DurabilityLevel::None
        }
        .is_idempotent());
    }

    #[test]
    fn test_with_key_replaces_key() {
        let prefixed = encode_collection_key(8, b"doc-1");
        let request = Request::Get { key: key() }.with_key(prefixed.clone());
        assert_eq!(request.key(), Some(&prefixed));
        assert_eq!(Request::Noop.with_key(prefixed).key(), None);
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let frame = Frame::request(0x7e);
        assert!(Request::decode(&frame).is_err());
        let response = Frame::response(0x00, 0);
        assert!(Request::decode(&response).is_err());
    }
}
