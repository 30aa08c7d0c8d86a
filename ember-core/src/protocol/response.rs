//! Typed responses and their frame decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::frame::Frame;
use super::opcode::{Opcode, Status};
use super::subdoc::{
    decode_lookup_results, decode_mutation_results, encode_lookup_results,
    encode_mutation_results, LookupInField, MutateInField,
};
use crate::error::{EmberError, Result};

/// The decoded payload of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// No payload (stores, removes, touch, unlock, handshake steps).
    Empty,
    /// A document body with its flags.
    Document {
        /// User flags stored with the document.
        flags: u32,
        /// Document body.
        value: Bytes,
    },
    /// Document metadata.
    Meta {
        /// Whether the document is a tombstone.
        deleted: bool,
        /// User flags.
        flags: u32,
        /// Expiry as stored by the server.
        expiry: u32,
        /// Mutation sequence number.
        seqno: u64,
    },
    /// New counter value.
    Counter(u64),
    /// Per-spec lookup results, in request order.
    Lookup(Vec<LookupInField>),
    /// Mutation results for specs that returned a value.
    Mutation(Vec<MutateInField>),
    /// Features acknowledged by HELLO.
    Features(Vec<u16>),
    /// Opaque value bytes (cluster config, manifest, SASL data).
    Value(Bytes),
}

/// Outcome of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request succeeded.
    Success(ResponseBody),
    /// The server rejected the request with a known status. The body holds
    /// whatever value the server attached (error context, or a cluster
    /// configuration on `NotMyVbucket`).
    Failure {
        /// Known status.
        status: Status,
        /// Raw response value.
        body: Bytes,
    },
    /// Unknown opcode or status, or a body that does not match the opcode.
    ProtocolError {
        /// Description of what was wrong.
        reason: String,
    },
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw opcode.
    pub opcode: u8,
    /// Raw status.
    pub status: u16,
    /// Correlation id echoed from the request.
    pub opaque: u32,
    /// CAS of the document after the operation.
    pub cas: u64,
    /// Datatype bits of the value.
    pub datatype: u8,
    /// Decoded outcome.
    pub outcome: Outcome,
}

fn lookup_status(fields: &[LookupInField]) -> Status {
    if fields.iter().all(LookupInField::is_success) {
        Status::Success
    } else {
        Status::SubdocMultiPathFailure
    }
}

impl Response {
    /// Builds a successful response. Lookups with failing specs get the
    /// multi-path failure status, as a server would send.
    pub fn success(opcode: Opcode, opaque: u32, cas: u64, body: ResponseBody) -> Self {
        let status = match &body {
            ResponseBody::Lookup(fields) => lookup_status(fields),
            _ => Status::Success,
        };
        Self {
            opcode: opcode.code(),
            status: status.code(),
            opaque,
            cas,
            datatype: 0,
            outcome: Outcome::Success(body),
        }
    }

    /// Builds a failed response with an optional value body.
    pub fn failure(opcode: Opcode, opaque: u32, status: Status, body: impl Into<Bytes>) -> Self {
        Self {
            opcode: opcode.code(),
            status: status.code(),
            opaque,
            cas: 0,
            datatype: 0,
            outcome: Outcome::Failure {
                status,
                body: body.into(),
            },
        }
    }

    /// Sets the datatype bits.
    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    /// Returns the known status, if any.
    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.status)
    }

    /// Returns `true` if the outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// Consumes the response and returns the success body, or an error if the
    /// outcome is not a success.
    pub fn into_body(self) -> Result<ResponseBody> {
        match self.outcome {
            Outcome::Success(body) => Ok(body),
            Outcome::Failure { .. } | Outcome::ProtocolError { .. } => {
                Err(EmberError::UnknownStatus {
                    opcode: self.opcode,
                    status: self.status,
                })
            }
        }
    }

    /// Decodes a response frame. Never fails: anything unexpected becomes an
    /// [`Outcome::ProtocolError`].
    pub fn decode(frame: &Frame) -> Self {
        let outcome = if !frame.is_response() {
            Outcome::ProtocolError {
                reason: "expected a response frame".to_string(),
            }
        } else {
            match (Opcode::from_code(frame.opcode), Status::from_code(frame.status())) {
                (None, _) => Outcome::ProtocolError {
                    reason: format!("unknown opcode 0x{:02x}", frame.opcode),
                },
                (_, None) => Outcome::ProtocolError {
                    reason: format!("unknown status 0x{:04x}", frame.status()),
                },
                (Some(opcode), Some(status)) => match decode_outcome(opcode, status, frame) {
                    Ok(outcome) => outcome,
                    Err(err) => Outcome::ProtocolError {
                        reason: err.to_string(),
                    },
                },
            }
        };

        Self {
            opcode: frame.opcode,
            status: frame.status(),
            opaque: frame.opaque,
            cas: frame.cas,
            datatype: frame.datatype,
            outcome,
        }
    }

    /// Encodes this response into a frame. Used by servers and test doubles.
    pub fn to_frame(&self) -> Frame {
        let frame = Frame::response(self.opcode, self.status)
            .with_opaque(self.opaque)
            .with_cas(self.cas)
            .with_datatype(self.datatype);

        match &self.outcome {
            Outcome::Success(body) => match body {
                ResponseBody::Empty => frame,
                ResponseBody::Document { flags, value } => frame
                    .with_extras(flags.to_be_bytes().to_vec())
                    .with_value(value.clone()),
                ResponseBody::Meta {
                    deleted,
                    flags,
                    expiry,
                    seqno,
                } => {
                    let mut extras = BytesMut::with_capacity(20);
                    extras.put_u32(u32::from(*deleted));
                    extras.put_u32(*flags);
                    extras.put_u32(*expiry);
                    extras.put_u64(*seqno);
                    frame.with_extras(extras.freeze())
                }
                ResponseBody::Counter(value) => frame.with_value(value.to_be_bytes().to_vec()),
                ResponseBody::Lookup(fields) => frame.with_value(encode_lookup_results(fields)),
                ResponseBody::Mutation(fields) => {
                    frame.with_value(encode_mutation_results(fields))
                }
                ResponseBody::Features(features) => {
                    let mut value = BytesMut::with_capacity(features.len() * 2);
                    for feature in features {
                        value.put_u16(*feature);
                    }
                    frame.with_value(value.freeze())
                }
                ResponseBody::Value(value) => frame.with_value(value.clone()),
            },
            Outcome::Failure { body, .. } => frame.with_value(body.clone()),
            Outcome::ProtocolError { .. } => frame,
        }
    }
}

fn decode_outcome(opcode: Opcode, status: Status, frame: &Frame) -> Result<Outcome> {
    let subdoc_lookup_ok = matches!(
        status,
        Status::Success
            | Status::SubdocMultiPathFailure
            | Status::SubdocSuccessDeleted
            | Status::SubdocMultiPathFailureDeleted
    );
    let subdoc_mutation_ok = matches!(status, Status::Success | Status::SubdocSuccessDeleted);

    if opcode == Opcode::LookupIn && subdoc_lookup_ok {
        let fields = decode_lookup_results(frame.value.clone())?;
        return Ok(Outcome::Success(ResponseBody::Lookup(fields)));
    }
    if opcode == Opcode::MutateIn && subdoc_mutation_ok {
        let fields = decode_mutation_results(frame.value.clone())?;
        return Ok(Outcome::Success(ResponseBody::Mutation(fields)));
    }
    if status != Status::Success {
        return Ok(Outcome::Failure {
            status,
            body: frame.value.clone(),
        });
    }

    let body = match opcode {
        Opcode::Get | Opcode::GetAndTouch | Opcode::GetAndLock => {
            if frame.extras.len() != 4 {
                return Err(EmberError::Protocol(format!(
                    "{} response needs 4 bytes of flags, got {}",
                    opcode,
                    frame.extras.len()
                )));
            }
            let mut extras = frame.extras.clone();
            ResponseBody::Document {
                flags: extras.get_u32(),
                value: frame.value.clone(),
            }
        }
        Opcode::GetMeta => {
            if frame.extras.len() < 20 {
                return Err(EmberError::Protocol(format!(
                    "get_meta response needs 20 bytes of extras, got {}",
                    frame.extras.len()
                )));
            }
            let mut extras = frame.extras.clone();
            ResponseBody::Meta {
                deleted: extras.get_u32() != 0,
                flags: extras.get_u32(),
                expiry: extras.get_u32(),
                seqno: extras.get_u64(),
            }
        }
        Opcode::Increment | Opcode::Decrement => {
            if frame.value.len() != 8 {
                return Err(EmberError::Protocol(format!(
                    "counter response needs an 8 byte value, got {}",
                    frame.value.len()
                )));
            }
            ResponseBody::Counter(frame.value.clone().get_u64())
        }
        Opcode::Hello => {
            let mut value = frame.value.clone();
            let mut features = Vec::with_capacity(value.len() / 2);
            while value.remaining() >= 2 {
                features.push(value.get_u16());
            }
            ResponseBody::Features(features)
        }
        Opcode::GetClusterConfig | Opcode::GetCollectionsManifest | Opcode::SaslAuth => {
            ResponseBody::Value(frame.value.clone())
        }
        Opcode::Upsert
        | Opcode::Insert
        | Opcode::Replace
        | Opcode::Remove
        | Opcode::Append
        | Opcode::Prepend
        | Opcode::Touch
        | Opcode::Unlock
        | Opcode::Noop
        | Opcode::SelectBucket
        | Opcode::LookupIn
        | Opcode::MutateIn => ResponseBody::Empty,
    };

    Ok(Outcome::Success(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use crate::protocol::FrameCodec;
    use tokio_util::codec::{Decoder, Encoder};

    fn through_wire(response: &Response) -> Response {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(response.to_frame(), &mut buf).unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        Response::decode(&frame)
    }

    #[test]
    fn test_success_bodies_decode_back() {
        let responses = vec![
            Response::success(
                Opcode::Get,
                1,
                100,
                ResponseBody::Document {
                    flags: FLAGS_JSON,
                    value: Bytes::from_static(b"{}"),
                },
            )
            .with_datatype(DATATYPE_JSON),
            Response::success(
                Opcode::GetMeta,
                2,
                5,
                ResponseBody::Meta {
                    deleted: true,
                    flags: 1,
                    expiry: 2,
                    seqno: 3,
                },
            ),
            Response::success(Opcode::Increment, 3, 6, ResponseBody::Counter(42)),
            Response::success(
                Opcode::LookupIn,
                4,
                7,
                ResponseBody::Lookup(vec![LookupInField {
                    status: 0,
                    value: Bytes::from_static(b"1"),
                }]),
            ),
            Response::success(
                Opcode::MutateIn,
                5,
                8,
                ResponseBody::Mutation(vec![MutateInField {
                    index: 1,
                    status: 0,
                    value: Bytes::from_static(b"11"),
                }]),
            ),
            Response::success(Opcode::Hello, 6, 0, ResponseBody::Features(vec![0x12, 0x07])),
            Response::success(
                Opcode::GetClusterConfig,
                7,
                0,
                ResponseBody::Value(Bytes::from_static(b"{\"rev\":1}")),
            ),
            Response::success(Opcode::Upsert, 8, 9, ResponseBody::Empty),
        ];

        for response in responses {
            assert_eq!(through_wire(&response), response);
        }
    }

    #[test]
    fn test_failure_keeps_body() {
        let response = Response::failure(
            Opcode::Get,
            9,
            Status::NotMyVbucket,
            Bytes::from_static(b"{\"rev\":9}"),
        );
        let decoded = through_wire(&response);
        match decoded.outcome {
            Outcome::Failure { status, body } => {
                assert_eq!(status, Status::NotMyVbucket);
                assert_eq!(&body[..], b"{\"rev\":9}");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_lookup_multi_path_failure_is_success_with_fields() {
        let fields = vec![
            LookupInField {
                status: 0,
                value: Bytes::from_static(b"1"),
            },
            LookupInField {
                status: Status::SubdocPathNotFound.code(),
                value: Bytes::new(),
            },
        ];
        let response = Response::success(Opcode::LookupIn, 1, 1, ResponseBody::Lookup(fields));
        assert_eq!(response.status, Status::SubdocMultiPathFailure.code());

        let decoded = through_wire(&response);
        assert!(decoded.is_success());
    }

    #[test]
    fn test_unknown_status_is_protocol_error() {
        let frame = Frame::response(Opcode::Get.code(), 0x0fee).with_opaque(3);
        let response = Response::decode(&frame);
        assert!(matches!(response.outcome, Outcome::ProtocolError { .. }));
        assert_eq!(response.opaque, 3);
        assert!(matches!(
            response.into_body(),
            Err(EmberError::UnknownStatus { status: 0x0fee, .. })
        ));
    }

    #[test]
    fn test_unknown_opcode_is_protocol_error() {
        let frame = Frame::response(0x7d, 0);
        let response = Response::decode(&frame);
        assert!(matches!(response.outcome, Outcome::ProtocolError { .. }));
    }

    #[test]
    fn test_malformed_get_body_is_protocol_error() {
        let frame = Frame::response(Opcode::Get.code(), 0).with_value(&b"x"[..]);
        let response = Response::decode(&frame);
        match response.outcome {
            Outcome::ProtocolError { reason } => assert!(reason.contains("flags")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
