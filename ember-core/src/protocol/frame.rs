//! Frame type for the binary key-value protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use crate::error::{EmberError, Result};

/// The fixed 24-byte header that precedes every frame body.
///
/// All multi-byte fields are big-endian. With flexible framing (magic
/// `0x08`/`0x18`) the 16-bit key length is split into an 8-bit framing
/// extras length followed by an 8-bit key length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Magic byte.
    pub magic: u8,
    /// Raw opcode.
    pub opcode: u8,
    /// Length of the flexible framing extras section.
    pub framing_extras_len: u8,
    /// Length of the key section.
    pub key_len: u16,
    /// Length of the extras section.
    pub extras_len: u8,
    /// Datatype bits.
    pub datatype: u8,
    /// vbucket id on requests, status on responses.
    pub specific: u16,
    /// Length of everything after the header.
    pub body_len: u32,
    /// Correlation id chosen by the requester.
    pub opaque: u32,
    /// Compare-and-swap token.
    pub cas: u64,
}

impl FrameHeader {
    /// Parses the header at the front of `src` without consuming it.
    ///
    /// Returns `Ok(None)` when fewer than [`HEADER_SIZE`] bytes are buffered and
    /// an error when the magic byte is unknown or the section lengths do not
    /// fit inside the declared body.
    pub fn parse(src: &[u8]) -> Result<Option<Self>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = src[0];
        let (framing_extras_len, key_len) = match magic {
            MAGIC_REQUEST | MAGIC_RESPONSE => (0, u16::from_be_bytes([src[2], src[3]])),
            MAGIC_ALT_REQUEST | MAGIC_ALT_RESPONSE => (src[2], src[3] as u16),
            other => {
                return Err(EmberError::Protocol(format!(
                    "invalid magic byte 0x{:02x}",
                    other
                )))
            }
        };

        let header = Self {
            magic,
            opcode: src[1],
            framing_extras_len,
            key_len,
            extras_len: src[4],
            datatype: src[5],
            specific: u16::from_be_bytes([src[6], src[7]]),
            body_len: u32::from_be_bytes([src[8], src[9], src[10], src[11]]),
            opaque: u32::from_be_bytes([src[12], src[13], src[14], src[15]]),
            cas: u64::from_be_bytes([
                src[16], src[17], src[18], src[19], src[20], src[21], src[22], src[23],
            ]),
        };

        let sections =
            header.framing_extras_len as usize + header.extras_len as usize + header.key_len as usize;
        if sections > header.body_len as usize {
            return Err(EmberError::Protocol(format!(
                "section lengths {} exceed body length {}",
                sections, header.body_len
            )));
        }

        Ok(Some(header))
    }

    /// Total size of the frame on the wire, header included.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len as usize
    }
}

/// A single protocol frame: header fields plus the four body sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Magic byte. The flexible framing variant is chosen automatically on encode.
    pub magic: u8,
    /// Raw opcode.
    pub opcode: u8,
    /// Datatype bits.
    pub datatype: u8,
    /// vbucket id on requests, status on responses.
    pub specific: u16,
    /// Correlation id.
    pub opaque: u32,
    /// Compare-and-swap token.
    pub cas: u64,
    /// Flexible framing extras.
    pub framing_extras: Bytes,
    /// Command-specific extras.
    pub extras: Bytes,
    /// Key bytes.
    pub key: Bytes,
    /// Value bytes.
    pub value: Bytes,
}

impl Frame {
    fn empty(magic: u8, opcode: u8) -> Self {
        Self {
            magic,
            opcode,
            datatype: DATATYPE_RAW,
            specific: 0,
            opaque: 0,
            cas: 0,
            framing_extras: Bytes::new(),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Creates an empty request frame for `opcode`.
    pub fn request(opcode: u8) -> Self {
        Self::empty(MAGIC_REQUEST, opcode)
    }

    /// Creates an empty response frame for `opcode` with the given status.
    pub fn response(opcode: u8, status: u16) -> Self {
        let mut frame = Self::empty(MAGIC_RESPONSE, opcode);
        frame.specific = status;
        frame
    }

    /// Sets the key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the extras.
    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    /// Sets the value.
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Sets the flexible framing extras.
    pub fn with_framing_extras(mut self, framing_extras: impl Into<Bytes>) -> Self {
        self.framing_extras = framing_extras.into();
        self
    }

    /// Sets the CAS.
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Sets the datatype bits.
    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    /// Sets the vbucket (on a request) or status (on a response).
    pub fn with_specific(mut self, specific: u16) -> Self {
        self.specific = specific;
        self
    }

    /// Sets the opaque.
    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    /// Returns `true` if this frame is a request.
    pub fn is_request(&self) -> bool {
        matches!(self.magic, MAGIC_REQUEST | MAGIC_ALT_REQUEST)
    }

    /// Returns `true` if this frame is a response.
    pub fn is_response(&self) -> bool {
        matches!(self.magic, MAGIC_RESPONSE | MAGIC_ALT_RESPONSE)
    }

    /// Returns the vbucket id of a request frame.
    pub fn vbucket(&self) -> u16 {
        self.specific
    }

    /// Returns the raw status of a response frame.
    pub fn status(&self) -> u16 {
        self.specific
    }

    /// Returns the length of the body (everything after the header).
    pub fn body_len(&self) -> usize {
        self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Returns the total encoded size of this frame.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    fn wire_magic(&self) -> u8 {
        match (self.is_request(), self.framing_extras.is_empty()) {
            (true, true) => MAGIC_REQUEST,
            (true, false) => MAGIC_ALT_REQUEST,
            (false, true) => MAGIC_RESPONSE,
            (false, false) => MAGIC_ALT_RESPONSE,
        }
    }

    /// Writes this frame to the buffer.
    ///
    /// Fails if a section is too long for its length field.
    pub fn write_to(&self, dst: &mut BytesMut) -> Result<()> {
        if self.extras.len() > u8::MAX as usize {
            return Err(EmberError::Protocol(format!(
                "extras too long: {} bytes",
                self.extras.len()
            )));
        }
        let flexible = !self.framing_extras.is_empty();
        if flexible && (self.framing_extras.len() > u8::MAX as usize || self.key.len() > u8::MAX as usize)
        {
            return Err(EmberError::Protocol(format!(
                "flexible framing limits exceeded: framing extras {} bytes, key {} bytes",
                self.framing_extras.len(),
                self.key.len()
            )));
        }
        if self.key.len() > u16::MAX as usize {
            return Err(EmberError::Protocol(format!(
                "key too long: {} bytes",
                self.key.len()
            )));
        }
        let body_len = u32::try_from(self.body_len())
            .map_err(|_| EmberError::Protocol("frame body exceeds 4 GiB".to_string()))?;

        dst.reserve(self.wire_size());
        dst.put_u8(self.wire_magic());
        dst.put_u8(self.opcode);
        if flexible {
            dst.put_u8(self.framing_extras.len() as u8);
            dst.put_u8(self.key.len() as u8);
        } else {
            dst.put_u16(self.key.len() as u16);
        }
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(self.datatype);
        dst.put_u16(self.specific);
        dst.put_u32(body_len);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.extend_from_slice(&self.framing_extras);
        dst.extend_from_slice(&self.extras);
        dst.extend_from_slice(&self.key);
        dst.extend_from_slice(&self.value);
        Ok(())
    }

    /// Reads a complete frame from the front of the buffer.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a complete frame, in
    /// which case nothing is consumed.
    pub fn read_from(src: &mut BytesMut) -> Result<Option<Self>> {
        let header = match FrameHeader::parse(src)? {
            Some(header) => header,
            None => return Ok(None),
        };
        if src.len() < header.frame_len() {
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let mut body = src.split_to(header.body_len as usize).freeze();
        let framing_extras = body.split_to(header.framing_extras_len as usize);
        let extras = body.split_to(header.extras_len as usize);
        let key = body.split_to(header.key_len as usize);

        Ok(Some(Self {
            magic: header.magic,
            opcode: header.opcode,
            datatype: header.datatype,
            specific: header.specific,
            opaque: header.opaque,
            cas: header.cas,
            framing_extras,
            extras,
            key,
            value: body,
        }))
    }
}
