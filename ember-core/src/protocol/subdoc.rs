//! Sub-document spec encoding and result decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use super::opcode::Status;
use crate::error::{EmberError, Result};

/// Per-spec sub-document opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubdocOpcode {
    /// Whole-document read (empty path).
    GetDoc = 0x00,
    /// Whole-document write (empty path).
    SetDoc = 0x01,
    /// Whole-document delete (empty path).
    DeleteDoc = 0x04,
    /// Read the value at a path.
    Get = 0xc5,
    /// Test whether a path exists.
    Exists = 0xc6,
    /// Add a dictionary entry; fails if present.
    DictAdd = 0xc7,
    /// Add or replace a dictionary entry.
    DictUpsert = 0xc8,
    /// Delete the value at a path.
    Delete = 0xc9,
    /// Replace the value at a path.
    Replace = 0xca,
    /// Append to an array.
    ArrayPushLast = 0xcb,
    /// Prepend to an array.
    ArrayPushFirst = 0xcc,
    /// Insert into an array at an index.
    ArrayInsert = 0xcd,
    /// Append to an array if the value is not already present.
    ArrayAddUnique = 0xce,
    /// Add a delta to a numeric value.
    Counter = 0xcf,
    /// Count the elements of an array or object.
    GetCount = 0xd2,
}

impl SubdocOpcode {
    /// Looks up a known spec opcode.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::GetDoc,
            0x01 => Self::SetDoc,
            0x04 => Self::DeleteDoc,
            0xc5 => Self::Get,
            0xc6 => Self::Exists,
            0xc7 => Self::DictAdd,
            0xc8 => Self::DictUpsert,
            0xc9 => Self::Delete,
            0xca => Self::Replace,
            0xcb => Self::ArrayPushLast,
            0xcc => Self::ArrayPushFirst,
            0xcd => Self::ArrayInsert,
            0xce => Self::ArrayAddUnique,
            0xcf => Self::Counter,
            0xd2 => Self::GetCount,
            _ => return None,
        })
    }

    /// Returns `true` for specs allowed in a lookup.
    pub fn is_lookup(self) -> bool {
        matches!(self, Self::GetDoc | Self::Get | Self::Exists | Self::GetCount)
    }
}

/// A single lookup spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInSpec {
    /// Spec opcode.
    pub op: SubdocOpcode,
    /// Path flags.
    pub flags: u8,
    /// JSON path.
    pub path: String,
}

impl LookupInSpec {
    fn new(op: SubdocOpcode, path: impl Into<String>) -> Self {
        Self {
            op,
            flags: 0,
            path: path.into(),
        }
    }

    /// Reads the value at `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(SubdocOpcode::Get, path)
    }

    /// Tests whether `path` exists.
    pub fn exists(path: impl Into<String>) -> Self {
        Self::new(SubdocOpcode::Exists, path)
    }

    /// Counts the elements at `path`.
    pub fn count(path: impl Into<String>) -> Self {
        Self::new(SubdocOpcode::GetCount, path)
    }

    /// Reads the whole document body.
    pub fn get_doc() -> Self {
        Self::new(SubdocOpcode::GetDoc, "")
    }

    /// Addresses an extended attribute instead of the document body.
    pub fn xattr(mut self) -> Self {
        self.flags |= SUBDOC_PATH_XATTR;
        self
    }
}

/// A single mutation spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInSpec {
    /// Spec opcode.
    pub op: SubdocOpcode,
    /// Path flags.
    pub flags: u8,
    /// JSON path.
    pub path: String,
    /// JSON-encoded value fragment (empty for deletes).
    pub value: Bytes,
}

impl MutateInSpec {
    fn new(op: SubdocOpcode, path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            op,
            flags: 0,
            path: path.into(),
            value: value.into(),
        }
    }

    /// Adds a dictionary entry; fails with `PathExists` if present.
    pub fn insert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubdocOpcode::DictAdd, path, value)
    }

    /// Adds or replaces a dictionary entry.
    pub fn upsert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubdocOpcode::DictUpsert, path, value)
    }

    /// Replaces an existing value.
    pub fn replace(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubdocOpcode::Replace, path, value)
    }

    /// Removes the value at `path`.
    pub fn remove(path: impl Into<String>) -> Self {
        Self::new(SubdocOpcode::Delete, path, Bytes::new())
    }

    /// Appends to the array at `path`.
    pub fn array_append(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubdocOpcode::ArrayPushLast, path, value)
    }

    /// Prepends to the array at `path`.
    pub fn array_prepend(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubdocOpcode::ArrayPushFirst, path, value)
    }

    /// Inserts into an array; `path` must end in an index.
    pub fn array_insert(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubdocOpcode::ArrayInsert, path, value)
    }

    /// Appends to the array at `path` unless the value is already present.
    pub fn array_add_unique(path: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(SubdocOpcode::ArrayAddUnique, path, value)
    }

    /// Adds `delta` to the number at `path`.
    pub fn increment(path: impl Into<String>, delta: i64) -> Self {
        Self::new(SubdocOpcode::Counter, path, delta.to_string().into_bytes())
    }

    /// Subtracts `delta` from the number at `path`.
    pub fn decrement(path: impl Into<String>, delta: i64) -> Self {
        Self::increment(path, -delta)
    }

    /// Creates missing intermediate objects along the path.
    pub fn create_parents(mut self) -> Self {
        self.flags |= SUBDOC_PATH_CREATE_PARENTS;
        self
    }

    /// Addresses an extended attribute instead of the document body.
    pub fn xattr(mut self) -> Self {
        self.flags |= SUBDOC_PATH_XATTR;
        self
    }

    /// Expands server macros such as `${Mutation.CAS}` in the value.
    pub fn expand_macros(mut self) -> Self {
        self.flags |= SUBDOC_PATH_EXPAND_MACROS | SUBDOC_PATH_XATTR;
        self
    }
}

/// Result of one lookup spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInField {
    /// Raw per-spec status.
    pub status: u16,
    /// Value returned for the spec (empty for `exists`).
    pub value: Bytes,
}

impl LookupInField {
    /// Returns `true` if the spec succeeded.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success.code()
    }
}

/// Result of one mutation spec that produced a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInField {
    /// Index of the spec in the request.
    pub index: u8,
    /// Raw per-spec status.
    pub status: u16,
    /// Value returned for the spec (counter result).
    pub value: Bytes,
}

fn check_spec_count(count: usize) -> Result<()> {
    if count == 0 || count > SUBDOC_MAX_SPECS {
        return Err(EmberError::InvalidArgument(format!(
            "sub-document request needs between 1 and {} specs, got {}",
            SUBDOC_MAX_SPECS, count
        )));
    }
    Ok(())
}

fn path_len(path: &str) -> Result<u16> {
    u16::try_from(path.len())
        .map_err(|_| EmberError::InvalidArgument(format!("path too long: {} bytes", path.len())))
}

/// Encodes lookup specs into a request value.
pub fn encode_lookup_specs(specs: &[LookupInSpec]) -> Result<Bytes> {
    check_spec_count(specs.len())?;
    let mut buf = BytesMut::new();
    for spec in specs {
        if !spec.op.is_lookup() {
            return Err(EmberError::InvalidArgument(format!(
                "{:?} is not a lookup operation",
                spec.op
            )));
        }
        buf.put_u8(spec.op as u8);
        buf.put_u8(spec.flags);
        buf.put_u16(path_len(&spec.path)?);
        buf.extend_from_slice(spec.path.as_bytes());
    }
    Ok(buf.freeze())
}

/// Encodes mutation specs into a request value.
pub fn encode_mutation_specs(specs: &[MutateInSpec]) -> Result<Bytes> {
    check_spec_count(specs.len())?;
    let mut buf = BytesMut::new();
    for spec in specs {
        if spec.op.is_lookup() {
            return Err(EmberError::InvalidArgument(format!(
                "{:?} is not a mutation operation",
                spec.op
            )));
        }
        let value_len = u32::try_from(spec.value.len())
            .map_err(|_| EmberError::InvalidArgument("spec value too large".to_string()))?;
        buf.put_u8(spec.op as u8);
        buf.put_u8(spec.flags);
        buf.put_u16(path_len(&spec.path)?);
        buf.put_u32(value_len);
        buf.extend_from_slice(spec.path.as_bytes());
        buf.extend_from_slice(&spec.value);
    }
    Ok(buf.freeze())
}

fn truncated(what: &str) -> EmberError {
    EmberError::Protocol(format!("truncated sub-document {}", what))
}

fn read_path(buf: &mut Bytes, len: usize) -> Result<String> {
    if buf.remaining() < len {
        return Err(truncated("path"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| EmberError::Protocol("sub-document path is not UTF-8".to_string()))
}

/// Decodes lookup specs from a request value.
pub fn decode_lookup_specs(mut buf: Bytes) -> Result<Vec<LookupInSpec>> {
    let mut specs = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(truncated("lookup spec"));
        }
        let code = buf.get_u8();
        let op = SubdocOpcode::from_code(code)
            .ok_or_else(|| EmberError::Protocol(format!("unknown sub-document opcode 0x{:02x}", code)))?;
        let flags = buf.get_u8();
        let len = buf.get_u16() as usize;
        let path = read_path(&mut buf, len)?;
        specs.push(LookupInSpec { op, flags, path });
    }
    Ok(specs)
}

/// Decodes mutation specs from a request value.
pub fn decode_mutation_specs(mut buf: Bytes) -> Result<Vec<MutateInSpec>> {
    let mut specs = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 8 {
            return Err(truncated("mutation spec"));
        }
        let code = buf.get_u8();
        let op = SubdocOpcode::from_code(code)
            .ok_or_else(|| EmberError::Protocol(format!("unknown sub-document opcode 0x{:02x}", code)))?;
        let flags = buf.get_u8();
        let path_len = buf.get_u16() as usize;
        let value_len = buf.get_u32() as usize;
        let path = read_path(&mut buf, path_len)?;
        if buf.remaining() < value_len {
            return Err(truncated("mutation value"));
        }
        let value = buf.split_to(value_len);
        specs.push(MutateInSpec {
            op,
            flags,
            path,
            value,
        });
    }
    Ok(specs)
}

/// Encodes lookup results into a response value.
pub fn encode_lookup_results(fields: &[LookupInField]) -> Bytes {
    let mut buf = BytesMut::new();
    for field in fields {
        buf.put_u16(field.status);
        buf.put_u32(field.value.len() as u32);
        buf.extend_from_slice(&field.value);
    }
    buf.freeze()
}

/// Decodes lookup results from a response value.
pub fn decode_lookup_results(mut buf: Bytes) -> Result<Vec<LookupInField>> {
    let mut fields = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 6 {
            return Err(truncated("lookup result"));
        }
        let status = buf.get_u16();
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(truncated("lookup value"));
        }
        fields.push(LookupInField {
            status,
            value: buf.split_to(len),
        });
    }
    Ok(fields)
}

/// Encodes mutation results into a response value.
pub fn encode_mutation_results(fields: &[MutateInField]) -> Bytes {
    let mut buf = BytesMut::new();
    for field in fields {
        buf.put_u8(field.index);
        buf.put_u16(field.status);
        buf.put_u32(field.value.len() as u32);
        buf.extend_from_slice(&field.value);
    }
    buf.freeze()
}

/// Decodes mutation results from a successful response value.
pub fn decode_mutation_results(mut buf: Bytes) -> Result<Vec<MutateInField>> {
    let mut fields = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 7 {
            return Err(truncated("mutation result"));
        }
        let index = buf.get_u8();
        let status = buf.get_u16();
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(truncated("mutation value"));
        }
        fields.push(MutateInField {
            index,
            status,
            value: buf.split_to(len),
        });
    }
    Ok(fields)
}

/// Decodes the body of a multi-path mutation failure: the failing spec index and its status.
pub fn decode_mutation_failure(body: &[u8]) -> Option<(u8, u16)> {
    if body.len() < 3 {
        return None;
    }
    Some((body[0], u16::from_be_bytes([body[1], body[2]])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_spec_wire_format() {
        let encoded = encode_lookup_specs(&[LookupInSpec::get("name")]).unwrap();
        assert_eq!(&encoded[..], &[0xc5, 0x00, 0x00, 0x04, b'n', b'a', b'm', b'e']);
    }

    #[test]
    fn test_mutation_spec_flags() {
        let spec = MutateInSpec::upsert("a.b", &b"1"[..]).create_parents();
        let encoded = encode_mutation_specs(&[spec]).unwrap();
        assert_eq!(encoded[0], 0xc8);
        assert_eq!(encoded[1], SUBDOC_PATH_CREATE_PARENTS);
        assert_eq!(&encoded[2..4], &[0, 3]);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_specs_decode_back() {
        let specs = vec![
            MutateInSpec::insert("x", &b"\"v\""[..]),
            MutateInSpec::remove("y"),
            MutateInSpec::increment("n", 5),
        ];
        let decoded = decode_mutation_specs(encode_mutation_specs(&specs).unwrap()).unwrap();
        assert_eq!(decoded, specs);
    }

    #[test]
    fn test_lookup_rejects_mutation_opcode() {
        let spec = LookupInSpec {
            op: SubdocOpcode::DictUpsert,
            flags: 0,
            path: "x".into(),
        };
        assert!(encode_lookup_specs(&[spec]).is_err());
    }

    #[test]
    fn test_spec_count_limits() {
        assert!(encode_lookup_specs(&[]).is_err());
        let too_many: Vec<_> = (0..17).map(|i| LookupInSpec::exists(format!("p{}", i))).collect();
        assert!(encode_lookup_specs(&too_many).is_err());
    }

    #[test]
    fn test_lookup_results_decode() {
        let fields = vec![
            LookupInField {
                status: 0,
                value: Bytes::from_static(b"\"bob\""),
            },
            LookupInField {
                status: Status::SubdocPathNotFound.code(),
                value: Bytes::new(),
            },
        ];
        let decoded = decode_lookup_results(encode_lookup_results(&fields)).unwrap();
        assert_eq!(decoded, fields);
        assert!(decoded[0].is_success());
        assert!(!decoded[1].is_success());
    }

    #[test]
    fn test_truncated_results_are_errors() {
        assert!(decode_lookup_results(Bytes::from_static(&[0, 0, 0, 0, 0, 9, b'x'])).is_err());
        assert!(decode_mutation_results(Bytes::from_static(&[0, 0])).is_err());
    }

    #[test]
    fn test_mutation_failure_body() {
        assert_eq!(decode_mutation_failure(&[2, 0x00, 0xc0]), Some((2, 0x00c0)));
        assert_eq!(decode_mutation_failure(&[1]), None);
    }
}
