//! Protocol constants for the binary key-value protocol.

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Magic byte of a classic request frame.
pub const MAGIC_REQUEST: u8 = 0x80;

/// Magic byte of a classic response frame.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Magic byte of a request frame carrying flexible framing extras.
pub const MAGIC_ALT_REQUEST: u8 = 0x08;

/// Magic byte of a response frame carrying flexible framing extras.
pub const MAGIC_ALT_RESPONSE: u8 = 0x18;

/// Default upper bound for a frame body (20 MiB document plus room for metadata).
pub const DEFAULT_MAX_BODY_SIZE: usize = 20 * 1024 * 1024 + 64 * 1024;

/// Default number of vbuckets when a topology does not say otherwise.
pub const DEFAULT_VBUCKET_COUNT: u16 = 1024;

/// Datatype: opaque bytes.
pub const DATATYPE_RAW: u8 = 0x00;

/// Datatype: the value is JSON.
pub const DATATYPE_JSON: u8 = 0x01;

/// Datatype: the value is snappy compressed.
pub const DATATYPE_SNAPPY: u8 = 0x02;

/// Datatype: the value carries extended attributes.
pub const DATATYPE_XATTR: u8 = 0x04;

/// Flexible framing extra id for durability requirements.
pub const FRAMING_ID_DURABILITY: u8 = 0x01;

/// Counter expiry value meaning "fail if the document does not exist".
pub const COUNTER_NO_CREATE: u32 = 0xffff_ffff;

/// Sub-document path flag: create intermediate objects.
pub const SUBDOC_PATH_CREATE_PARENTS: u8 = 0x01;

/// Sub-document path flag: the path addresses an extended attribute.
pub const SUBDOC_PATH_XATTR: u8 = 0x04;

/// Sub-document path flag: expand server-side macros in the value.
pub const SUBDOC_PATH_EXPAND_MACROS: u8 = 0x10;

/// Sub-document document flag: create the document if missing.
pub const SUBDOC_DOC_MKDOC: u8 = 0x01;

/// Sub-document document flag: fail if the document exists.
pub const SUBDOC_DOC_ADD: u8 = 0x02;

/// Sub-document document flag: operate on a deleted (tombstoned) document.
pub const SUBDOC_DOC_ACCESS_DELETED: u8 = 0x04;

/// Maximum number of specs in a single sub-document request.
pub const SUBDOC_MAX_SPECS: usize = 16;

/// Common flags format for JSON documents.
pub const FLAGS_JSON: u32 = 0x0200_0006;

/// Common flags format for binary documents.
pub const FLAGS_BINARY: u32 = 0x0300_0000;

/// HELLO feature codes negotiated during the connection handshake.
pub mod features {
    /// TCP_NODELAY on the server side.
    pub const TCP_NODELAY: u16 = 0x03;
    /// Mutation sequence numbers in mutation responses.
    pub const MUTATION_SEQNO: u16 = 0x04;
    /// Extended attributes.
    pub const XATTR: u16 = 0x06;
    /// Extended error codes.
    pub const XERROR: u16 = 0x07;
    /// SELECT_BUCKET support.
    pub const SELECT_BUCKET: u16 = 0x08;
    /// JSON datatype.
    pub const JSON: u16 = 0x0b;
    /// Responses may arrive out of request order.
    pub const UNORDERED_EXECUTION: u16 = 0x0e;
    /// Flexible framing extras.
    pub const ALT_REQUEST: u16 = 0x10;
    /// Synchronous replication (durability).
    pub const SYNC_REPLICATION: u16 = 0x11;
    /// Collection-aware keys.
    pub const COLLECTIONS: u16 = 0x12;
}
