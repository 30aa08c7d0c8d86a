//! Binary key-value protocol implementation.
//!
//! Every message is a 24-byte big-endian header followed by framing extras,
//! extras, key and value. [`Request`] and [`Response`] give typed views over
//! [`Frame`]s, and [`FrameCodec`] plugs the framing into tokio's framed I/O.

mod codec;
pub mod constants;
mod frame;
pub mod leb128;
mod opcode;
mod request;
mod response;
pub mod subdoc;

pub use codec::FrameCodec;
pub use constants::*;
pub use frame::{Frame, FrameHeader};
pub use leb128::{encode_collection_key, split_collection_key};
pub use opcode::{Opcode, Status};
pub use request::{ConcatMode, CounterDirection, Request, StoreMode, StoreSemantics};
pub use response::{Outcome, Response, ResponseBody};
pub use subdoc::{LookupInField, LookupInSpec, MutateInField, MutateInSpec, SubdocOpcode};
