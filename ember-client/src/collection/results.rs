//! Typed results of collection operations.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use ember_core::protocol::{LookupInField, MutateInField, Status};
use ember_core::{EmberError, Result};

fn decode_json<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| EmberError::InvalidArgument(format!("failed to decode {}: {}", what, e)))
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub(crate) cas: u64,
    pub(crate) flags: u32,
    pub(crate) value: Bytes,
}

impl GetResult {
    /// CAS of the document when it was read.
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// User flags stored with the document.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Raw document body.
    pub fn content(&self) -> &Bytes {
        &self.value
    }

    /// Deserializes the body as JSON.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_json(&self.value, "document body")
    }
}

/// Result of a full-document mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub(crate) cas: u64,
}

impl MutationResult {
    /// CAS of the document after the mutation.
    pub fn cas(&self) -> u64 {
        self.cas
    }
}

/// Result of an existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistsResult {
    pub(crate) exists: bool,
    pub(crate) cas: u64,
}

impl ExistsResult {
    /// Whether a live document is stored under the key.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// CAS of the document, or 0 if it does not exist.
    pub fn cas(&self) -> u64 {
        self.cas
    }
}

/// Result of `increment` or `decrement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub(crate) cas: u64,
    pub(crate) content: u64,
}

impl CounterResult {
    /// CAS of the counter after the operation.
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Counter value after the operation.
    pub fn content(&self) -> u64 {
        self.content
    }
}

/// Per-spec results of `lookup_in`, in spec order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInResult {
    pub(crate) cas: u64,
    pub(crate) paths: Vec<String>,
    pub(crate) fields: Vec<LookupInField>,
}

impl LookupInResult {
    /// CAS of the document when it was read.
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Number of spec results.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if there are no results.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether the spec at `index` found its path.
    ///
    /// For `exists` specs this is the lookup's answer.
    pub fn exists(&self, index: usize) -> bool {
        self.fields.get(index).map_or(false, LookupInField::is_success)
    }

    /// Raw status of the spec at `index`.
    pub fn status(&self, index: usize) -> Option<Status> {
        self.fields
            .get(index)
            .and_then(|field| Status::from_code(field.status))
    }

    /// Raw value of the spec at `index`.
    pub fn raw(&self, index: usize) -> Result<&Bytes> {
        let field = self.fields.get(index).ok_or_else(|| {
            EmberError::InvalidArgument(format!("no lookup result at index {}", index))
        })?;
        if field.is_success() {
            return Ok(&field.value);
        }

        let path = self.paths.get(index).cloned().unwrap_or_default();
        Err(match Status::from_code(field.status) {
            Some(Status::SubdocPathNotFound) => EmberError::PathNotFound { path },
            Some(Status::SubdocPathMismatch) => EmberError::PathMismatch { path },
            Some(status) => {
                EmberError::InvalidArgument(format!("lookup of '{}' failed: {}", path, status))
            }
            None => EmberError::UnknownStatus {
                opcode: ember_core::protocol::Opcode::LookupIn.code(),
                status: field.status,
            },
        })
    }

    /// Deserializes the value of the spec at `index` as JSON.
    pub fn content_as<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        decode_json(self.raw(index)?, "lookup value")
    }
}

/// Result of `mutate_in`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateInResult {
    pub(crate) cas: u64,
    pub(crate) fields: Vec<MutateInField>,
}

impl MutateInResult {
    /// CAS of the document after the mutation.
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Deserializes the value returned by the spec at `index`, such as a
    /// sub-document counter's new value.
    pub fn content_as<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let field = self
            .fields
            .iter()
            .find(|field| usize::from(field.index) == index)
            .ok_or_else(|| {
                EmberError::InvalidArgument(format!("spec {} returned no value", index))
            })?;
        decode_json(&field.value, "mutation value")
    }
}
