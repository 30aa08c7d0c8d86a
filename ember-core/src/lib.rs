//! Core types and protocols for ember.
//!
//! This crate has no I/O of its own: it defines the wire codec, the
//! request/response model, key hashing and the error taxonomy shared by
//! `ember-client` and by anything that needs to speak the protocol.

#![warn(missing_docs)]

pub mod document;
pub mod error;
pub mod hash;
pub mod protocol;

pub use document::{CollectionName, DocumentId, DurabilityLevel};
pub use error::{EmberError, ErrorCategory, Result};
pub use hash::vbucket_for_key;
