//! Persisted transaction metadata: attempt records and staged copies.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use ember_core::protocol::DEFAULT_VBUCKET_COUNT;
use ember_core::{vbucket_for_key, CollectionName, EmberError, Result};

const ATR_PREFIX: &str = "_txn:atr-";
const STAGED_PREFIX: &str = "_txn:staged:";

/// Key of the document listing every collection that holds attempt records.
pub(crate) const CLIENT_RECORD_KEY: &str = "_txn:client-record";

/// Key of attempt record slot `slot`.
pub(crate) fn atr_key(slot: u16) -> String {
    format!("{}{}", ATR_PREFIX, slot)
}

/// Slot of the attempt record a transaction whose first mutated key is
/// `first_key` registers in.
pub(crate) fn atr_slot_for(first_key: &str, slots: u16) -> u16 {
    vbucket_for_key(first_key.as_bytes(), DEFAULT_VBUCKET_COUNT) % slots.max(1)
}

/// Key of the staged copy for `key` in `collection`.
pub(crate) fn shadow_key(collection: &CollectionName, key: &str) -> String {
    format!("{}{}:{}", STAGED_PREFIX, collection, key)
}

/// Returns `true` for keys reserved for transaction metadata.
pub fn is_metadata_key(key: &str) -> bool {
    key.starts_with("_txn:")
}

/// State of an attempt as recorded in its attempt record entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    /// Mutations are being staged.
    Staging,
    /// The commit point has passed; staged values are authoritative.
    Committed,
    /// Every staged value has been applied.
    Completed,
    /// The attempt was abandoned before the commit point.
    Aborted,
    /// Every staged copy of an aborted attempt has been removed.
    RolledBack,
}

/// What a staged mutation does to its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    /// Creates the document.
    Insert,
    /// Overwrites the document.
    Replace,
    /// Deletes the document.
    Remove,
}

/// A document an attempt has staged a change for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRef {
    /// `scope.collection` of the document.
    pub collection: String,
    /// Document key.
    pub key: String,
    /// Mutation kind at the time of staging.
    pub kind: MutationKind,
}

impl MutationRef {
    pub(crate) fn new(collection: &CollectionName, key: &str, kind: MutationKind) -> Self {
        Self {
            collection: collection.to_string(),
            key: key.to_string(),
            kind,
        }
    }

    /// Parsed collection name.
    pub fn collection_name(&self) -> Result<CollectionName> {
        self.collection.parse()
    }

    pub(crate) fn is_for(&self, collection: &CollectionName, key: &str) -> bool {
        self.key == key && self.collection == collection.to_string()
    }
}

/// One attempt's entry in an attempt record document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Current state.
    pub state: AttemptState,
    /// When the attempt started, in Unix milliseconds.
    pub started_at_ms: u64,
    /// When the attempt expires, in Unix milliseconds.
    pub expires_at_ms: u64,
    /// Documents with staged changes.
    #[serde(default)]
    pub mutations: Vec<MutationRef>,
}

impl AttemptRecord {
    /// Returns `true` if the attempt is past its expiry at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }
}

/// An attempt record document: entries keyed by transaction id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtrDocument {
    /// Entries by transaction id.
    #[serde(default)]
    pub attempts: BTreeMap<String, AttemptRecord>,
}

impl AtrDocument {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EmberError::Protocol(format!("corrupt attempt record: {}", e)))
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| EmberError::Protocol(format!("failed to encode attempt record: {}", e)))
    }
}

/// A staged copy of a document's intended new state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowDocument {
    /// Transaction that staged the change.
    pub txn_id: String,
    /// Collection of the owning attempt record.
    pub atr_collection: String,
    /// Key of the owning attempt record.
    pub atr_key: String,
    /// What the change does.
    pub kind: MutationKind,
    /// New body, base64 encoded; absent for removes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// CAS of the real document when the change was staged, 0 if absent.
    pub original_cas: u64,
    /// When the change was staged, in Unix milliseconds.
    pub staged_at_ms: u64,
}

impl ShadowDocument {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EmberError::Protocol(format!("corrupt staged document: {}", e)))
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| EmberError::Protocol(format!("failed to encode staged document: {}", e)))
    }

    pub(crate) fn encode_value(value: &[u8]) -> String {
        STANDARD.encode(value)
    }

    /// Decoded staged body, if the change carries one.
    pub fn staged_value(&self) -> Result<Option<Bytes>> {
        self.value
            .as_deref()
            .map(|encoded| {
                STANDARD
                    .decode(encoded)
                    .map(Bytes::from)
                    .map_err(|e| EmberError::Protocol(format!("corrupt staged value: {}", e)))
            })
            .transpose()
    }

    /// Parsed collection of the owning attempt record.
    pub fn atr_collection_name(&self) -> Result<CollectionName> {
        self.atr_collection.parse()
    }
}

/// Collections any client has registered an attempt record in.
///
/// A restarted client reads this to find records in collections it has not
/// touched itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// `scope.collection` names.
    #[serde(default)]
    pub atr_collections: BTreeSet<String>,
}

impl ClientRecord {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EmberError::Protocol(format!("corrupt client record: {}", e)))
    }

    pub(crate) fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| EmberError::Protocol(format!("failed to encode client record: {}", e)))
    }

    /// Parsed collection names; unparseable entries are skipped.
    pub fn collections(&self) -> Vec<CollectionName> {
        self.atr_collections
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect()
    }
}
