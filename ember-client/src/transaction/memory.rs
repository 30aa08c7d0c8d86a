//! In-process [`KvStore`] with the same CAS semantics as the cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use ember_core::{CollectionName, EmberError, Result};

use super::store::{KvStore, StoreOptions, StoredDocument};

type DocKey = (CollectionName, String);

/// A [`KvStore`] held in memory.
///
/// Every write assigns a fresh, strictly increasing CAS.
#[derive(Debug)]
pub struct MemoryStore {
    docs: Mutex<HashMap<DocKey, StoredDocument>>,
    next_cas: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
        }
    }

    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    /// Returns `true` if the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }

    /// Keys stored in `collection`, sorted.
    pub fn keys(&self, collection: &CollectionName) -> Vec<String> {
        let mut keys: Vec<String> = self
            .docs
            .lock()
            .keys()
            .filter(|(c, _)| c == collection)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Reads a document without going through the async trait.
    pub fn peek(&self, collection: &CollectionName, key: &str) -> Option<StoredDocument> {
        self.docs
            .lock()
            .get(&(collection.clone(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(
        &self,
        collection: &CollectionName,
        key: &str,
        _options: &StoreOptions,
    ) -> Result<Option<StoredDocument>> {
        Ok(self.peek(collection, key))
    }

    async fn insert(
        &self,
        collection: &CollectionName,
        key: &str,
        value: Bytes,
        _options: &StoreOptions,
    ) -> Result<u64> {
        let mut docs = self.docs.lock();
        let doc_key = (collection.clone(), key.to_string());
        if docs.contains_key(&doc_key) {
            return Err(EmberError::DocumentExists {
                key: key.to_string(),
            });
        }
        let cas = self.next_cas();
        docs.insert(doc_key, StoredDocument { value, cas });
        Ok(cas)
    }

    async fn replace(
        &self,
        collection: &CollectionName,
        key: &str,
        value: Bytes,
        cas: u64,
        _options: &StoreOptions,
    ) -> Result<u64> {
        let mut docs = self.docs.lock();
        let doc = docs
            .get_mut(&(collection.clone(), key.to_string()))
            .ok_or_else(|| EmberError::DocumentNotFound {
                key: key.to_string(),
            })?;
        if cas != 0 && doc.cas != cas {
            return Err(EmberError::CasMismatch {
                key: key.to_string(),
            });
        }
        let new_cas = self.next_cas();
        *doc = StoredDocument {
            value,
            cas: new_cas,
        };
        Ok(new_cas)
    }

    async fn remove(
        &self,
        collection: &CollectionName,
        key: &str,
        cas: u64,
        _options: &StoreOptions,
    ) -> Result<()> {
        let mut docs = self.docs.lock();
        let doc_key = (collection.clone(), key.to_string());
        match docs.get(&doc_key) {
            None => Err(EmberError::DocumentNotFound {
                key: key.to_string(),
            }),
            Some(doc) if cas != 0 && doc.cas != cas => Err(EmberError::CasMismatch {
                key: key.to_string(),
            }),
            Some(_) => {
                docs.remove(&doc_key);
                Ok(())
            }
        }
    }
}
