//! CAS-guarded access to attempt records and staged copies.

use std::sync::Arc;

use ember_core::{CollectionName, EmberError, Result};

use super::records::{shadow_key, AtrDocument, ClientRecord, ShadowDocument, CLIENT_RECORD_KEY};
use super::store::{KvStore, StoreOptions};

/// Attempts made by [`MetadataStore::modify_atr`] before giving up on a
/// contended record.
const ATR_CAS_ATTEMPTS: usize = 64;

/// Where an attempt's record lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct AtrLocation {
    pub(crate) collection: CollectionName,
    pub(crate) key: String,
}

/// Typed reads and writes of transaction metadata over a [`KvStore`].
#[derive(Debug, Clone)]
pub(crate) struct MetadataStore {
    store: Arc<dyn KvStore>,
    options: StoreOptions,
    collection: Option<CollectionName>,
}

impl MetadataStore {
    pub(crate) fn new(
        store: Arc<dyn KvStore>,
        options: StoreOptions,
        collection: Option<CollectionName>,
    ) -> Self {
        Self {
            store,
            options,
            collection,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Collection holding the attempt record for a transaction whose first
    /// mutated document lives in `first`.
    pub(crate) fn atr_collection(&self, first: &CollectionName) -> CollectionName {
        self.collection.clone().unwrap_or_else(|| first.clone())
    }

    /// Collection holding the staged copy of a document in `collection`.
    pub(crate) fn shadow_collection(&self, collection: &CollectionName) -> CollectionName {
        self.collection.clone().unwrap_or_else(|| collection.clone())
    }

    /// Configured metadata collection, if any.
    pub(crate) fn fixed_collection(&self) -> Option<&CollectionName> {
        self.collection.as_ref()
    }

    pub(crate) async fn read_atr(&self, atr: &AtrLocation) -> Result<Option<(AtrDocument, u64)>> {
        match self.store.get(&atr.collection, &atr.key, &self.options).await? {
            Some(doc) => Ok(Some((AtrDocument::decode(&doc.value)?, doc.cas))),
            None => Ok(None),
        }
    }

    /// Applies `update` to the attempt record with a CAS loop.
    ///
    /// `update` may run several times; it returns `Ok(false)` to leave the
    /// record untouched. A missing record starts out empty.
    pub(crate) async fn modify_atr<F>(&self, atr: &AtrLocation, mut update: F) -> Result<AtrDocument>
    where
        F: FnMut(&mut AtrDocument) -> Result<bool> + Send,
    {
        for _ in 0..ATR_CAS_ATTEMPTS {
            let current = self.read_atr(atr).await?;
            let (mut doc, cas) = match current {
                Some((doc, cas)) => (doc, Some(cas)),
                None => (AtrDocument::default(), None),
            };
            if !update(&mut doc)? {
                return Ok(doc);
            }

            let encoded = doc.encode()?;
            let written = match cas {
                Some(cas) => {
                    self.store
                        .replace(&atr.collection, &atr.key, encoded, cas, &self.options)
                        .await
                }
                None => {
                    self.store
                        .insert(&atr.collection, &atr.key, encoded, &self.options)
                        .await
                }
            };
            match written {
                Ok(_) => return Ok(doc),
                Err(EmberError::CasMismatch { .. })
                | Err(EmberError::DocumentExists { .. })
                | Err(EmberError::DocumentNotFound { .. }) => {
                    tracing::trace!(atr = %atr.key, "attempt record changed concurrently");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(EmberError::TemporaryFailure(format!(
            "attempt record {} stayed contended for {} updates",
            atr.key, ATR_CAS_ATTEMPTS
        )))
    }

    /// Collection holding the client record.
    pub(crate) fn client_record_collection(&self) -> CollectionName {
        self.collection.clone().unwrap_or_default()
    }

    pub(crate) async fn read_client_record(&self) -> Result<Option<ClientRecord>> {
        let collection = self.client_record_collection();
        match self
            .store
            .get(&collection, CLIENT_RECORD_KEY, &self.options)
            .await?
        {
            Some(doc) => Ok(Some(ClientRecord::decode(&doc.value)?)),
            None => Ok(None),
        }
    }

    /// Adds `atr_collection` to the client record unless it is listed already.
    pub(crate) async fn record_atr_collection(&self, atr_collection: &CollectionName) -> Result<()> {
        let collection = self.client_record_collection();
        let name = atr_collection.to_string();
        for _ in 0..ATR_CAS_ATTEMPTS {
            let current = self
                .store
                .get(&collection, CLIENT_RECORD_KEY, &self.options)
                .await?;
            let (mut record, cas) = match current {
                Some(doc) => (ClientRecord::decode(&doc.value)?, Some(doc.cas)),
                None => (ClientRecord::default(), None),
            };
            if !record.atr_collections.insert(name.clone()) {
                return Ok(());
            }

            let encoded = record.encode()?;
            let written = match cas {
                Some(cas) => {
                    self.store
                        .replace(&collection, CLIENT_RECORD_KEY, encoded, cas, &self.options)
                        .await
                        .map(|_| ())
                }
                None => {
                    self.store
                        .insert(&collection, CLIENT_RECORD_KEY, encoded, &self.options)
                        .await
                        .map(|_| ())
                }
            };
            match written {
                Ok(()) => {
                    tracing::debug!(collection = %atr_collection, "recorded attempt record collection");
                    return Ok(());
                }
                Err(EmberError::CasMismatch { .. })
                | Err(EmberError::DocumentExists { .. })
                | Err(EmberError::DocumentNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EmberError::TemporaryFailure(format!(
            "client record stayed contended for {} updates",
            ATR_CAS_ATTEMPTS
        )))
    }

    pub(crate) async fn read_shadow(
        &self,
        collection: &CollectionName,
        key: &str,
    ) -> Result<Option<(ShadowDocument, u64)>> {
        let shadow_collection = self.shadow_collection(collection);
        match self
            .store
            .get(&shadow_collection, &shadow_key(collection, key), &self.options)
            .await?
        {
            Some(doc) => Ok(Some((ShadowDocument::decode(&doc.value)?, doc.cas))),
            None => Ok(None),
        }
    }

    /// Writes a staged copy, creating it when `existing_cas` is `None`.
    pub(crate) async fn write_shadow(
        &self,
        collection: &CollectionName,
        key: &str,
        shadow: &ShadowDocument,
        existing_cas: Option<u64>,
    ) -> Result<u64> {
        let shadow_collection = self.shadow_collection(collection);
        let shadow_key = shadow_key(collection, key);
        let encoded = shadow.encode()?;
        match existing_cas {
            Some(cas) => {
                self.store
                    .replace(&shadow_collection, &shadow_key, encoded, cas, &self.options)
                    .await
            }
            None => {
                self.store
                    .insert(&shadow_collection, &shadow_key, encoded, &self.options)
                    .await
            }
        }
    }

    /// Removes a staged copy. A copy that is already gone counts as removed.
    pub(crate) async fn remove_shadow(
        &self,
        collection: &CollectionName,
        key: &str,
        cas: u64,
    ) -> Result<()> {
        let shadow_collection = self.shadow_collection(collection);
        match self
            .store
            .remove(&shadow_collection, &shadow_key(collection, key), cas, &self.options)
            .await
        {
            Ok(()) | Err(EmberError::DocumentNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Removes the staged copy of `key` if it still belongs to `txn_id`.
    pub(crate) async fn remove_own_shadow(
        &self,
        collection: &CollectionName,
        key: &str,
        txn_id: &str,
    ) -> Result<()> {
        loop {
            match self.read_shadow(collection, key).await? {
                Some((shadow, cas)) if shadow.txn_id == txn_id => {
                    match self.remove_shadow(collection, key, cas).await {
                        Err(EmberError::CasMismatch { .. }) => continue,
                        other => return other,
                    }
                }
                _ => return Ok(()),
            }
        }
    }
}
