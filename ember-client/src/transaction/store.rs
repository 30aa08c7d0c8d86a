//! The document store seam the transaction coordinator writes through.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use ember_core::protocol::{StoreMode, DATATYPE_JSON, FLAGS_JSON};
use ember_core::{CollectionName, DurabilityLevel, EmberError, Result};

use crate::collection::{Collection, GetOptions, RawStore, RemoveOptions};
use crate::dispatch::{DispatchOptions, Dispatcher};

/// A document body and the CAS it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    /// Document body.
    pub value: Bytes,
    /// CAS at read time.
    pub cas: u64,
}

/// Per-write settings passed to a [`KvStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Timeout for the single operation, or the store's default.
    pub timeout: Option<Duration>,
    /// Durability requirement for writes.
    pub durability: DurabilityLevel,
}

/// CAS-checked single-document operations.
///
/// Errors follow the client's taxonomy: a missing document on `replace` or
/// `remove` is [`EmberError::DocumentNotFound`], a taken key on `insert` is
/// [`EmberError::DocumentExists`], and a stale CAS is
/// [`EmberError::CasMismatch`]. A CAS of 0 means no precondition.
#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug {
    /// Reads a document, or `None` if it does not exist.
    async fn get(
        &self,
        collection: &CollectionName,
        key: &str,
        options: &StoreOptions,
    ) -> Result<Option<StoredDocument>>;

    /// Creates a document and returns its CAS.
    async fn insert(
        &self,
        collection: &CollectionName,
        key: &str,
        value: Bytes,
        options: &StoreOptions,
    ) -> Result<u64>;

    /// Overwrites an existing document and returns its new CAS.
    async fn replace(
        &self,
        collection: &CollectionName,
        key: &str,
        value: Bytes,
        cas: u64,
        options: &StoreOptions,
    ) -> Result<u64>;

    /// Deletes a document.
    async fn remove(
        &self,
        collection: &CollectionName,
        key: &str,
        cas: u64,
        options: &StoreOptions,
    ) -> Result<()>;
}

/// [`KvStore`] backed by the cluster.
#[derive(Debug, Clone)]
pub struct ClusterStore {
    dispatcher: Dispatcher,
}

impl ClusterStore {
    /// Creates a store issuing operations through `dispatcher`.
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    fn collection(&self, name: &CollectionName) -> Collection {
        Collection::new(name.clone(), self.dispatcher.clone())
    }

    fn dispatch_options(options: &StoreOptions) -> DispatchOptions {
        DispatchOptions {
            timeout: options.timeout,
            ..DispatchOptions::default()
        }
    }

    fn raw(mode: StoreMode, value: Bytes, cas: u64, options: &StoreOptions) -> RawStore {
        RawStore {
            mode,
            value,
            flags: FLAGS_JSON,
            datatype: DATATYPE_JSON,
            cas,
            expiry: None,
            durability: options.durability,
        }
    }
}

#[async_trait]
impl KvStore for ClusterStore {
    async fn get(
        &self,
        collection: &CollectionName,
        key: &str,
        options: &StoreOptions,
    ) -> Result<Option<StoredDocument>> {
        let mut get = GetOptions::new();
        if let Some(timeout) = options.timeout {
            get = get.timeout(timeout);
        }
        match self.collection(collection).get(key, get).await {
            Ok(result) => Ok(Some(StoredDocument {
                value: result.content().clone(),
                cas: result.cas(),
            })),
            Err(EmberError::DocumentNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn insert(
        &self,
        collection: &CollectionName,
        key: &str,
        value: Bytes,
        options: &StoreOptions,
    ) -> Result<u64> {
        let store = Self::raw(StoreMode::Insert, value, 0, options);
        let result = self
            .collection(collection)
            .store_raw(key, store, &Self::dispatch_options(options))
            .await?;
        Ok(result.cas())
    }

    async fn replace(
        &self,
        collection: &CollectionName,
        key: &str,
        value: Bytes,
        cas: u64,
        options: &StoreOptions,
    ) -> Result<u64> {
        let store = Self::raw(StoreMode::Replace, value, cas, options);
        let result = self
            .collection(collection)
            .store_raw(key, store, &Self::dispatch_options(options))
            .await?;
        Ok(result.cas())
    }

    async fn remove(
        &self,
        collection: &CollectionName,
        key: &str,
        cas: u64,
        options: &StoreOptions,
    ) -> Result<()> {
        let mut remove = RemoveOptions::new().cas(cas).durability(options.durability);
        if let Some(timeout) = options.timeout {
            remove = remove.timeout(timeout);
        }
        self.collection(collection).remove(key, remove).await?;
        Ok(())
    }
}
