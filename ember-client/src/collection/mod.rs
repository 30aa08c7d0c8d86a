//! Key-value operations on one collection.

mod options;
mod results;

pub use options::{
    ConcatOptions, CounterOptions, ExistsOptions, GetOptions, InsertOptions, LookupInOptions,
    MutateInOptions, RemoveOptions, ReplaceOptions, TouchOptions, UnlockOptions, UpsertOptions,
};
pub use results::{
    CounterResult, ExistsResult, GetResult, LookupInResult, MutateInResult, MutationResult,
};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;

use ember_core::document::expiry_to_wire;
use ember_core::protocol::{
    ConcatMode, CounterDirection, LookupInSpec, MutateInSpec, Request, Response, ResponseBody,
    StoreMode, DATATYPE_JSON, FLAGS_JSON,
};
use ember_core::{CollectionName, DurabilityLevel, EmberError, Result};

use crate::dispatch::{DispatchOptions, Dispatcher, Operation};

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn wire_expiry(expiry: Option<Duration>) -> u32 {
    expiry.map_or(0, |e| expiry_to_wire(e, now_unix_secs()))
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| EmberError::InvalidArgument(format!("failed to encode value: {}", e)))
}

fn key_bytes(key: &str) -> Bytes {
    Bytes::copy_from_slice(key.as_bytes())
}

fn unexpected_body(op: &str, body: &ResponseBody) -> EmberError {
    EmberError::Protocol(format!("unexpected {} response body: {:?}", op, body))
}

/// A raw store issued on behalf of another component, such as the
/// transaction store.
#[derive(Debug, Clone)]
pub(crate) struct RawStore {
    pub(crate) mode: StoreMode,
    pub(crate) value: Bytes,
    pub(crate) flags: u32,
    pub(crate) datatype: u8,
    pub(crate) cas: u64,
    pub(crate) expiry: Option<Duration>,
    pub(crate) durability: DurabilityLevel,
}

/// Handle for key-value operations on a single collection.
///
/// Cheap to clone; clones share the underlying connections.
#[derive(Debug, Clone)]
pub struct Collection {
    name: CollectionName,
    dispatcher: Dispatcher,
}

impl Collection {
    pub(crate) fn new(name: CollectionName, dispatcher: Dispatcher) -> Self {
        Self { name, dispatcher }
    }

    /// The collection this handle addresses.
    pub fn name(&self) -> &CollectionName {
        &self.name
    }

    async fn execute(
        &self,
        name: &'static str,
        key: &str,
        request: Request,
        options: &DispatchOptions,
    ) -> Result<Response> {
        let op = Operation::new(name, self.name.clone(), key, request);
        self.dispatcher.execute(&op, options).await
    }

    async fn fetch(
        &self,
        name: &'static str,
        key: &str,
        request: Request,
        options: &GetOptions,
    ) -> Result<GetResult> {
        let response = self.execute(name, key, request, options.dispatch()).await?;
        let cas = response.cas;
        match response.into_body()? {
            ResponseBody::Document { flags, value } => Ok(GetResult { cas, flags, value }),
            other => Err(unexpected_body(name, &other)),
        }
    }

    async fn mutate(
        &self,
        name: &'static str,
        key: &str,
        request: Request,
        options: &DispatchOptions,
    ) -> Result<MutationResult> {
        let response = self.execute(name, key, request, options).await?;
        Ok(MutationResult { cas: response.cas })
    }

    /// Fetches a document.
    pub async fn get(&self, key: &str, options: GetOptions) -> Result<GetResult> {
        let request = Request::Get { key: key_bytes(key) };
        self.fetch("get", key, request, &options).await
    }

    /// Fetches a document and updates its expiry.
    pub async fn get_and_touch(
        &self,
        key: &str,
        expiry: Duration,
        options: GetOptions,
    ) -> Result<GetResult> {
        let request = Request::GetAndTouch {
            key: key_bytes(key),
            expiry: wire_expiry(Some(expiry)),
        };
        self.fetch("get_and_touch", key, request, &options).await
    }

    /// Fetches a document and locks it for `lock_time`.
    ///
    /// Writes without the returned CAS fail with
    /// [`EmberError::DocumentLocked`] until the lock is released with
    /// [`unlock`](Self::unlock) or expires.
    pub async fn get_and_lock(
        &self,
        key: &str,
        lock_time: Duration,
        options: GetOptions,
    ) -> Result<GetResult> {
        let lock_time = u32::try_from(lock_time.as_secs()).unwrap_or(u32::MAX);
        let request = Request::GetAndLock {
            key: key_bytes(key),
            lock_time,
        };
        self.fetch("get_and_lock", key, request, &options).await
    }

    /// Releases a lock taken by [`get_and_lock`](Self::get_and_lock).
    pub async fn unlock(&self, key: &str, cas: u64, options: UnlockOptions) -> Result<()> {
        let request = Request::Unlock {
            key: key_bytes(key),
            cas,
        };
        self.execute("unlock", key, request, options.dispatch())
            .await
            .map(|_| ())
    }

    /// Checks whether a live document exists under `key`.
    pub async fn exists(&self, key: &str, options: ExistsOptions) -> Result<ExistsResult> {
        let request = Request::GetMeta { key: key_bytes(key) };
        match self.execute("exists", key, request, options.dispatch()).await {
            Ok(response) => {
                let cas = response.cas;
                match response.into_body()? {
                    ResponseBody::Meta { deleted, .. } => Ok(ExistsResult {
                        exists: !deleted,
                        cas: if deleted { 0 } else { cas },
                    }),
                    other => Err(unexpected_body("exists", &other)),
                }
            }
            Err(EmberError::DocumentNotFound { .. }) => Ok(ExistsResult {
                exists: false,
                cas: 0,
            }),
            Err(e) => Err(e),
        }
    }

    /// Updates a document's expiry without fetching it.
    pub async fn touch(
        &self,
        key: &str,
        expiry: Duration,
        options: TouchOptions,
    ) -> Result<MutationResult> {
        let request = Request::Touch {
            key: key_bytes(key),
            expiry: wire_expiry(Some(expiry)),
        };
        self.mutate("touch", key, request, options.dispatch()).await
    }

    pub(crate) async fn store_raw(
        &self,
        key: &str,
        store: RawStore,
        options: &DispatchOptions,
    ) -> Result<MutationResult> {
        let name = match store.mode {
            StoreMode::Insert => "insert",
            StoreMode::Upsert => "upsert",
            StoreMode::Replace => "replace",
        };
        let request = Request::Store {
            mode: store.mode,
            key: key_bytes(key),
            value: store.value,
            flags: store.flags,
            expiry: wire_expiry(store.expiry),
            cas: store.cas,
            datatype: store.datatype,
            durability: store.durability,
        };
        self.mutate(name, key, request, options).await
    }

    fn json_store<T: Serialize + ?Sized>(
        mode: StoreMode,
        value: &T,
        cas: u64,
        expiry: Option<Duration>,
        durability: DurabilityLevel,
    ) -> Result<RawStore> {
        Ok(RawStore {
            mode,
            value: encode_json(value)?,
            flags: FLAGS_JSON,
            datatype: DATATYPE_JSON,
            cas,
            expiry,
            durability,
        })
    }

    /// Creates a document from a JSON-serializable value.
    ///
    /// Fails with [`EmberError::DocumentExists`] if the key is taken.
    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: InsertOptions,
    ) -> Result<MutationResult> {
        let store = Self::json_store(
            StoreMode::Insert,
            value,
            0,
            options.expiry,
            options.durability,
        )?;
        self.store_raw(key, store, options.dispatch()).await
    }

    /// Creates or overwrites a document.
    pub async fn upsert<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: UpsertOptions,
    ) -> Result<MutationResult> {
        let store = Self::json_store(
            StoreMode::Upsert,
            value,
            0,
            options.expiry,
            options.durability,
        )?;
        self.store_raw(key, store, options.dispatch()).await
    }

    /// Overwrites an existing document.
    ///
    /// With a CAS set, fails with [`EmberError::CasMismatch`] if the document
    /// changed since that CAS was read.
    pub async fn replace<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: ReplaceOptions,
    ) -> Result<MutationResult> {
        let store = Self::json_store(
            StoreMode::Replace,
            value,
            options.cas,
            options.expiry,
            options.durability,
        )?;
        self.store_raw(key, store, options.dispatch()).await
    }

    /// Deletes a document.
    pub async fn remove(&self, key: &str, options: RemoveOptions) -> Result<MutationResult> {
        let request = Request::Remove {
            key: key_bytes(key),
            cas: options.cas,
            durability: options.durability,
        };
        self.mutate("remove", key, request, options.dispatch()).await
    }

    async fn counter(
        &self,
        name: &'static str,
        key: &str,
        direction: CounterDirection,
        delta: u64,
        options: CounterOptions,
    ) -> Result<CounterResult> {
        if delta == 0 {
            return Err(EmberError::InvalidArgument(format!(
                "{} delta must be greater than zero",
                name
            )));
        }
        let request = Request::Counter {
            direction,
            key: key_bytes(key),
            delta,
            initial: options.initial,
            expiry: wire_expiry(options.expiry),
            durability: options.durability,
        };
        let response = self.execute(name, key, request, options.dispatch()).await?;
        let cas = response.cas;
        match response.into_body()? {
            ResponseBody::Counter(content) => Ok(CounterResult { cas, content }),
            other => Err(unexpected_body(name, &other)),
        }
    }

    /// Adds `delta` to a counter document.
    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        options: CounterOptions,
    ) -> Result<CounterResult> {
        self.counter("increment", key, CounterDirection::Increment, delta, options)
            .await
    }

    /// Subtracts `delta` from a counter document, stopping at zero.
    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        options: CounterOptions,
    ) -> Result<CounterResult> {
        self.counter("decrement", key, CounterDirection::Decrement, delta, options)
            .await
    }

    async fn concat(
        &self,
        name: &'static str,
        key: &str,
        mode: ConcatMode,
        value: Bytes,
        options: ConcatOptions,
    ) -> Result<MutationResult> {
        let request = Request::Concat {
            mode,
            key: key_bytes(key),
            value,
            cas: options.cas,
            durability: options.durability,
        };
        self.mutate(name, key, request, options.dispatch()).await
    }

    /// Appends raw bytes to an existing document.
    pub async fn append(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        options: ConcatOptions,
    ) -> Result<MutationResult> {
        self.concat("append", key, ConcatMode::Append, value.into(), options)
            .await
    }

    /// Prepends raw bytes to an existing document.
    pub async fn prepend(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        options: ConcatOptions,
    ) -> Result<MutationResult> {
        self.concat("prepend", key, ConcatMode::Prepend, value.into(), options)
            .await
    }

    /// Reads several paths of one document in a single round trip.
    pub async fn lookup_in(
        &self,
        key: &str,
        specs: Vec<LookupInSpec>,
        options: LookupInOptions,
    ) -> Result<LookupInResult> {
        let paths = specs.iter().map(|s| s.path.clone()).collect();
        let request = Request::LookupIn {
            key: key_bytes(key),
            specs,
            access_deleted: options.access_deleted,
        };
        let response = self
            .execute("lookup_in", key, request, options.dispatch())
            .await?;
        let cas = response.cas;
        match response.into_body()? {
            ResponseBody::Lookup(fields) => Ok(LookupInResult { cas, paths, fields }),
            other => Err(unexpected_body("lookup_in", &other)),
        }
    }

    /// Applies several path mutations to one document atomically.
    pub async fn mutate_in(
        &self,
        key: &str,
        specs: Vec<MutateInSpec>,
        options: MutateInOptions,
    ) -> Result<MutateInResult> {
        let request = Request::MutateIn {
            key: key_bytes(key),
            specs,
            cas: options.cas,
            expiry: options.expiry.map(|e| expiry_to_wire(e, now_unix_secs())),
            semantics: options.semantics,
            access_deleted: options.access_deleted,
            durability: options.durability,
        };
        let response = self
            .execute("mutate_in", key, request, options.dispatch())
            .await?;
        let cas = response.cas;
        match response.into_body()? {
            ResponseBody::Mutation(fields) => Ok(MutateInResult { cas, fields }),
            ResponseBody::Empty => Ok(MutateInResult {
                cas,
                fields: Vec::new(),
            }),
            other => Err(unexpected_body("mutate_in", &other)),
        }
    }
}
