//! A single transaction attempt.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::instrument;
use uuid::Uuid;

use ember_core::{CollectionName, EmberError, Result};

use super::cleanup::CleanupRequest;
use super::clock::Clock;
use super::metadata::{AtrLocation, MetadataStore};
use super::records::{
    atr_key, atr_slot_for, AttemptRecord, AttemptState, MutationKind, MutationRef, ShadowDocument,
};
use super::recovery::{Recovery, Resolution};
use super::store::StoredDocument;
use super::unstage::{discard_all, unstage_all};
use super::TransactionResult;
use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::diagnostics::SlowOperationDetector;

/// Attempts at resolving another transaction's staged copy before staging gives up.
const SHADOW_RESOLVE_ATTEMPTS: usize = 8;

type DocKey = (CollectionName, String);

/// The current state of a transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Mutations can be staged.
    Staging,
    /// The commit record is being flipped.
    Committing,
    /// The commit point has passed.
    Committed,
    /// A conflict ended the attempt; it can only be rolled back.
    Aborting,
    /// The attempt was aborted but its staged copies could not all be removed.
    Aborted,
    /// The attempt was aborted and no trace of it remains.
    RolledBack,
    /// The attempt ran past its expiration before committing.
    Expired,
}

/// A document as seen from inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionGetResult {
    collection: CollectionName,
    key: String,
    cas: u64,
    value: Bytes,
}

impl TransactionGetResult {
    /// Collection the document lives in.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Document key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// CAS of the underlying document when it was read, 0 if it does not
    /// exist outside this transaction.
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Raw document body.
    pub fn content(&self) -> &Bytes {
        &self.value
    }

    /// Deserializes the body from JSON.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(|e| {
            EmberError::InvalidArgument(format!("'{}' is not valid for the target type: {}", self.key, e))
        })
    }
}

#[derive(Debug, Clone)]
struct Staged {
    kind: MutationKind,
    value: Option<Bytes>,
    original_cas: u64,
    shadow_cas: u64,
}

/// Shared state every attempt of one [`Transactions`](super::Transactions)
/// instance is created from.
#[derive(Debug, Clone)]
pub(crate) struct AttemptEnv {
    pub(crate) recovery: Recovery,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) retry: RetryConfig,
    pub(crate) slots: u16,
    pub(crate) handoff: Option<mpsc::Sender<CleanupRequest>>,
    pub(crate) atr_collections: Arc<Mutex<BTreeSet<CollectionName>>>,
    pub(crate) detector: Arc<SlowOperationDetector>,
}

struct AttemptInner {
    id: String,
    env: AttemptEnv,
    metadata: MetadataStore,
    started_at_ms: u64,
    expires_at_ms: u64,
    state: Mutex<TransactionState>,
    atr: tokio::sync::Mutex<Option<AtrLocation>>,
    staged: Mutex<HashMap<DocKey, Staged>>,
    doc_locks: Mutex<HashMap<DocKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Handle for staging mutations in one transaction attempt.
///
/// Cloning is cheap; clones share the attempt. Operations on different
/// documents may run concurrently, operations on the same document are
/// serialized.
#[derive(Clone)]
pub struct AttemptContext {
    inner: Arc<AttemptInner>,
}

impl fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptContext")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("staged", &self.inner.staged.lock().len())
            .field("expires_at_ms", &self.inner.expires_at_ms)
            .finish()
    }
}

impl AttemptContext {
    pub(crate) fn new(env: AttemptEnv, metadata: MetadataStore, expiration: Duration) -> Self {
        let started_at_ms = env.clock.now_ms();
        let expires_at_ms = started_at_ms.saturating_add(expiration.as_millis() as u64);
        Self {
            inner: Arc::new(AttemptInner {
                id: Uuid::new_v4().to_string(),
                env,
                metadata,
                started_at_ms,
                expires_at_ms,
                state: Mutex::new(TransactionState::Staging),
                atr: tokio::sync::Mutex::new(None),
                staged: Mutex::new(HashMap::new()),
                doc_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the transaction ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    /// Returns when the attempt expires, in Unix milliseconds.
    pub fn expires_at_ms(&self) -> u64 {
        self.inner.expires_at_ms
    }

    /// Returns `true` once the attempt is past its expiration.
    pub fn is_expired(&self) -> bool {
        self.inner.env.clock.now_ms() > self.inner.expires_at_ms
    }

    /// Number of documents with a staged change.
    pub fn staged_count(&self) -> usize {
        self.inner.staged.lock().len()
    }

    fn set_state(&self, state: TransactionState) {
        *self.inner.state.lock() = state;
    }

    /// Moves a staging attempt to `Aborting` when `error` is a write-write
    /// conflict.
    fn abort_on_conflict(&self, error: EmberError) -> EmberError {
        if matches!(error, EmberError::WriteWriteConflict { .. }) {
            let mut state = self.inner.state.lock();
            if *state == TransactionState::Staging {
                *state = TransactionState::Aborting;
                tracing::debug!(txn_id = %self.inner.id, error = %error, "conflict aborts the attempt");
            }
        }
        error
    }

    fn remaining(&self) -> Duration {
        let now = self.inner.env.clock.now_ms();
        Duration::from_millis(self.inner.expires_at_ms.saturating_sub(now))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_expired() {
            let mut state = self.inner.state.lock();
            if *state == TransactionState::Staging {
                *state = TransactionState::Expired;
            }
            return Err(EmberError::TransactionExpired(format!(
                "transaction {} expired",
                self.inner.id
            )));
        }
        match self.state() {
            TransactionState::Staging => Ok(()),
            other => Err(EmberError::TransactionFailed(format!(
                "transaction {} is {:?}, not staging",
                self.inner.id, other
            ))),
        }
    }

    fn own_staged(&self, collection: &CollectionName, key: &str) -> Option<Staged> {
        self.inner
            .staged
            .lock()
            .get(&(collection.clone(), key.to_string()))
            .cloned()
    }

    fn doc_lock(&self, collection: &CollectionName, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .doc_locks
            .lock()
            .entry((collection.clone(), key.to_string()))
            .or_default()
            .clone()
    }

    async fn read_real(&self, collection: &CollectionName, key: &str) -> Result<Option<StoredDocument>> {
        let metadata = &self.inner.metadata;
        metadata.store().get(collection, key, metadata.options()).await
    }

    async fn attempt_state_of(&self, shadow: &ShadowDocument) -> Result<Option<AttemptRecord>> {
        let atr = AtrLocation {
            collection: shadow.atr_collection_name()?,
            key: shadow.atr_key.clone(),
        };
        Ok(self
            .inner
            .metadata
            .read_atr(&atr)
            .await?
            .and_then(|(mut doc, _)| doc.attempts.remove(&shadow.txn_id)))
    }

    /// Resolves the expired attempt that owns `shadow`.
    async fn resolve_blocking(&self, shadow: &ShadowDocument) -> Result<Resolution> {
        let atr_collection = shadow.atr_collection_name()?;
        let resolution = self
            .inner
            .env
            .recovery
            .resolve_attempt(&atr_collection, &shadow.atr_key, &shadow.txn_id, false)
            .await?;
        tracing::debug!(blocking = %shadow.txn_id, ?resolution, "resolved expired attempt");
        Ok(resolution)
    }

    /// Reads a document, observing this attempt's own staged changes.
    ///
    /// An expired committed attempt found holding the document is rolled
    /// forward first.
    ///
    /// Values of other transactions that have committed but not yet been
    /// applied are returned in place of the stored body.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::TransactionExpired`] past the expiration or a
    /// storage error from the underlying store.
    #[instrument(name = "transaction.get", skip(self, collection), fields(txn_id = %self.inner.id))]
    pub async fn get(
        &self,
        collection: &CollectionName,
        key: &str,
    ) -> Result<Option<TransactionGetResult>> {
        self.ensure_active()?;
        let mut real = self.read_real(collection, key).await?;
        let real_cas = real.as_ref().map(|doc| doc.cas).unwrap_or(0);

        if let Some(staged) = self.own_staged(collection, key) {
            return Ok(staged.value.map(|value| TransactionGetResult {
                collection: collection.clone(),
                key: key.to_string(),
                cas: real_cas,
                value,
            }));
        }

        if let Some((shadow, _)) = self.inner.metadata.read_shadow(collection, key).await? {
            if shadow.txn_id != self.inner.id {
                match self.attempt_state_of(&shadow).await? {
                    Some(entry)
                        if entry.state == AttemptState::Committed
                            && !entry.is_expired(self.inner.env.clock.now_ms()) =>
                    {
                        return Ok(shadow.staged_value()?.map(|value| TransactionGetResult {
                            collection: collection.clone(),
                            key: key.to_string(),
                            cas: real_cas,
                            value,
                        }));
                    }
                    Some(entry) if entry.state == AttemptState::Committed => {
                        let resolution = self.resolve_blocking(&shadow).await?;
                        if resolution != Resolution::Completed {
                            return Ok(shadow.staged_value()?.map(|value| TransactionGetResult {
                                collection: collection.clone(),
                                key: key.to_string(),
                                cas: real_cas,
                                value,
                            }));
                        }
                        real = self.read_real(collection, key).await?;
                    }
                    _ => {}
                }
            }
        }

        Ok(real.map(|doc| TransactionGetResult {
            collection: collection.clone(),
            key: key.to_string(),
            cas: doc.cas,
            value: doc.value,
        }))
    }

    /// Stages the creation of a document.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::DocumentExists`] if the document exists, or
    /// [`EmberError::WriteWriteConflict`] if another transaction holds it.
    #[instrument(name = "transaction.insert", skip(self, collection, value), fields(txn_id = %self.inner.id))]
    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        collection: &CollectionName,
        key: &str,
        value: &T,
    ) -> Result<TransactionGetResult> {
        self.ensure_active()?;
        let body = encode_value(key, value)?;
        let lock = self.doc_lock(collection, key);
        let _guard = lock.lock().await;

        match self.own_staged(collection, key) {
            Some(Staged {
                kind: MutationKind::Remove,
                original_cas,
                ..
            }) => {
                return self
                    .stage(collection, key, MutationKind::Replace, Some(body), original_cas)
                    .await;
            }
            Some(_) => {
                return Err(EmberError::DocumentExists {
                    key: key.to_string(),
                })
            }
            None => {}
        }

        if self.read_real(collection, key).await?.is_some() {
            return Err(EmberError::DocumentExists {
                key: key.to_string(),
            });
        }
        self.stage(collection, key, MutationKind::Insert, Some(body), 0)
            .await
    }

    /// Stages a new body for a document previously read in this attempt.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::WriteWriteConflict`] if the document changed
    /// since `doc` was read or another transaction holds it, and
    /// [`EmberError::DocumentNotFound`] if it was removed.
    #[instrument(
        name = "transaction.replace",
        skip(self, doc, value),
        fields(txn_id = %self.inner.id, key = %doc.key)
    )]
    pub async fn replace<T: Serialize + ?Sized>(
        &self,
        doc: &TransactionGetResult,
        value: &T,
    ) -> Result<TransactionGetResult> {
        self.ensure_active()?;
        let (collection, key) = (&doc.collection, doc.key.as_str());
        let body = encode_value(key, value)?;
        let lock = self.doc_lock(collection, key);
        let _guard = lock.lock().await;

        if let Some(staged) = self.own_staged(collection, key) {
            let kind = match staged.kind {
                MutationKind::Remove => {
                    return Err(EmberError::DocumentNotFound {
                        key: key.to_string(),
                    })
                }
                MutationKind::Insert => MutationKind::Insert,
                MutationKind::Replace => MutationKind::Replace,
            };
            return self
                .stage(collection, key, kind, Some(body), staged.original_cas)
                .await;
        }

        let original_cas = self
            .check_unchanged(doc)
            .await
            .map_err(|e| self.abort_on_conflict(e))?;
        self.stage(collection, key, MutationKind::Replace, Some(body), original_cas)
            .await
    }

    /// Stages the removal of a document previously read in this attempt.
    ///
    /// # Errors
    ///
    /// Same as [`replace`](Self::replace).
    #[instrument(
        name = "transaction.remove",
        skip(self, doc),
        fields(txn_id = %self.inner.id, key = %doc.key)
    )]
    pub async fn remove(&self, doc: &TransactionGetResult) -> Result<()> {
        self.ensure_active()?;
        let (collection, key) = (&doc.collection, doc.key.as_str());
        let lock = self.doc_lock(collection, key);
        let _guard = lock.lock().await;

        if let Some(staged) = self.own_staged(collection, key) {
            return match staged.kind {
                MutationKind::Insert => {
                    self.inner
                        .metadata
                        .remove_shadow(collection, key, staged.shadow_cas)
                        .await?;
                    self.inner
                        .staged
                        .lock()
                        .remove(&(collection.clone(), key.to_string()));
                    Ok(())
                }
                MutationKind::Replace => self
                    .stage(collection, key, MutationKind::Remove, None, staged.original_cas)
                    .await
                    .map(|_| ()),
                MutationKind::Remove => Err(EmberError::DocumentNotFound {
                    key: key.to_string(),
                }),
            };
        }

        let original_cas = self
            .check_unchanged(doc)
            .await
            .map_err(|e| self.abort_on_conflict(e))?;
        self.stage(collection, key, MutationKind::Remove, None, original_cas)
            .await
            .map(|_| ())
    }

    /// Returns the current CAS of `doc` after checking it still matches the read.
    async fn check_unchanged(&self, doc: &TransactionGetResult) -> Result<u64> {
        match self.read_real(&doc.collection, &doc.key).await? {
            Some(real) if doc.cas != 0 && real.cas != doc.cas => Err(EmberError::WriteWriteConflict {
                key: doc.key.clone(),
                reason: "document changed since it was read".to_string(),
            }),
            Some(_) if doc.cas == 0 => Err(EmberError::WriteWriteConflict {
                key: doc.key.clone(),
                reason: "document was created since it was read".to_string(),
            }),
            Some(real) => Ok(real.cas),
            None if doc.cas != 0 => Err(EmberError::DocumentNotFound {
                key: doc.key.clone(),
            }),
            None => Err(EmberError::WriteWriteConflict {
                key: doc.key.clone(),
                reason: "document is being changed by another transaction".to_string(),
            }),
        }
    }

    async fn register_mutation(&self, mutation: MutationRef) -> Result<()> {
        let mut atr_guard = self.inner.atr.lock().await;
        let first = atr_guard.is_none();
        let atr = match atr_guard.as_ref() {
            Some(atr) => atr.clone(),
            None => {
                let collection = self
                    .inner
                    .metadata
                    .atr_collection(&mutation.collection_name()?);
                let slot = atr_slot_for(&mutation.key, self.inner.env.slots);
                AtrLocation {
                    collection,
                    key: atr_key(slot),
                }
            }
        };

        if first && !self.inner.env.atr_collections.lock().contains(&atr.collection) {
            self.inner
                .metadata
                .record_atr_collection(&atr.collection)
                .await?;
        }

        let id = self.inner.id.as_str();
        let (started_at_ms, expires_at_ms) = (self.inner.started_at_ms, self.inner.expires_at_ms);
        self.inner
            .metadata
            .modify_atr(&atr, |doc| {
                match doc.attempts.get_mut(id) {
                    Some(entry) if entry.state == AttemptState::Staging => {
                        if entry
                            .mutations
                            .iter()
                            .any(|m| m.key == mutation.key && m.collection == mutation.collection)
                        {
                            return Ok(false);
                        }
                        entry.mutations.push(mutation.clone());
                    }
                    Some(_) => {
                        return Err(EmberError::TransactionExpired(format!(
                            "transaction {} was aborted by cleanup",
                            id
                        )))
                    }
                    None if first => {
                        doc.attempts.insert(
                            id.to_string(),
                            AttemptRecord {
                                state: AttemptState::Staging,
                                started_at_ms,
                                expires_at_ms,
                                mutations: vec![mutation.clone()],
                            },
                        );
                    }
                    None => {
                        return Err(EmberError::TransactionExpired(format!(
                            "attempt record entry of transaction {} is gone",
                            id
                        )))
                    }
                }
                Ok(true)
            })
            .await?;

        if first {
            tracing::debug!(txn_id = id, atr = %atr.key, "registered attempt");
            self.inner.env.atr_collections.lock().insert(atr.collection.clone());
            *atr_guard = Some(atr);
        }
        Ok(())
    }

    /// Makes room for this attempt's staged copy of `key`, returning the CAS
    /// of an existing copy this attempt already owns.
    async fn claim_shadow(&self, collection: &CollectionName, key: &str) -> Result<Option<u64>> {
        let metadata = &self.inner.metadata;
        for _ in 0..SHADOW_RESOLVE_ATTEMPTS {
            let Some((shadow, shadow_cas)) = metadata.read_shadow(collection, key).await? else {
                return Ok(None);
            };
            if shadow.txn_id == self.inner.id {
                return Ok(Some(shadow_cas));
            }

            let conflict = || EmberError::WriteWriteConflict {
                key: key.to_string(),
                reason: format!("staged by transaction {}", shadow.txn_id),
            };
            match self.attempt_state_of(&shadow).await? {
                None => {}
                Some(entry) => match entry.state {
                    AttemptState::Staging if !entry.is_expired(self.inner.env.clock.now_ms()) => {
                        return Err(conflict())
                    }
                    AttemptState::Staging => {
                        if self.resolve_blocking(&shadow).await? != Resolution::RolledBack {
                            return Err(conflict());
                        }
                        continue;
                    }
                    AttemptState::Committed if !entry.is_expired(self.inner.env.clock.now_ms()) => {
                        return Err(conflict())
                    }
                    AttemptState::Committed => {
                        // The document now holds the committed value, which
                        // this attempt has not read.
                        let resolution = self.resolve_blocking(&shadow).await?;
                        return Err(EmberError::WriteWriteConflict {
                            key: key.to_string(),
                            reason: format!(
                                "committed transaction {} was {:?} while staging",
                                shadow.txn_id, resolution
                            ),
                        });
                    }
                    AttemptState::Completed | AttemptState::Aborted | AttemptState::RolledBack => {}
                },
            }

            match metadata.remove_shadow(collection, key, shadow_cas).await {
                Ok(()) | Err(EmberError::CasMismatch { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EmberError::WriteWriteConflict {
            key: key.to_string(),
            reason: "staged copy kept changing".to_string(),
        })
    }

    async fn stage(
        &self,
        collection: &CollectionName,
        key: &str,
        kind: MutationKind,
        value: Option<Bytes>,
        original_cas: u64,
    ) -> Result<TransactionGetResult> {
        self.register_mutation(MutationRef::new(collection, key, kind))
            .await?;
        let existing = self
            .claim_shadow(collection, key)
            .await
            .map_err(|e| self.abort_on_conflict(e))?;

        let atr = self
            .inner
            .atr
            .lock()
            .await
            .clone()
            .ok_or_else(|| EmberError::TransactionFailed("attempt has no record".to_string()))?;
        let shadow = ShadowDocument {
            txn_id: self.inner.id.clone(),
            atr_collection: atr.collection.to_string(),
            atr_key: atr.key,
            kind,
            value: value.as_deref().map(ShadowDocument::encode_value),
            original_cas,
            staged_at_ms: self.inner.env.clock.now_ms(),
        };

        let shadow_cas = match self
            .inner
            .metadata
            .write_shadow(collection, key, &shadow, existing)
            .await
        {
            Ok(cas) => cas,
            Err(EmberError::DocumentExists { .. }) | Err(EmberError::CasMismatch { .. }) => {
                return Err(self.abort_on_conflict(EmberError::WriteWriteConflict {
                    key: key.to_string(),
                    reason: "another transaction staged a change concurrently".to_string(),
                }))
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(txn_id = %self.inner.id, key, ?kind, "staged mutation");
        self.inner.staged.lock().insert(
            (collection.clone(), key.to_string()),
            Staged {
                kind,
                value: value.clone(),
                original_cas,
                shadow_cas,
            },
        );
        Ok(TransactionGetResult {
            collection: collection.clone(),
            key: key.to_string(),
            cas: original_cas,
            value: value.unwrap_or_default(),
        })
    }

    fn mutation_refs(&self) -> Vec<MutationRef> {
        self.inner
            .staged
            .lock()
            .iter()
            .map(|((collection, key), staged)| MutationRef::new(collection, key, staged.kind))
            .collect()
    }

    fn hand_off(&self, atr: &AtrLocation) {
        let Some(handoff) = &self.inner.env.handoff else {
            return;
        };
        let request = CleanupRequest {
            atr: atr.clone(),
            txn_id: self.inner.id.clone(),
        };
        match handoff.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(txn_id = %self.inner.id, "cleanup queue is full; lost attempt scans will finish this attempt");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(txn_id = %self.inner.id, "cleanup worker is gone; lost attempt scans will finish this attempt");
            }
        }
    }

    /// Flips the attempt record entry to `COMMITTED`.
    async fn flip_to_committed(&self, atr: &AtrLocation) -> Result<()> {
        let id = self.inner.id.as_str();
        let mutations = self.mutation_refs();
        let mut backoff = Backoff::new(&self.inner.env.retry);
        loop {
            let flipped = self
                .inner
                .metadata
                .modify_atr(atr, |doc| match doc.attempts.get_mut(id) {
                    Some(entry) if entry.state == AttemptState::Staging => {
                        entry.state = AttemptState::Committed;
                        entry.mutations = mutations.clone();
                        Ok(true)
                    }
                    Some(entry) if entry.state == AttemptState::Committed => Ok(false),
                    Some(entry) => Err(EmberError::TransactionExpired(format!(
                        "transaction {} was {:?} by cleanup",
                        id, entry.state
                    ))),
                    None => Err(EmberError::TransactionExpired(format!(
                        "attempt record entry of transaction {} is gone",
                        id
                    ))),
                })
                .await;

            let error = match flipped {
                Ok(_) => return Ok(()),
                Err(e @ EmberError::TransactionExpired(_)) => return Err(e),
                Err(e @ EmberError::Timeout(_)) => e,
                Err(e) if e.is_ambiguous() || e.is_transient() => e,
                Err(e) => return Err(e),
            };

            match self.inner.metadata.read_atr(atr).await {
                Ok(Some((doc, _))) => match doc.attempts.get(id).map(|entry| entry.state) {
                    Some(AttemptState::Committed) => return Ok(()),
                    Some(AttemptState::Staging) if !self.is_expired() => {
                        tracing::debug!(txn_id = id, error = %error, "retrying commit record write");
                        sleep(backoff.next_delay()).await;
                    }
                    Some(AttemptState::Staging) => {
                        return Err(EmberError::TransactionExpired(format!(
                            "transaction {} expired before its commit record was written",
                            id
                        )))
                    }
                    _ => {
                        return Err(EmberError::TransactionExpired(format!(
                            "transaction {} was aborted by cleanup",
                            id
                        )))
                    }
                },
                Ok(None) => {
                    return Err(EmberError::TransactionExpired(format!(
                        "attempt record of transaction {} is gone",
                        id
                    )))
                }
                Err(read_error) => {
                    return Err(EmberError::CommitAmbiguous(format!(
                        "commit record write failed ({}) and could not be re-read ({})",
                        error, read_error
                    )))
                }
            }
        }
    }

    /// Fails with a conflict if any staged document changed since staging.
    async fn validate_staged(&self) -> Result<()> {
        let staged: Vec<(DocKey, u64)> = self
            .inner
            .staged
            .lock()
            .iter()
            .map(|(doc_key, staged)| (doc_key.clone(), staged.original_cas))
            .collect();
        let checks = join_all(staged.into_iter().map(|((collection, key), original_cas)| async move {
            let current = self.read_real(&collection, &key).await?.map(|doc| doc.cas);
            let unchanged = match current {
                Some(cas) => cas == original_cas,
                None => original_cas == 0,
            };
            if unchanged {
                Ok(())
            } else {
                Err(EmberError::WriteWriteConflict {
                    key,
                    reason: "document changed outside the transaction before commit".to_string(),
                })
            }
        }))
        .await;
        checks.into_iter().collect()
    }

    async fn remove_attempt_entry(&self, atr: &AtrLocation) -> Result<()> {
        let id = self.inner.id.as_str();
        self.inner
            .metadata
            .modify_atr(atr, |doc| Ok(doc.attempts.remove(id).is_some()))
            .await
            .map(|_| ())
    }

    /// Commits the attempt.
    ///
    /// Once the commit record flips, the transaction is committed even if
    /// applying the changes does not finish within the expiration; the rest
    /// is left to cleanup and reported through
    /// [`TransactionResult::unstaging_complete`].
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::TransactionExpired`] if the expiration passed
    /// before the commit point, [`EmberError::WriteWriteConflict`] if a staged
    /// document was changed by someone else since it was staged,
    /// [`EmberError::CommitAmbiguous`] if the commit record write could not be
    /// confirmed, and [`EmberError::TransactionFailed`] otherwise, including
    /// for an attempt a conflict already aborted. The attempt is rolled back
    /// in every case but the ambiguous one.
    #[instrument(name = "transaction.commit", skip(self), fields(txn_id = %self.inner.id))]
    pub async fn commit(&self) -> Result<TransactionResult> {
        match self.state() {
            TransactionState::Staging => {}
            TransactionState::Aborting => {
                if let Err(rollback_error) = self.rollback_internal().await {
                    tracing::warn!(txn_id = %self.inner.id, error = %rollback_error, "rollback of aborted attempt failed");
                }
                return Err(EmberError::TransactionFailed(format!(
                    "transaction {} was aborted by a write-write conflict",
                    self.inner.id
                )));
            }
            other => {
                return Err(EmberError::TransactionFailed(format!(
                    "transaction {} is {:?}, not staging",
                    self.inner.id, other
                )))
            }
        }
        let detector = self.inner.env.detector.clone();
        let _tracker = detector.start_operation("transaction.commit");

        if self.is_expired() {
            let _ = self.rollback_internal().await;
            self.set_state(TransactionState::Expired);
            return Err(EmberError::TransactionExpired(format!(
                "transaction {} expired before commit",
                self.inner.id
            )));
        }

        let registered = self.inner.atr.lock().await.clone();
        let Some(atr) = registered else {
            self.set_state(TransactionState::Committed);
            return Ok(TransactionResult {
                transaction_id: self.inner.id.clone(),
                unstaging_complete: true,
            });
        };

        if let Err(e) = self.validate_staged().await {
            if let Err(rollback_error) = self.rollback_internal().await {
                tracing::warn!(txn_id = %self.inner.id, error = %rollback_error, "rollback after commit conflict failed");
            }
            return Err(match e {
                conflict @ EmberError::WriteWriteConflict { .. } => conflict,
                other => EmberError::TransactionFailed(format!(
                    "commit of transaction {} failed: {}",
                    self.inner.id, other
                )),
            });
        }

        self.set_state(TransactionState::Committing);
        match self.flip_to_committed(&atr).await {
            Ok(()) => {}
            Err(e @ EmberError::TransactionExpired(_)) => {
                if let Err(rollback_error) = self.rollback_internal().await {
                    tracing::warn!(txn_id = %self.inner.id, error = %rollback_error, "rollback after expiry failed");
                }
                self.set_state(TransactionState::Expired);
                return Err(e);
            }
            Err(e @ EmberError::CommitAmbiguous(_)) => {
                self.hand_off(&atr);
                return Err(e);
            }
            Err(e) => {
                if let Err(rollback_error) = self.rollback_internal().await {
                    tracing::warn!(txn_id = %self.inner.id, error = %rollback_error, "rollback after failed commit failed");
                }
                return Err(EmberError::TransactionFailed(format!(
                    "commit of transaction {} failed: {}",
                    self.inner.id, e
                )));
            }
        }
        self.set_state(TransactionState::Committed);
        tracing::info!(txn_id = %self.inner.id, mutations = self.staged_count(), "transaction committed");

        let window = self.remaining().max(self.inner.env.retry.initial_backoff());
        let mutations = self.mutation_refs();
        let applied = unstage_all(
            &self.inner.metadata,
            &self.inner.id,
            &mutations,
            window,
            &self.inner.env.retry,
        )
        .await;

        let unstaging_complete = applied && self.remove_attempt_entry(&atr).await.is_ok();
        if !unstaging_complete {
            tracing::warn!(txn_id = %self.inner.id, "unstaging incomplete; handing off to cleanup");
            self.hand_off(&atr);
        }
        Ok(TransactionResult {
            transaction_id: self.inner.id.clone(),
            unstaging_complete,
        })
    }

    /// Rolls back the attempt, removing every staged copy.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::TransactionFailed`] if the attempt already
    /// passed its commit point or some staged copies could not be removed.
    #[instrument(name = "transaction.rollback", skip(self), fields(txn_id = %self.inner.id))]
    pub async fn rollback(&self) -> Result<()> {
        match self.state() {
            TransactionState::Staging | TransactionState::Aborting | TransactionState::Expired => {}
            TransactionState::RolledBack => return Ok(()),
            other => {
                return Err(EmberError::TransactionFailed(format!(
                    "transaction {} cannot roll back from {:?}",
                    self.inner.id, other
                )))
            }
        }
        let expired = self.state() == TransactionState::Expired;
        self.rollback_internal().await?;
        if expired {
            self.set_state(TransactionState::Expired);
        }
        Ok(())
    }

    async fn rollback_internal(&self) -> Result<()> {
        self.set_state(TransactionState::Aborting);
        let registered = self.inner.atr.lock().await.clone();
        let Some(atr) = registered else {
            self.set_state(TransactionState::RolledBack);
            return Ok(());
        };

        let id = self.inner.id.as_str();
        let result = async {
            self.inner
                .metadata
                .modify_atr(&atr, |doc| match doc.attempts.get_mut(id) {
                    Some(entry) if entry.state == AttemptState::Staging => {
                        entry.state = AttemptState::Aborted;
                        Ok(true)
                    }
                    Some(entry) if entry.state == AttemptState::Committed => {
                        Err(EmberError::TransactionFailed(format!(
                            "transaction {} is already committed",
                            id
                        )))
                    }
                    _ => Ok(false),
                })
                .await?;
            discard_all(&self.inner.metadata, id, &self.mutation_refs()).await?;
            self.remove_attempt_entry(&atr).await
        }
        .await;

        match result {
            Ok(()) => {
                self.set_state(TransactionState::RolledBack);
                tracing::info!(txn_id = id, "transaction rolled back");
                Ok(())
            }
            Err(e) => {
                self.hand_off(&atr);
                self.set_state(TransactionState::Aborted);
                Err(EmberError::TransactionFailed(format!(
                    "rollback of transaction {} incomplete: {}",
                    id, e
                )))
            }
        }
    }
}

fn encode_value<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| EmberError::InvalidArgument(format!("cannot encode '{}': {}", key, e)))
}
