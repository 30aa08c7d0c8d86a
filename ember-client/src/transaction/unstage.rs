//! Applying and discarding staged changes.
//!
//! Both the committing client and recovery run these, so every step is
//! safe to repeat: a change whose staged copy is gone has already been
//! applied (or rolled back) and is skipped.

use std::time::Duration;

use futures::future::join_all;
use tokio::time::{sleep, Instant};

use ember_core::{EmberError, Result};

use super::metadata::MetadataStore;
use super::records::{MutationKind, MutationRef};
use crate::backoff::Backoff;
use crate::config::RetryConfig;

/// Applies one committed change to its document and removes the staged copy.
///
/// Writes are CAS-checked against the CAS the document had when the change
/// was staged. A document that already holds the staged value counts as
/// applied. A document changed by a non-transactional write since then keeps
/// that write.
pub(crate) async fn apply_staged(
    metadata: &MetadataStore,
    txn_id: &str,
    mutation: &MutationRef,
) -> Result<()> {
    let collection = mutation.collection_name()?;
    let key = mutation.key.as_str();
    let Some((shadow, shadow_cas)) = metadata.read_shadow(&collection, key).await? else {
        return Ok(());
    };
    if shadow.txn_id != txn_id {
        return Ok(());
    }

    let store = metadata.store();
    let options = metadata.options();
    let current = store.get(&collection, key, options).await?;
    let outcome = match shadow.kind {
        MutationKind::Insert | MutationKind::Replace => {
            let value = shadow.staged_value()?.ok_or_else(|| {
                EmberError::Protocol(format!("staged {:?} of '{}' has no value", shadow.kind, key))
            })?;
            match current {
                Some(current) if current.value == value => Applied::AlreadyDone,
                Some(current) if shadow.original_cas != 0 && current.cas == shadow.original_cas => {
                    match store
                        .replace(&collection, key, value, shadow.original_cas, options)
                        .await
                    {
                        Ok(_) => Applied::Written,
                        Err(EmberError::CasMismatch { .. })
                        | Err(EmberError::DocumentNotFound { .. }) => Applied::Superseded,
                        Err(e) => return Err(e),
                    }
                }
                Some(_) => Applied::Superseded,
                None if shadow.original_cas == 0 => {
                    match store.insert(&collection, key, value, options).await {
                        Ok(_) => Applied::Written,
                        Err(EmberError::DocumentExists { .. }) => Applied::Superseded,
                        Err(e) => return Err(e),
                    }
                }
                None => Applied::Superseded,
            }
        }
        MutationKind::Remove => match current {
            None => Applied::AlreadyDone,
            Some(current) if current.cas == shadow.original_cas => {
                match store
                    .remove(&collection, key, shadow.original_cas, options)
                    .await
                {
                    Ok(()) | Err(EmberError::DocumentNotFound { .. }) => Applied::Written,
                    Err(EmberError::CasMismatch { .. }) => Applied::Superseded,
                    Err(e) => return Err(e),
                }
            }
            Some(_) => Applied::Superseded,
        },
    };

    if outcome == Applied::Superseded {
        tracing::warn!(
            txn_id,
            key,
            kind = ?shadow.kind,
            "document changed outside the transaction after commit; keeping the newer write"
        );
    }
    metadata.remove_shadow(&collection, key, shadow_cas).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Written,
    AlreadyDone,
    Superseded,
}

async fn apply_with_retry(
    metadata: &MetadataStore,
    txn_id: &str,
    mutation: &MutationRef,
    deadline: Instant,
    retry: &RetryConfig,
) -> bool {
    let mut backoff = Backoff::new(retry);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let error = match apply_staged(metadata, txn_id, mutation).await {
            Ok(()) => return true,
            Err(e) => e,
        };

        let delay = backoff.next_delay();
        if Instant::now() + delay >= deadline {
            tracing::warn!(
                txn_id,
                key = %mutation.key,
                attempt,
                error = %error,
                "unstaging did not finish before its deadline"
            );
            return false;
        }
        tracing::debug!(txn_id, key = %mutation.key, attempt, error = %error, "retrying unstage");
        sleep(delay).await;
    }
}

/// Applies every change, retrying each until `window` elapses.
///
/// Changes to different documents proceed concurrently. Returns `true` if
/// all of them were applied.
pub(crate) async fn unstage_all(
    metadata: &MetadataStore,
    txn_id: &str,
    mutations: &[MutationRef],
    window: Duration,
    retry: &RetryConfig,
) -> bool {
    let deadline = Instant::now() + window;
    let results = join_all(
        mutations
            .iter()
            .map(|mutation| apply_with_retry(metadata, txn_id, mutation, deadline, retry)),
    )
    .await;
    results.into_iter().all(|applied| applied)
}

/// Removes every staged copy still owned by `txn_id`.
pub(crate) async fn discard_all(
    metadata: &MetadataStore,
    txn_id: &str,
    mutations: &[MutationRef],
) -> Result<()> {
    let results = join_all(mutations.iter().map(|mutation| async move {
        let collection = mutation.collection_name()?;
        metadata
            .remove_own_shadow(&collection, &mutation.key, txn_id)
            .await
    }))
    .await;
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bytes::Bytes;
    use ember_core::CollectionName;

    use crate::transaction::memory::MemoryStore;
    use crate::transaction::records::{atr_key, ShadowDocument};
    use crate::transaction::store::{KvStore, StoreOptions};

    fn shadow(kind: MutationKind, value: Option<&[u8]>, original_cas: u64) -> ShadowDocument {
        ShadowDocument {
            txn_id: "t1".to_string(),
            atr_collection: CollectionName::default().to_string(),
            atr_key: atr_key(0),
            kind,
            value: value.map(ShadowDocument::encode_value),
            original_cas,
            staged_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_apply_is_repeatable() {
        let store = Arc::new(MemoryStore::new());
        let metadata = MetadataStore::new(store.clone(), StoreOptions::default(), None);
        let collection = CollectionName::default();
        let options = StoreOptions::default();

        let cas = store
            .insert(&collection, "k", Bytes::from_static(b"old"), &options)
            .await
            .unwrap();
        metadata
            .write_shadow(&collection, "k", &shadow(MutationKind::Replace, Some(b"new"), cas), None)
            .await
            .unwrap();

        let mutation = MutationRef::new(&collection, "k", MutationKind::Replace);
        apply_staged(&metadata, "t1", &mutation).await.unwrap();
        apply_staged(&metadata, "t1", &mutation).await.unwrap();

        assert_eq!(&store.peek(&collection, "k").unwrap().value[..], b"new");
        assert_eq!(store.keys(&collection), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_apply_after_partial_apply_keeps_value() {
        let store = Arc::new(MemoryStore::new());
        let metadata = MetadataStore::new(store.clone(), StoreOptions::default(), None);
        let collection = CollectionName::default();
        let options = StoreOptions::default();

        let cas = store
            .insert(&collection, "k", Bytes::from_static(b"old"), &options)
            .await
            .unwrap();
        metadata
            .write_shadow(&collection, "k", &shadow(MutationKind::Replace, Some(b"new"), cas), None)
            .await
            .unwrap();
        // A previous coordinator wrote the value and died before removing the copy.
        let applied_cas = store
            .replace(&collection, "k", Bytes::from_static(b"new"), cas, &options)
            .await
            .unwrap();

        let mutation = MutationRef::new(&collection, "k", MutationKind::Replace);
        apply_staged(&metadata, "t1", &mutation).await.unwrap();
        let doc = store.peek(&collection, "k").unwrap();
        assert_eq!(doc.cas, applied_cas);
        assert_eq!(store.keys(&collection), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_apply_keeps_newer_external_write() {
        let store = Arc::new(MemoryStore::new());
        let metadata = MetadataStore::new(store.clone(), StoreOptions::default(), None);
        let collection = CollectionName::default();
        let options = StoreOptions::default();

        let cas = store
            .insert(&collection, "k", Bytes::from_static(b"old"), &options)
            .await
            .unwrap();
        metadata
            .write_shadow(&collection, "k", &shadow(MutationKind::Replace, Some(b"new"), cas), None)
            .await
            .unwrap();
        metadata
            .write_shadow(&collection, "gone", &shadow(MutationKind::Insert, Some(b"1"), 0), None)
            .await
            .unwrap();
        store
            .replace(&collection, "k", Bytes::from_static(b"external"), cas, &options)
            .await
            .unwrap();
        store
            .insert(&collection, "gone", Bytes::from_static(b"first"), &options)
            .await
            .unwrap();

        for key in ["k", "gone"] {
            let kind = if key == "k" {
                MutationKind::Replace
            } else {
                MutationKind::Insert
            };
            apply_staged(&metadata, "t1", &MutationRef::new(&collection, key, kind))
                .await
                .unwrap();
        }

        assert_eq!(&store.peek(&collection, "k").unwrap().value[..], b"external");
        assert_eq!(&store.peek(&collection, "gone").unwrap().value[..], b"first");
        assert_eq!(
            store.keys(&collection),
            vec!["gone".to_string(), "k".to_string()]
        );
    }

    #[tokio::test]
    async fn test_apply_skips_foreign_shadow() {
        let store = Arc::new(MemoryStore::new());
        let metadata = MetadataStore::new(store.clone(), StoreOptions::default(), None);
        let collection = CollectionName::default();
        metadata
            .write_shadow(&collection, "k", &shadow(MutationKind::Insert, Some(b"v"), 0), None)
            .await
            .unwrap();

        let mutation = MutationRef::new(&collection, "k", MutationKind::Insert);
        apply_staged(&metadata, "other", &mutation).await.unwrap();
        assert!(store.peek(&collection, "k").is_none());
    }

    #[tokio::test]
    async fn test_unstage_all_applies_removes_and_inserts() {
        let store = Arc::new(MemoryStore::new());
        let metadata = MetadataStore::new(store.clone(), StoreOptions::default(), None);
        let collection = CollectionName::default();
        let options = StoreOptions::default();

        let cas = store
            .insert(&collection, "gone", Bytes::from_static(b"x"), &options)
            .await
            .unwrap();
        metadata
            .write_shadow(&collection, "gone", &shadow(MutationKind::Remove, None, cas), None)
            .await
            .unwrap();
        metadata
            .write_shadow(&collection, "new", &shadow(MutationKind::Insert, Some(b"1"), 0), None)
            .await
            .unwrap();

        let mutations = vec![
            MutationRef::new(&collection, "gone", MutationKind::Remove),
            MutationRef::new(&collection, "new", MutationKind::Insert),
        ];
        let done = unstage_all(
            &metadata,
            "t1",
            &mutations,
            Duration::from_secs(1),
            &RetryConfig::default(),
        )
        .await;

        assert!(done);
        assert_eq!(store.keys(&collection), vec!["new".to_string()]);
    }
}
