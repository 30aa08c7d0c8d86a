//! Resolving attempts from their persisted record alone.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use ember_core::{CollectionName, Result};

use super::clock::Clock;
use super::metadata::{AtrLocation, MetadataStore};
use super::records::{atr_key, AttemptRecord, AttemptState, MutationRef};
use super::unstage::{discard_all, unstage_all};
use crate::config::RetryConfig;

/// What [`Recovery::resolve_attempt`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No entry for the attempt exists.
    NotFound,
    /// The attempt is still within its expiry and was left alone.
    NotExpired,
    /// The attempt was committed and every change has now been applied.
    Completed,
    /// The attempt was not committed and its staged changes were discarded.
    RolledBack,
    /// The attempt was committed but some changes could not be applied yet.
    Incomplete,
}

/// Outcome of one pass over attempt records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Attempt record documents read.
    pub records_checked: usize,
    /// Attempts completed or rolled back.
    pub attempts_resolved: usize,
    /// Attempts or records that failed to resolve.
    pub errors: usize,
}

/// Finishes attempts left behind by any client.
///
/// The attempt record entry is the only input: `COMMITTED` entries are
/// rolled forward, `STAGING` and `ABORTED` entries are rolled back.
#[derive(Debug, Clone)]
pub struct Recovery {
    metadata: MetadataStore,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    slots: u16,
    unstage_window: Duration,
}

impl Recovery {
    pub(crate) fn new(
        metadata: MetadataStore,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
        slots: u16,
        unstage_window: Duration,
    ) -> Self {
        Self {
            metadata,
            clock,
            retry,
            slots,
            unstage_window,
        }
    }

    /// Resolves the attempt `txn_id` recorded in `atr_key` of `atr_collection`.
    ///
    /// Unless `force` is set, attempts in `STAGING` or `COMMITTED` that have
    /// not expired are left to their owner.
    #[instrument(
        name = "transactions.resolve_attempt",
        skip(self, atr_collection),
        fields(atr = %atr_key)
    )]
    pub async fn resolve_attempt(
        &self,
        atr_collection: &CollectionName,
        atr_key: &str,
        txn_id: &str,
        force: bool,
    ) -> Result<Resolution> {
        let atr = AtrLocation {
            collection: atr_collection.clone(),
            key: atr_key.to_string(),
        };
        self.resolve(&atr, txn_id, force).await
    }

    pub(crate) async fn resolve(
        &self,
        atr: &AtrLocation,
        txn_id: &str,
        force: bool,
    ) -> Result<Resolution> {
        let Some((doc, _)) = self.metadata.read_atr(atr).await? else {
            return Ok(Resolution::NotFound);
        };
        let Some(entry) = doc.attempts.get(txn_id).cloned() else {
            return Ok(Resolution::NotFound);
        };

        let live = matches!(entry.state, AttemptState::Staging | AttemptState::Committed);
        if !force && live && !entry.is_expired(self.clock.now_ms()) {
            return Ok(Resolution::NotExpired);
        }

        match entry.state {
            AttemptState::Staging => self.abort(atr, txn_id).await,
            AttemptState::Aborted => self.roll_back(atr, txn_id, &entry.mutations).await,
            AttemptState::Committed => self.complete(atr, txn_id, &entry.mutations).await,
            AttemptState::Completed => {
                self.remove_entry(atr, txn_id).await?;
                Ok(Resolution::Completed)
            }
            AttemptState::RolledBack => {
                self.remove_entry(atr, txn_id).await?;
                Ok(Resolution::RolledBack)
            }
        }
    }

    async fn abort(&self, atr: &AtrLocation, txn_id: &str) -> Result<Resolution> {
        let doc = self
            .metadata
            .modify_atr(atr, |doc| match doc.attempts.get_mut(txn_id) {
                Some(entry) if entry.state == AttemptState::Staging => {
                    entry.state = AttemptState::Aborted;
                    Ok(true)
                }
                _ => Ok(false),
            })
            .await?;

        match doc.attempts.get(txn_id).cloned() {
            None => Ok(Resolution::NotFound),
            Some(AttemptRecord {
                state: AttemptState::Committed,
                mutations,
                ..
            }) => self.complete(atr, txn_id, &mutations).await,
            Some(entry) => {
                tracing::info!(txn_id, "aborting abandoned attempt");
                self.roll_back(atr, txn_id, &entry.mutations).await
            }
        }
    }

    async fn roll_back(
        &self,
        atr: &AtrLocation,
        txn_id: &str,
        mutations: &[MutationRef],
    ) -> Result<Resolution> {
        discard_all(&self.metadata, txn_id, mutations).await?;
        self.remove_entry(atr, txn_id).await?;
        tracing::info!(txn_id, staged = mutations.len(), "attempt rolled back");
        Ok(Resolution::RolledBack)
    }

    async fn complete(
        &self,
        atr: &AtrLocation,
        txn_id: &str,
        mutations: &[MutationRef],
    ) -> Result<Resolution> {
        let applied = unstage_all(
            &self.metadata,
            txn_id,
            mutations,
            self.unstage_window,
            &self.retry,
        )
        .await;
        if !applied {
            return Ok(Resolution::Incomplete);
        }
        self.remove_entry(atr, txn_id).await?;
        tracing::info!(txn_id, applied = mutations.len(), "committed attempt completed");
        Ok(Resolution::Completed)
    }

    async fn remove_entry(&self, atr: &AtrLocation, txn_id: &str) -> Result<()> {
        self.metadata
            .modify_atr(atr, |doc| Ok(doc.attempts.remove(txn_id).is_some()))
            .await?;
        Ok(())
    }

    /// Scans `local` together with every collection listed in the client
    /// record.
    pub(crate) async fn scan_known(&self, local: &[CollectionName]) -> ScanReport {
        let mut targets: BTreeSet<CollectionName> = local.iter().cloned().collect();
        let mut record_errors = 0;
        match self.metadata.read_client_record().await {
            Ok(Some(record)) => targets.extend(record.collections()),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "failed to read client record");
                record_errors = 1;
            }
        }
        let targets: Vec<CollectionName> = targets.into_iter().collect();
        let mut report = self.scan_once(&targets).await;
        report.errors += record_errors;
        report
    }

    /// Walks every attempt record slot in `collections` once and resolves
    /// expired attempts.
    #[instrument(name = "transactions.scan", skip(self, collections))]
    pub async fn scan_once(&self, collections: &[CollectionName]) -> ScanReport {
        let mut report = ScanReport::default();
        for collection in collections {
            for slot in 0..self.slots {
                let atr = AtrLocation {
                    collection: collection.clone(),
                    key: atr_key(slot),
                };
                let doc = match self.metadata.read_atr(&atr).await {
                    Ok(Some((doc, _))) => doc,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!(atr = %atr.key, error = %e, "failed to read attempt record");
                        report.errors += 1;
                        continue;
                    }
                };
                report.records_checked += 1;

                for txn_id in doc.attempts.keys() {
                    match self.resolve(&atr, txn_id, false).await {
                        Ok(Resolution::Completed) | Ok(Resolution::RolledBack) => {
                            report.attempts_resolved += 1
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(txn_id = %txn_id, error = %e, "failed to resolve attempt");
                            report.errors += 1;
                        }
                    }
                }
            }
        }
        if report.attempts_resolved > 0 || report.errors > 0 {
            tracing::info!(
                records = report.records_checked,
                resolved = report.attempts_resolved,
                errors = report.errors,
                "lost attempt scan finished"
            );
        }
        report
    }
}
