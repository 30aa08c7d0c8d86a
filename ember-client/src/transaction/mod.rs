//! Multi-document ACID transactions over per-document CAS.
//!
//! An attempt stages each change as a separate copy next to its document,
//! registers itself in an attempt record, and commits by flipping that record
//! to `COMMITTED` with a single CAS write. Only then are the staged values
//! applied. Any client can finish or roll back an abandoned attempt from the
//! record alone, so a crash at any point leaves the data recoverable.
//!
//! # Example
//!
//! ```ignore
//! use ember_client::{Cluster, ClientConfig, TransactionOptions};
//! use ember_core::CollectionName;
//!
//! let cluster = Cluster::connect(config).await?;
//! let accounts = CollectionName::new("bank", "accounts");
//! let result = cluster
//!     .transactions()
//!     .run(TransactionOptions::new(), |ctx| {
//!         let accounts = accounts.clone();
//!         async move {
//!             let from = ctx.get(&accounts, "alice").await?.expect("alice");
//!             let to = ctx.get(&accounts, "bob").await?.expect("bob");
//!             let from_balance: i64 = from.content_as()?;
//!             let to_balance: i64 = to.content_as()?;
//!             ctx.replace(&from, &(from_balance - 10)).await?;
//!             ctx.replace(&to, &(to_balance + 10)).await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//! println!("committed {}", result.transaction_id());
//! ```

mod attempt;
mod cleanup;
mod clock;
mod memory;
mod metadata;
mod records;
mod recovery;
mod store;
mod unstage;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::instrument;

use ember_core::{CollectionName, DurabilityLevel, EmberError, Result};

use crate::backoff::Backoff;
use crate::config::{DiagnosticsConfig, RetryConfig, TransactionsConfig};
use crate::diagnostics::SlowOperationDetector;

pub use attempt::{AttemptContext, TransactionGetResult, TransactionState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use records::{
    is_metadata_key, AtrDocument, AttemptRecord, AttemptState, MutationKind, MutationRef,
    ShadowDocument,
};
pub use recovery::{Recovery, Resolution, ScanReport};
pub use store::{ClusterStore, KvStore, StoreOptions, StoredDocument};

use attempt::AttemptEnv;
use metadata::MetadataStore;

/// Per-transaction overrides of the [`TransactionsConfig`] defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    expiration: Option<Duration>,
    kv_timeout: Option<Duration>,
    durability: Option<DurabilityLevel>,
}

impl TransactionOptions {
    /// Creates options that use the configured defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long the transaction may run, retries included.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Sets the timeout of each KV operation the transaction performs.
    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    /// Sets the durability of transactional writes.
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = Some(durability);
        self
    }

    /// Returns the expiration override.
    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    /// Returns the KV timeout override.
    pub fn kv_timeout(&self) -> Option<Duration> {
        self.kv_timeout
    }

    /// Returns the durability override.
    pub fn durability(&self) -> Option<DurabilityLevel> {
        self.durability
    }
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub(crate) transaction_id: String,
    pub(crate) unstaging_complete: bool,
}

impl TransactionResult {
    /// Returns the ID of the committed attempt.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Returns `false` if some committed changes were left to cleanup.
    ///
    /// The transaction is committed either way: readers inside other
    /// transactions already see its values.
    pub fn unstaging_complete(&self) -> bool {
        self.unstaging_complete
    }
}

/// Entry point for transactions against one [`KvStore`].
///
/// Creating an instance inside a Tokio runtime starts the cleanup tasks the
/// configuration enables. They stop on [`close`](Self::close) or drop.
#[derive(Debug)]
pub struct Transactions {
    config: TransactionsConfig,
    store: Arc<dyn KvStore>,
    env: AttemptEnv,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Transactions {
    /// Creates transactions over `store` using the system clock.
    pub fn new(store: Arc<dyn KvStore>, config: TransactionsConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Creates transactions over `store` reading time from `clock`.
    pub fn with_clock(
        store: Arc<dyn KvStore>,
        config: TransactionsConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let diagnostics = DiagnosticsConfig::default();
        let detector = SlowOperationDetector::new(diagnostics.slow_operation_threshold())
            .with_logging(diagnostics.slow_operation_logging());
        Self::start(store, config, RetryConfig::default(), clock, Arc::new(detector))
    }

    pub(crate) fn start(
        store: Arc<dyn KvStore>,
        config: TransactionsConfig,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
        detector: Arc<SlowOperationDetector>,
    ) -> Self {
        let metadata = MetadataStore::new(
            Arc::clone(&store),
            Self::store_options(&config, &TransactionOptions::default()),
            config.metadata_collection().cloned(),
        );
        let recovery = Recovery::new(
            metadata,
            Arc::clone(&clock),
            retry.clone(),
            config.atr_slots(),
            config.expiration(),
        );

        let mut known = BTreeSet::new();
        known.insert(
            config
                .metadata_collection()
                .cloned()
                .unwrap_or_default(),
        );
        let atr_collections = Arc::new(Mutex::new(known));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut handoff = None;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                if config.cleanup_client_attempts() {
                    let (tx, rx) = mpsc::channel(cleanup::CLEANUP_QUEUE_CAPACITY);
                    handoff = Some(tx);
                    tasks.push(runtime.spawn(cleanup::run_client_attempts(
                        recovery.clone(),
                        retry.clone(),
                        rx,
                        shutdown_rx.clone(),
                    )));
                }
                if config.cleanup_lost_attempts() {
                    tasks.push(runtime.spawn(cleanup::run_lost_attempts(
                        recovery.clone(),
                        Arc::clone(&atr_collections),
                        config.cleanup_window(),
                        shutdown_rx,
                    )));
                }
            }
            Err(_) => {
                tracing::warn!("no Tokio runtime; transaction cleanup tasks are not running");
            }
        }

        Self {
            env: AttemptEnv {
                recovery,
                clock,
                retry,
                slots: config.atr_slots(),
                handoff,
                atr_collections,
                detector,
            },
            config,
            store,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    fn store_options(config: &TransactionsConfig, options: &TransactionOptions) -> StoreOptions {
        StoreOptions {
            timeout: options.kv_timeout().or(config.kv_timeout()),
            durability: options.durability().unwrap_or(config.durability()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransactionsConfig {
        &self.config
    }

    /// Starts a new attempt for manual staging and commit.
    pub fn begin(&self, options: TransactionOptions) -> AttemptContext {
        let expiration = options.expiration().unwrap_or(self.config.expiration());
        self.begin_attempt(&options, expiration)
    }

    fn begin_attempt(&self, options: &TransactionOptions, expiration: Duration) -> AttemptContext {
        let metadata = MetadataStore::new(
            Arc::clone(&self.store),
            Self::store_options(&self.config, options),
            self.config.metadata_collection().cloned(),
        );
        AttemptContext::new(self.env.clone(), metadata, expiration)
    }

    /// Runs `body` in a transaction and commits it.
    ///
    /// When an attempt fails with [`EmberError::WriteWriteConflict`] it is
    /// rolled back and `body` runs again in a fresh attempt after a backoff,
    /// until the expiration passes.
    ///
    /// # Errors
    ///
    /// Returns [`EmberError::TransactionExpired`] when the expiration passes,
    /// [`EmberError::CommitAmbiguous`] when the commit could not be
    /// confirmed, and [`EmberError::TransactionFailed`] for anything else;
    /// errors returned by `body` are wrapped in the latter.
    #[instrument(name = "transactions.run", skip(self, body))]
    pub async fn run<F, Fut>(&self, options: TransactionOptions, mut body: F) -> Result<TransactionResult>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let expiration = options.expiration().unwrap_or(self.config.expiration());
        let clock = &self.env.clock;
        let deadline_ms = clock.now_ms().saturating_add(expiration.as_millis() as u64);
        let mut backoff = Backoff::new(&self.env.retry);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = Duration::from_millis(deadline_ms.saturating_sub(clock.now_ms()));
            let ctx = self.begin_attempt(&options, remaining);

            let outcome = match body(ctx.clone()).await {
                Ok(()) => ctx.commit().await,
                Err(e) => {
                    if matches!(
                        ctx.state(),
                        TransactionState::Staging
                            | TransactionState::Aborting
                            | TransactionState::Expired
                    ) {
                        if let Err(rollback_error) = ctx.rollback().await {
                            tracing::warn!(txn_id = ctx.id(), error = %rollback_error, "rollback failed");
                        }
                    }
                    Err(e)
                }
            };

            let error = match outcome {
                Ok(result) => return Ok(result),
                Err(e @ EmberError::WriteWriteConflict { .. }) => e,
                Err(e @ EmberError::TransactionExpired(_))
                | Err(e @ EmberError::CommitAmbiguous(_))
                | Err(e @ EmberError::TransactionFailed(_)) => return Err(e),
                Err(e) => {
                    return Err(EmberError::TransactionFailed(format!(
                        "transaction {} failed: {}",
                        ctx.id(),
                        e
                    )))
                }
            };

            let delay = backoff.next_delay();
            let now = clock.now_ms();
            if now.saturating_add(delay.as_millis() as u64) >= deadline_ms {
                return Err(EmberError::TransactionExpired(format!(
                    "transaction expired after {} attempts; last conflict: {}",
                    attempts, error
                )));
            }
            tracing::debug!(attempt = attempts, error = %error, "retrying transaction after conflict");
            sleep(delay).await;
        }
    }

    /// Returns a handle that resolves attempts from their records.
    pub fn recovery(&self) -> Recovery {
        self.env.recovery.clone()
    }

    /// Runs one lost-attempt scan over every attempt record collection this
    /// instance has used or finds listed in the client record.
    pub async fn cleanup_now(&self) -> ScanReport {
        let collections: Vec<CollectionName> =
            self.env.atr_collections.lock().iter().cloned().collect();
        self.env.recovery.scan_known(&collections).await
    }

    /// Stops the cleanup tasks and waits for them to finish.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "transaction cleanup task failed");
            }
        }
    }
}

impl Drop for Transactions {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
