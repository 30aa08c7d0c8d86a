//! Background cleanup of incomplete attempts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use ember_core::CollectionName;

use super::metadata::AtrLocation;
use super::recovery::{Recovery, Resolution};
use crate::backoff::Backoff;
use crate::config::RetryConfig;

/// An attempt this client could not finish itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CleanupRequest {
    pub(crate) atr: AtrLocation,
    pub(crate) txn_id: String,
}

fn stop_requested(
    changed: std::result::Result<(), watch::error::RecvError>,
    rx: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *rx.borrow()
}

/// Capacity of the queue of attempts handed to the client-attempt worker.
pub(crate) const CLEANUP_QUEUE_CAPACITY: usize = 1024;

/// Scans the known attempt record collections every `period`.
pub(crate) async fn run_lost_attempts(
    recovery: Recovery,
    collections: Arc<Mutex<BTreeSet<CollectionName>>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let targets: Vec<CollectionName> = collections.lock().iter().cloned().collect();
        let scan = recovery.scan_known(&targets);
        tokio::select! {
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
            }
            _ = scan => {}
        }
    }
    tracing::debug!("lost attempt cleanup stopped");
}

/// Finishes attempts handed off by their owner, retrying each with backoff.
pub(crate) async fn run_client_attempts(
    recovery: Recovery,
    retry: RetryConfig,
    mut queue: mpsc::Receiver<CleanupRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
                continue;
            }
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if stop_requested(changed, &shutdown) {
                    break;
                }
            }
            _ = finish(&recovery, &retry, &request) => {}
        }
    }
    tracing::debug!("client attempt cleanup stopped");
}

async fn finish(recovery: &Recovery, retry: &RetryConfig, request: &CleanupRequest) {
    let mut backoff = Backoff::new(retry);
    let max_attempts = retry.max_attempts().max(1);
    for attempt in 1..=max_attempts {
        match recovery.resolve(&request.atr, &request.txn_id, true).await {
            Ok(Resolution::Incomplete) => {
                tracing::debug!(txn_id = %request.txn_id, attempt, "attempt still incomplete");
            }
            Ok(resolution) => {
                tracing::debug!(txn_id = %request.txn_id, ?resolution, "handed off attempt resolved");
                return;
            }
            Err(e) => {
                tracing::debug!(txn_id = %request.txn_id, attempt, error = %e, "cleanup attempt failed");
            }
        }
        sleep(backoff.next_delay()).await;
    }
    tracing::warn!(
        txn_id = %request.txn_id,
        atr = %request.atr.key,
        "giving up on attempt cleanup; lost attempt scans will retry it"
    );
}
