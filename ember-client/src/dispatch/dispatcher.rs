//! Deadline-bounded execution of single-document operations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::instrument;

use ember_core::protocol::{encode_collection_key, Outcome, Request, Response, Status};
use ember_core::{CollectionName, DurabilityLevel, EmberError, Result};

use super::options::DispatchOptions;
use super::status::status_to_error;
use crate::backoff::Backoff;
use crate::config::{RetryConfig, TimeoutConfig};
use crate::connection::ConnectionManager;
use crate::diagnostics::{OperationEvent, OperationOutcome, Telemetry};

/// A keyed request addressed to a collection.
///
/// The request carries the bare document key; the collection prefix is
/// added per attempt, since the collection id may change between attempts.
#[derive(Debug, Clone)]
pub struct Operation {
    name: &'static str,
    collection: CollectionName,
    key: String,
    request: Request,
}

impl Operation {
    /// Creates an operation.
    pub fn new(
        name: &'static str,
        collection: CollectionName,
        key: impl Into<String>,
        request: Request,
    ) -> Self {
        Self {
            name,
            collection,
            key: key.into(),
            request,
        }
    }

    /// Telemetry name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Target collection.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Document key without collection prefix.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The request sent for every attempt.
    pub fn request(&self) -> &Request {
        &self.request
    }
}

enum Attempt {
    Done(Response),
    Retry { reason: EmberError, reroute: bool },
    Fail(EmberError),
}

/// Runs operations against the cluster with retry and timeout policy.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    manager: Arc<ConnectionManager>,
    retry: RetryConfig,
    timeouts: TimeoutConfig,
    max_frame_size: usize,
    telemetry: Arc<dyn Telemetry>,
}

impl Dispatcher {
    /// Creates a dispatcher using the manager's configured policies.
    pub fn new(manager: Arc<ConnectionManager>, telemetry: Arc<dyn Telemetry>) -> Self {
        let retry = manager.config().retry().clone();
        let timeouts = manager.config().timeouts().clone();
        let max_frame_size = manager.config().network().max_frame_size();
        Self {
            manager,
            retry,
            timeouts,
            max_frame_size,
            telemetry,
        }
    }

    /// The underlying connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Executes `op` and resolves it to a successful response or an error.
    ///
    /// Transient failures are retried with backoff until the attempt budget
    /// or the deadline runs out, re-resolving the route each time. A
    /// `NotMyVbucket` reply is rerouted once without backoff; a second one
    /// fails the operation with [`EmberError::Timeout`]. Once an
    /// operation that is not idempotent has been written, a lost connection
    /// or the deadline resolves it as [`EmberError::AmbiguousTimeout`]
    /// instead of retrying.
    #[instrument(
        name = "dispatcher.execute",
        skip(self, op, options),
        fields(operation = op.name(), key = %op.key())
    )]
    pub async fn execute(&self, op: &Operation, options: &DispatchOptions) -> Result<Response> {
        let started = Instant::now();
        let deadline = started + self.timeout_for(op, options);
        let retry = options.retry.as_ref().unwrap_or(&self.retry);
        let idempotent = options
            .idempotent
            .unwrap_or_else(|| op.request().is_idempotent());

        let mut backoff = Backoff::new(retry);
        let mut attempts = 0u32;
        let mut rerouted = false;
        let mut node = None;

        let result = loop {
            attempts += 1;
            let attempt = self
                .attempt(op, idempotent, deadline, &mut node)
                .await;

            let (reason, reroute) = match attempt {
                Attempt::Done(response) => break Ok(response),
                Attempt::Fail(error) => break Err(error),
                Attempt::Retry { reason, reroute } => (reason, reroute),
            };

            if attempts >= retry.max_attempts() {
                break Err(EmberError::Timeout(format!(
                    "{} on '{}' gave up after {} attempts: {}",
                    op.name(),
                    op.key(),
                    attempts,
                    reason
                )));
            }

            let delay = if reroute {
                if rerouted {
                    break Err(EmberError::Timeout(format!(
                        "{} on '{}' was rejected again after rerouting: {}",
                        op.name(),
                        op.key(),
                        reason
                    )));
                }
                rerouted = true;
                Duration::ZERO
            } else {
                backoff.next_delay()
            };
            if Instant::now() + delay >= deadline {
                break Err(EmberError::Timeout(format!(
                    "{} on '{}' reached its deadline after {} attempts: {}",
                    op.name(),
                    op.key(),
                    attempts,
                    reason
                )));
            }

            tracing::debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                reroute,
                reason = %reason,
                "retrying operation"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        };

        self.telemetry.record(&OperationEvent {
            operation: op.name(),
            outcome: OperationOutcome::from_result(&result),
            latency: started.elapsed(),
            attempts,
            node,
        });
        result
    }

    fn timeout_for(&self, op: &Operation, options: &DispatchOptions) -> Duration {
        options.timeout.unwrap_or_else(|| {
            if op.request().durability() == DurabilityLevel::None {
                self.timeouts.kv_timeout()
            } else {
                self.timeouts.kv_durable_timeout()
            }
        })
    }

    async fn attempt(
        &self,
        op: &Operation,
        idempotent: bool,
        deadline: Instant,
        node: &mut Option<SocketAddr>,
    ) -> Attempt {
        let collection_id = match timeout_at(
            deadline,
            self.manager.resolve_collection(op.collection()),
        )
        .await
        {
            Ok(Ok(id)) => id,
            Ok(Err(e)) if e.is_transient() => {
                return Attempt::Retry {
                    reason: e,
                    reroute: false,
                }
            }
            Ok(Err(e)) => return Attempt::Fail(e),
            Err(_) => return Attempt::Fail(self.deadline_error(op, false, idempotent)),
        };

        let key = Bytes::copy_from_slice(op.key().as_bytes());
        let wire_key = if self.manager.collections_enabled() {
            encode_collection_key(collection_id, &key)
        } else {
            key.clone()
        };

        let route = match self.manager.route(&key) {
            Ok(route) => route,
            Err(e) if e.is_transient() => {
                return Attempt::Retry {
                    reason: e,
                    reroute: false,
                }
            }
            Err(e) => return Attempt::Fail(e),
        };
        *node = Some(route.address);

        let frame = match op.request().clone().with_key(wire_key).encode(route.vbucket, 0) {
            Ok(frame) => frame,
            Err(e) => return Attempt::Fail(e),
        };
        if frame.body_len() > self.max_frame_size {
            return Attempt::Fail(EmberError::ValueTooLarge {
                key: op.key().to_string(),
            });
        }

        let mut pending = match timeout_at(deadline, self.manager.send(route.address, frame)).await {
            Ok(Ok(pending)) => pending,
            Ok(Err(e)) if e.is_transient() => {
                return Attempt::Retry {
                    reason: e,
                    reroute: false,
                }
            }
            Ok(Err(e)) => return Attempt::Fail(e),
            Err(_) => return Attempt::Fail(self.deadline_error(op, false, idempotent)),
        };

        let received = tokio::select! {
            received = pending.recv() => received,
            _ = sleep_until(deadline) => {
                let sent = pending.was_sent();
                return Attempt::Fail(self.deadline_error(op, sent, idempotent));
            }
        };

        let frame = match received {
            Ok(frame) => frame,
            Err(e) if pending.was_sent() && !idempotent => {
                return Attempt::Fail(EmberError::AmbiguousTimeout(format!(
                    "{} on '{}' lost its connection after the request was written: {}",
                    op.name(),
                    op.key(),
                    e
                )))
            }
            Err(e) if e.is_transient() => {
                return Attempt::Retry {
                    reason: e,
                    reroute: false,
                }
            }
            Err(e) => return Attempt::Fail(e),
        };

        self.classify(op, route.vbucket, Response::decode(&frame))
    }

    fn classify(&self, op: &Operation, vbucket: u16, response: Response) -> Attempt {
        match &response.outcome {
            Outcome::Success(_) => Attempt::Done(response),
            Outcome::ProtocolError { reason } => {
                if Status::from_code(response.status).is_none() {
                    Attempt::Fail(EmberError::UnknownStatus {
                        opcode: response.opcode,
                        status: response.status,
                    })
                } else {
                    Attempt::Fail(EmberError::Protocol(reason.clone()))
                }
            }
            Outcome::Failure { status, body } => match *status {
                Status::NotMyVbucket => {
                    if body.is_empty() || !self.manager.apply_config(body) {
                        self.manager.request_refresh();
                    }
                    Attempt::Retry {
                        reason: EmberError::NotMyVbucket { vbucket },
                        reroute: true,
                    }
                }
                status if status.is_temporary() => Attempt::Retry {
                    reason: EmberError::TemporaryFailure(format!(
                        "{} on '{}': {}",
                        op.name(),
                        op.key(),
                        status
                    )),
                    reroute: false,
                },
                status => Attempt::Fail(status_to_error(op, status, body)),
            },
        }
    }

    fn deadline_error(&self, op: &Operation, sent: bool, idempotent: bool) -> EmberError {
        if sent && !idempotent {
            EmberError::AmbiguousTimeout(format!(
                "{} on '{}' was written but not acknowledged before the deadline",
                op.name(),
                op.key()
            ))
        } else {
            EmberError::Timeout(format!(
                "{} on '{}' did not complete before the deadline",
                op.name(),
                op.key()
            ))
        }
    }
}
