//! A multiplexed, self-healing connection slot.
//!
//! An endpoint owns one connection at a time plus a background task that
//! writes queued frames, routes responses back to their callers by opaque,
//! sends heartbeats, and reconnects with backoff when the connection fails.
//!
//! Callers interact only through [`Endpoint::submit`]. Every submitted frame
//! gets a fresh opaque and a single-use result slot; the slot is resolved
//! exactly once, by the matching response or by a connection failure, and is
//! discarded if the caller stops waiting.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};

use ember_core::protocol::{Frame, FrameCodec, Outcome, Request, Response};
use ember_core::{EmberError, Result};

use super::connection::Connection;
use super::handshake::Handshake;
use super::manager::ConnectionEvent;
use crate::diagnostics::EndpointPing;
use crate::backoff::Backoff;
use crate::config::{ClientConfig, RetryConfig};

/// Opaque used for heartbeats; never handed out to callers.
const HEARTBEAT_OPAQUE: u32 = 0;

/// Lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    /// Establishing the first connection.
    Connecting = 0,
    /// A connection is up and serving requests.
    Connected = 1,
    /// The connection was lost and a replacement is being established.
    Reconnecting = 2,
    /// Reconnect attempts were exhausted; waiting for a reachability check to succeed.
    Unreachable = 3,
    /// Shut down.
    Closed = 4,
}

impl EndpointState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Reconnecting,
            3 => Self::Unreachable,
            _ => Self::Closed,
        }
    }

    /// Returns `true` if requests may be queued on this endpoint.
    pub fn accepts_requests(self) -> bool {
        !matches!(self, Self::Unreachable | Self::Closed)
    }
}

/// Settings an endpoint needs, extracted from [`ClientConfig`].
#[derive(Debug, Clone)]
pub(crate) struct EndpointSettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) reconnect_attempts: u32,
    pub(crate) recheck_interval: Duration,
    pub(crate) queue_capacity: usize,
    pub(crate) max_frame_size: usize,
    pub(crate) retry: RetryConfig,
    pub(crate) handshake: Handshake,
}

impl EndpointSettings {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        let network = config.network();
        let security = config.security();
        let credentials = match (security.username(), security.password()) {
            (Some(user), Some(password)) => Some((user.to_string(), password.to_string())),
            _ => None,
        };
        Self {
            connect_timeout: network.connection_timeout(),
            heartbeat_interval: network.heartbeat_interval(),
            idle_timeout: network.idle_timeout(),
            reconnect_attempts: network.reconnect_attempts(),
            recheck_interval: network.recheck_interval(),
            queue_capacity: network.queue_capacity(),
            max_frame_size: network.max_frame_size(),
            retry: config.retry().clone(),
            handshake: Handshake::new(config.user_agent(), credentials, config.bucket()),
        }
    }
}

struct PendingEntry {
    reply: oneshot::Sender<Result<Frame>>,
    sent: Arc<AtomicBool>,
}

struct Outbound {
    opaque: u32,
    frame: Frame,
}

struct Shared {
    address: SocketAddr,
    state: AtomicU8,
    next_opaque: AtomicU32,
    pending: Mutex<HashMap<u32, PendingEntry>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EndpointState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn next_opaque(&self) -> u32 {
        loop {
            let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
            if opaque != HEARTBEAT_OPAQUE {
                return opaque;
            }
        }
    }

    /// Flags the entry as written. Returns `false` if the caller has gone away.
    fn mark_sent(&self, opaque: u32) -> bool {
        match self.pending.lock().get(&opaque) {
            Some(entry) => {
                entry.sent.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn complete(&self, frame: Frame) {
        let entry = self.pending.lock().remove(&frame.opaque);
        match entry {
            Some(entry) => {
                let _ = entry.reply.send(Ok(frame));
            }
            None if frame.opaque == HEARTBEAT_OPAQUE => {}
            None => {
                tracing::trace!(
                    address = %self.address,
                    opaque = frame.opaque,
                    "discarding response with no waiting caller"
                );
            }
        }
    }

    fn fail_one(&self, opaque: u32, error: EmberError) {
        if let Some(entry) = self.pending.lock().remove(&opaque) {
            let _ = entry.reply.send(Err(error));
        }
    }

    /// Fails every entry already written to the lost connection. Entries still
    /// queued stay pending and go out on the next connection.
    fn fail_sent(&self, reason: &str) {
        let failed: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let opaques: Vec<u32> = pending
                .iter()
                .filter(|(_, entry)| entry.sent.load(Ordering::Acquire))
                .map(|(opaque, _)| *opaque)
                .collect();
            opaques
                .into_iter()
                .filter_map(|opaque| pending.remove(&opaque))
                .collect()
        };
        for entry in failed {
            let _ = entry.reply.send(Err(EmberError::Connection(format!(
                "connection to {} lost: {}",
                self.address, reason
            ))));
        }
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            let _ = entry.reply.send(Err(EmberError::NodeUnavailable(format!(
                "{}: {}",
                self.address, reason
            ))));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

/// An in-flight request's result slot.
///
/// Dropping it before the response arrives cancels the request: a frame not
/// yet written is skipped, and a late response is discarded.
pub struct PendingResponse {
    opaque: u32,
    sent: Arc<AtomicBool>,
    reply: oneshot::Receiver<Result<Frame>>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    /// Opaque assigned to the request.
    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    /// Node the request was queued on.
    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    /// Returns `true` once the request has been written to a connection.
    pub fn was_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// Waits for the response frame. Cancel-safe.
    pub async fn recv(&mut self) -> Result<Frame> {
        match (&mut self.reply).await {
            Ok(result) => result,
            Err(_) => Err(EmberError::Connection(format!(
                "endpoint {} dropped the request",
                self.shared.address
            ))),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.opaque);
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("address", &self.shared.address)
            .field("opaque", &self.opaque)
            .field("sent", &self.was_sent())
            .finish()
    }
}

/// One pooled connection slot to a node.
pub struct Endpoint {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Outbound>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Starts an endpoint for `address`.
    ///
    /// If `connection` is given it must already have completed the handshake
    /// and is used as the first connection.
    pub(crate) fn spawn(
        address: SocketAddr,
        settings: EndpointSettings,
        events: broadcast::Sender<ConnectionEvent>,
        connection: Option<Connection>,
    ) -> Self {
        let (queue, queue_rx) = mpsc::channel(settings.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            address,
            state: AtomicU8::new(EndpointState::Connecting as u8),
            next_opaque: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            events,
        });

        tokio::spawn(run(
            Arc::clone(&shared),
            settings,
            queue_rx,
            shutdown_rx,
            connection,
        ));

        Self {
            shared,
            queue,
            shutdown,
        }
    }

    /// Node address.
    pub fn address(&self) -> SocketAddr {
        self.shared.address
    }

    /// Current state.
    pub fn state(&self) -> EndpointState {
        self.shared.state()
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Sends a `Noop` and measures the round trip, waiting at most `limit`.
    pub(crate) async fn ping(&self, index: usize, limit: Duration) -> EndpointPing {
        let (latency, error) = match self.round_trip(limit).await {
            Ok(latency) => (Some(latency), None),
            Err(e) => (None, Some(e.to_string())),
        };
        EndpointPing {
            address: self.shared.address,
            index,
            state: self.state(),
            latency,
            error,
        }
    }

    async fn round_trip(&self, limit: Duration) -> Result<Duration> {
        let started = Instant::now();
        let mut pending = self.submit(Request::Noop.encode(0, 0)?).await?;
        let frame = timeout(limit, pending.recv()).await.map_err(|_| {
            EmberError::Timeout(format!("ping to {} timed out", self.shared.address))
        })??;
        match Response::decode(&frame).outcome {
            Outcome::Success(_) => Ok(started.elapsed()),
            Outcome::Failure { status, .. } => Err(EmberError::UnknownStatus {
                opcode: frame.opcode,
                status: status.code(),
            }),
            Outcome::ProtocolError { reason } => Err(EmberError::Protocol(reason)),
        }
    }

    /// Queues `frame` and returns its result slot.
    ///
    /// The frame's opaque is overwritten. Fails with
    /// [`EmberError::NodeUnavailable`] when the node is marked unreachable.
    /// Waits for queue space when the outbound queue is full.
    pub async fn submit(&self, mut frame: Frame) -> Result<PendingResponse> {
        if !self.state().accepts_requests() {
            return Err(EmberError::NodeUnavailable(format!(
                "{} is {:?}",
                self.shared.address,
                self.state()
            )));
        }

        let opaque = self.shared.next_opaque();
        frame.opaque = opaque;

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = Arc::new(AtomicBool::new(false));
        self.shared.pending.lock().insert(
            opaque,
            PendingEntry {
                reply: reply_tx,
                sent: Arc::clone(&sent),
            },
        );
        let pending = PendingResponse {
            opaque,
            sent,
            reply: reply_rx,
            shared: Arc::clone(&self.shared),
        };

        self.queue
            .send(Outbound { opaque, frame })
            .await
            .map_err(|_| {
                EmberError::NodeUnavailable(format!("{} is closed", self.shared.address))
            })?;

        Ok(pending)
    }

    /// Stops the background task. Pending requests fail with
    /// [`EmberError::NodeUnavailable`].
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum ConnectOutcome {
    Established(Connection),
    Exhausted(String),
    Shutdown,
}

enum ServeExit {
    Shutdown,
    Lost(String),
}

fn shutdown_requested(changed: std::result::Result<(), watch::error::RecvError>, rx: &watch::Receiver<bool>) -> bool {
    changed.is_err() || *rx.borrow()
}

async fn connect_once(address: SocketAddr, settings: &EndpointSettings) -> Result<Connection> {
    let mut connection =
        Connection::connect(address, settings.connect_timeout, settings.max_frame_size).await?;
    settings.handshake.perform(&mut connection).await?;
    Ok(connection)
}

async fn connect_with_retries(
    shared: &Shared,
    settings: &EndpointSettings,
    shutdown: &mut watch::Receiver<bool>,
    delay_first: bool,
) -> ConnectOutcome {
    let mut backoff = Backoff::new(&settings.retry);
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=settings.reconnect_attempts.max(1) {
        if attempt > 1 || delay_first {
            let delay = backoff.next_delay();
            shared.emit(ConnectionEvent::ReconnectAttempt {
                address: shared.address,
                attempt,
                next_delay: delay,
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if shutdown_requested(changed, shutdown) {
                        return ConnectOutcome::Shutdown;
                    }
                }
            }
        }

        match connect_once(shared.address, settings).await {
            Ok(connection) => {
                if attempt > 1 || delay_first {
                    tracing::info!(address = %shared.address, attempt, "reconnection successful");
                }
                return ConnectOutcome::Established(connection);
            }
            Err(e) => {
                tracing::warn!(
                    address = %shared.address,
                    attempt,
                    error = %e,
                    "connection attempt failed"
                );
                last_error = e.to_string();
            }
        }
    }

    ConnectOutcome::Exhausted(last_error)
}

/// Waits for the node to come back, failing anything queued meanwhile.
async fn recheck(
    shared: &Shared,
    settings: &EndpointSettings,
    queue: &mut mpsc::Receiver<Outbound>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Connection> {
    let mut ticker = interval_at(
        Instant::now() + settings.recheck_interval,
        settings.recheck_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if shutdown_requested(changed, shutdown) {
                    return None;
                }
            }
            outbound = queue.recv() => match outbound {
                Some(outbound) => shared.fail_one(
                    outbound.opaque,
                    EmberError::NodeUnavailable(format!("{} is unreachable", shared.address)),
                ),
                None => return None,
            },
            _ = ticker.tick() => match connect_once(shared.address, settings).await {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    tracing::debug!(
                        address = %shared.address,
                        error = %e,
                        "reachability check failed"
                    );
                }
            },
        }
    }
}

async fn serve(
    shared: &Shared,
    settings: &EndpointSettings,
    connection: Connection,
    queue: &mut mpsc::Receiver<Outbound>,
    shutdown: &mut watch::Receiver<bool>,
) -> ServeExit {
    let (_, stream, buffered) = connection.into_parts();
    let (read_half, write_half) = stream.into_split();
    let mut reader: FramedRead<OwnedReadHalf, FrameCodec> =
        FramedRead::new(read_half, FrameCodec::with_max_body_size(settings.max_frame_size));
    reader.read_buffer_mut().extend_from_slice(&buffered);
    let mut writer: FramedWrite<OwnedWriteHalf, FrameCodec> =
        FramedWrite::new(write_half, FrameCodec::with_max_body_size(settings.max_frame_size));

    let mut heartbeat = interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_read = Instant::now();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if shutdown_requested(changed, shutdown) {
                    return ServeExit::Shutdown;
                }
            }
            outbound = queue.recv() => {
                let Some(outbound) = outbound else {
                    return ServeExit::Shutdown;
                };
                if outbound.frame.body_len() > settings.max_frame_size {
                    shared.fail_one(
                        outbound.opaque,
                        EmberError::InvalidArgument(format!(
                            "frame body of {} bytes exceeds limit of {} bytes",
                            outbound.frame.body_len(),
                            settings.max_frame_size
                        )),
                    );
                    continue;
                }
                if !shared.mark_sent(outbound.opaque) {
                    tracing::trace!(opaque = outbound.opaque, "skipping cancelled request");
                    continue;
                }
                if let Err(e) = writer.send(outbound.frame).await {
                    return ServeExit::Lost(format!("write failed: {}", e));
                }
            }
            inbound = reader.next() => match inbound {
                Some(Ok(frame)) => {
                    last_read = Instant::now();
                    shared.complete(frame);
                }
                Some(Err(e)) => return ServeExit::Lost(format!("read failed: {}", e)),
                None => return ServeExit::Lost("closed by peer".to_string()),
            },
            _ = heartbeat.tick() => {
                if last_read.elapsed() >= settings.idle_timeout {
                    return ServeExit::Lost(format!(
                        "no data received for {:?}",
                        settings.idle_timeout
                    ));
                }
                let noop = match Request::Noop.encode(0, HEARTBEAT_OPAQUE) {
                    Ok(frame) => frame,
                    Err(e) => return ServeExit::Lost(format!("heartbeat encode failed: {}", e)),
                };
                if let Err(e) = writer.send(noop).await {
                    return ServeExit::Lost(format!("heartbeat failed: {}", e));
                }
            }
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    settings: EndpointSettings,
    mut queue: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
    connection: Option<Connection>,
) {
    let mut established = connection;
    let mut delay_first = false;

    loop {
        let connection = match established.take() {
            Some(connection) => connection,
            None => match connect_with_retries(&shared, &settings, &mut shutdown, delay_first).await
            {
                ConnectOutcome::Established(connection) => connection,
                ConnectOutcome::Shutdown => break,
                ConnectOutcome::Exhausted(error) => {
                    shared.set_state(EndpointState::Unreachable);
                    shared.fail_all("node unreachable");
                    tracing::error!(address = %shared.address, error = %error, "node marked unreachable");
                    shared.emit(ConnectionEvent::NodeUnreachable {
                        address: shared.address,
                        error,
                    });

                    match recheck(&shared, &settings, &mut queue, &mut shutdown).await {
                        Some(connection) => {
                            tracing::info!(address = %shared.address, "node recovered");
                            shared.emit(ConnectionEvent::NodeRecovered {
                                address: shared.address,
                            });
                            established = Some(connection);
                            continue;
                        }
                        None => break,
                    }
                }
            },
        };

        let id = connection.id();
        shared.set_state(EndpointState::Connected);
        shared.emit(ConnectionEvent::Connected {
            id,
            address: shared.address,
        });
        tracing::debug!(id = %id, address = %shared.address, "endpoint connected");

        match serve(&shared, &settings, connection, &mut queue, &mut shutdown).await {
            ServeExit::Shutdown => break,
            ServeExit::Lost(error) => {
                tracing::warn!(id = %id, address = %shared.address, error = %error, "connection lost");
                shared.set_state(EndpointState::Reconnecting);
                shared.fail_sent(&error);
                shared.emit(ConnectionEvent::Disconnected {
                    id,
                    address: shared.address,
                    error: Some(error),
                });
                delay_first = true;
            }
        }
    }

    shared.set_state(EndpointState::Closed);
    queue.close();
    while queue.try_recv().is_ok() {}
    shared.fail_all("endpoint closed");
    tracing::debug!(address = %shared.address, "endpoint stopped");
}
