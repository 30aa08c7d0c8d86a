//! An in-process cluster speaking the binary protocol.
//!
//! Every node shares one document table, so moving a vbucket between nodes
//! only changes which node accepts requests for it. Faults are queued per
//! opcode and consumed by the first matching request on any node.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;

use ember_client::{ClientConfig, ClientConfigBuilder};
use ember_core::protocol::{
    features, split_collection_key, CounterDirection, Frame, FrameCodec, Opcode, Request,
    Response, ResponseBody, Status, StoreMode,
};
use ember_core::vbucket_for_key;

pub const BUCKET: &str = "travel";
pub const VBUCKETS: u16 = 1024;
pub const USERS_COLLECTION_ID: u32 = 8;

/// What a node does with the next request carrying a given opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Apply the request but never answer it.
    DropResponse,
    /// Close the socket without applying the request.
    CloseConnection,
    /// Answer with a temporary failure.
    TemporaryFailure,
    /// Answer with `NotMyVbucket` and no configuration body.
    NotMyVbucket,
}

/// A data request as seen by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub node: usize,
    pub opcode: Opcode,
    pub collection_id: u32,
    pub key: String,
}

#[derive(Debug, Clone)]
struct StoredDoc {
    value: Bytes,
    flags: u32,
    cas: u64,
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<(u32, Vec<u8>), StoredDoc>,
    faults: VecDeque<(Opcode, Fault)>,
    log: Vec<LoggedRequest>,
    rev: u64,
    owners: Vec<usize>,
}

#[derive(Debug)]
struct MockState {
    addresses: Vec<SocketAddr>,
    next_cas: AtomicU64,
    inner: Mutex<Inner>,
}

enum Reply {
    Send(Frame),
    Silent,
    Close,
}

fn ok(opcode: Opcode, opaque: u32, cas: u64, body: ResponseBody) -> Reply {
    Reply::Send(Response::success(opcode, opaque, cas, body).to_frame())
}

fn fail(opcode: Opcode, opaque: u32, status: Status) -> Reply {
    Reply::Send(Response::failure(opcode, opaque, status, Bytes::new()).to_frame())
}

impl MockState {
    fn config_json(&self) -> Bytes {
        let inner = self.inner.lock();
        let servers: Vec<String> = self.addresses.iter().map(|a| a.to_string()).collect();
        let map: Vec<Vec<i32>> = inner.owners.iter().map(|&node| vec![node as i32]).collect();
        let config = json!({
            "rev": inner.rev,
            "name": BUCKET,
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": servers,
                "vBucketMap": map,
            }
        });
        Bytes::from(serde_json::to_vec(&config).unwrap())
    }

    fn manifest_json() -> Bytes {
        let manifest = json!({
            "uid": "2",
            "scopes": [
                {"name": "_default", "collections": [{"name": "_default", "uid": "0"}]},
                {"name": "app", "collections": [{"name": "users", "uid": "8"}]},
            ]
        });
        Bytes::from(serde_json::to_vec(&manifest).unwrap())
    }

    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::SeqCst)
    }

    fn take_fault(&self, opcode: Opcode) -> Option<Fault> {
        let mut inner = self.inner.lock();
        let index = inner.faults.iter().position(|(op, _)| *op == opcode)?;
        inner.faults.remove(index).map(|(_, fault)| fault)
    }

    fn handle(&self, node: usize, frame: &Frame) -> Reply {
        let Some(opcode) = Opcode::from_code(frame.opcode) else {
            return Reply::Close;
        };
        let opaque = frame.opaque;
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(_) => return fail(opcode, opaque, Status::Invalid),
        };

        match request {
            Request::Hello { .. } => ok(
                opcode,
                opaque,
                0,
                ResponseBody::Features(vec![
                    features::SELECT_BUCKET,
                    features::XERROR,
                    features::COLLECTIONS,
                ]),
            ),
            Request::SaslAuth { .. } | Request::SelectBucket { .. } | Request::Noop => {
                ok(opcode, opaque, 0, ResponseBody::Empty)
            }
            Request::GetClusterConfig => {
                ok(opcode, opaque, 0, ResponseBody::Value(self.config_json()))
            }
            Request::GetCollectionsManifest => {
                ok(opcode, opaque, 0, ResponseBody::Value(Self::manifest_json()))
            }
            request => self.handle_data(node, opcode, frame, request),
        }
    }

    fn handle_data(&self, node: usize, opcode: Opcode, frame: &Frame, request: Request) -> Reply {
        let opaque = frame.opaque;
        let Some((collection_id, key)) = split_collection_key(&frame.key) else {
            return fail(opcode, opaque, Status::Invalid);
        };
        let id = (collection_id, key.to_vec());

        let owned = {
            let mut inner = self.inner.lock();
            inner.log.push(LoggedRequest {
                node,
                opcode,
                collection_id,
                key: String::from_utf8_lossy(key).into_owned(),
            });
            inner.owners.get(frame.vbucket() as usize) == Some(&node)
        };
        if !owned {
            return Reply::Send(
                Response::failure(opcode, opaque, Status::NotMyVbucket, self.config_json())
                    .to_frame(),
            );
        }

        let silent = match self.take_fault(opcode) {
            Some(Fault::TemporaryFailure) => return fail(opcode, opaque, Status::TemporaryFailure),
            Some(Fault::NotMyVbucket) => return fail(opcode, opaque, Status::NotMyVbucket),
            Some(Fault::CloseConnection) => return Reply::Close,
            Some(Fault::DropResponse) => true,
            None => false,
        };

        let reply = self.apply(opcode, opaque, id, request);
        if silent {
            Reply::Silent
        } else {
            reply
        }
    }

    fn apply(&self, opcode: Opcode, opaque: u32, id: (u32, Vec<u8>), request: Request) -> Reply {
        let mut inner = self.inner.lock();
        match request {
            Request::Get { .. } => match inner.docs.get(&id) {
                Some(doc) => ok(
                    opcode,
                    opaque,
                    doc.cas,
                    ResponseBody::Document {
                        flags: doc.flags,
                        value: doc.value.clone(),
                    },
                ),
                None => fail(opcode, opaque, Status::NotFound),
            },
            Request::GetMeta { .. } => match inner.docs.get(&id) {
                Some(doc) => ok(
                    opcode,
                    opaque,
                    doc.cas,
                    ResponseBody::Meta {
                        deleted: false,
                        flags: doc.flags,
                        expiry: 0,
                        seqno: doc.cas,
                    },
                ),
                None => fail(opcode, opaque, Status::NotFound),
            },
            Request::Store {
                mode,
                value,
                flags,
                cas,
                ..
            } => {
                let existing = inner.docs.get(&id).map(|doc| doc.cas);
                match (mode, existing) {
                    (StoreMode::Insert, Some(_)) => return fail(opcode, opaque, Status::Exists),
                    (StoreMode::Replace, None) => return fail(opcode, opaque, Status::NotFound),
                    (_, Some(current)) if cas != 0 && current != cas => {
                        return fail(opcode, opaque, Status::Exists)
                    }
                    (_, None) if cas != 0 => return fail(opcode, opaque, Status::NotFound),
                    _ => {}
                }
                let cas = self.next_cas();
                inner.docs.insert(id, StoredDoc { value, flags, cas });
                ok(opcode, opaque, cas, ResponseBody::Empty)
            }
            Request::Remove { cas, .. } => match inner.docs.get(&id).map(|doc| doc.cas) {
                None => fail(opcode, opaque, Status::NotFound),
                Some(current) if cas != 0 && current != cas => {
                    fail(opcode, opaque, Status::Exists)
                }
                Some(_) => {
                    inner.docs.remove(&id);
                    ok(opcode, opaque, self.next_cas(), ResponseBody::Empty)
                }
            },
            Request::Counter {
                direction,
                delta,
                initial,
                ..
            } => {
                let current = match inner.docs.get(&id) {
                    Some(doc) => match std::str::from_utf8(&doc.value)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        Some(count) => Some(count),
                        None => return fail(opcode, opaque, Status::DeltaBadValue),
                    },
                    None => None,
                };
                let next = match (current, initial) {
                    (Some(count), _) => match direction {
                        CounterDirection::Increment => count.wrapping_add(delta),
                        CounterDirection::Decrement => count.saturating_sub(delta),
                    },
                    (None, Some(initial)) => initial,
                    (None, None) => return fail(opcode, opaque, Status::NotFound),
                };
                let cas = self.next_cas();
                inner.docs.insert(
                    id,
                    StoredDoc {
                        value: Bytes::from(next.to_string()),
                        flags: 0,
                        cas,
                    },
                );
                ok(opcode, opaque, cas, ResponseBody::Counter(next))
            }
            _ => fail(opcode, opaque, Status::UnknownCommand),
        }
    }
}

async fn serve(node: usize, state: Arc<MockState>, stream: TcpStream) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    while let Some(Ok(frame)) = framed.next().await {
        match state.handle(node, &frame) {
            Reply::Send(response) => {
                if framed.send(response).await.is_err() {
                    break;
                }
            }
            Reply::Silent => {}
            Reply::Close => break,
        }
    }
}

async fn accept_loop(node: usize, listener: TcpListener, state: Arc<MockState>) {
    let mut connections = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                connections.spawn(serve(node, Arc::clone(&state), stream));
            }
            Err(_) => break,
        }
    }
}

/// A running mock cluster. Dropping it stops every node.
pub struct MockCluster {
    state: Arc<MockState>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockCluster {
    /// Starts `nodes` nodes on loopback ports, vbuckets spread round-robin.
    pub async fn start(nodes: usize) -> Self {
        let mut listeners = Vec::with_capacity(nodes);
        for _ in 0..nodes {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addresses = listeners
            .iter()
            .map(|l| l.local_addr().unwrap())
            .collect();

        let state = Arc::new(MockState {
            addresses,
            next_cas: AtomicU64::new(1000),
            inner: Mutex::new(Inner {
                rev: 1,
                owners: (0..VBUCKETS as usize).map(|vb| vb % nodes).collect(),
                ..Inner::default()
            }),
        });

        let tasks = listeners
            .into_iter()
            .enumerate()
            .map(|(node, listener)| tokio::spawn(accept_loop(node, listener, Arc::clone(&state))))
            .collect();

        Self { state, tasks }
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.state.addresses.clone()
    }

    /// A configuration with short retry delays and no background polling.
    pub fn config_builder(&self) -> ClientConfigBuilder {
        ClientConfig::builder()
            .bucket(BUCKET)
            .addresses(self.addresses())
            .network(|n| {
                n.connections_per_node(1)
                    .connection_timeout(Duration::from_secs(2))
                    .heartbeat_interval(Duration::from_secs(300))
                    .idle_timeout(Duration::from_secs(600))
                    .config_poll_interval(Duration::from_secs(3600))
                    .reconnect_attempts(5)
            })
            .retry(|r| {
                r.initial_backoff(Duration::from_millis(1))
                    .max_backoff(Duration::from_millis(20))
                    .max_attempts(10)
            })
            .timeouts(|t| {
                t.kv_timeout(Duration::from_secs(2))
                    .bootstrap_timeout(Duration::from_secs(2))
            })
    }

    pub fn config(&self) -> ClientConfig {
        self.config_builder().build().unwrap()
    }

    pub fn inject(&self, opcode: Opcode, fault: Fault) {
        self.inject_times(opcode, fault, 1);
    }

    pub fn inject_times(&self, opcode: Opcode, fault: Fault, times: usize) {
        let mut inner = self.state.inner.lock();
        for _ in 0..times {
            inner.faults.push_back((opcode, fault));
        }
    }

    pub fn clear_faults(&self) {
        self.state.inner.lock().faults.clear();
    }

    pub fn pending_faults(&self) -> usize {
        self.state.inner.lock().faults.len()
    }

    /// Nodes that received `opcode` for `key`, in arrival order.
    pub fn nodes_hit(&self, opcode: Opcode, key: &str) -> Vec<usize> {
        self.state
            .inner
            .lock()
            .log
            .iter()
            .filter(|entry| entry.opcode == opcode && entry.key == key)
            .map(|entry| entry.node)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.inner.lock().log.clear();
    }

    pub fn owner_of(&self, key: &str) -> usize {
        let vbucket = vbucket_for_key(key.as_bytes(), VBUCKETS) as usize;
        self.state.inner.lock().owners[vbucket]
    }

    /// Hands the vbucket of `key` to the next node and bumps the revision
    /// without telling any client. Returns the new owner.
    pub fn move_key(&self, key: &str) -> usize {
        let vbucket = vbucket_for_key(key.as_bytes(), VBUCKETS) as usize;
        let mut inner = self.state.inner.lock();
        let nodes = self.state.addresses.len();
        let next = (inner.owners[vbucket] + 1) % nodes;
        inner.owners[vbucket] = next;
        inner.rev += 1;
        next
    }

    /// The stored body of `key`, bypassing the protocol.
    pub fn value(&self, collection_id: u32, key: &str) -> Option<Bytes> {
        self.state
            .inner
            .lock()
            .docs
            .get(&(collection_id, key.as_bytes().to_vec()))
            .map(|doc| doc.value.clone())
    }

    /// Keys stored in collection `collection_id`, sorted.
    pub fn keys(&self, collection_id: u32) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .inner
            .lock()
            .docs
            .keys()
            .filter(|(cid, _)| *cid == collection_id)
            .map(|(_, key)| String::from_utf8_lossy(key).into_owned())
            .collect();
        keys.sort();
        keys
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A loopback address with nothing listening on it.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);
    address
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
