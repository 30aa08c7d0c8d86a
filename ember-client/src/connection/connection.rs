//! Single connection to a cluster node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use ember_core::protocol::{Frame, FrameCodec, Request, Response};
use ember_core::{EmberError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generates a new unique connection ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection to a single cluster node.
///
/// Used directly for one-request-at-a-time exchanges such as the handshake
/// and bootstrap. Multiplexed traffic goes through an endpoint, which takes
/// the connection apart with [`Connection::into_parts`].
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    address: SocketAddr,
    stream: TcpStream,
    codec: FrameCodec,
    read_buffer: BytesMut,
    created_at: Instant,
    next_opaque: u32,
}

impl Connection {
    /// Creates a new connection from an established TCP stream.
    pub fn new(stream: TcpStream, address: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            id: ConnectionId::new(),
            address,
            stream,
            codec: FrameCodec::with_max_body_size(max_frame_size),
            read_buffer: BytesMut::with_capacity(8192),
            created_at: Instant::now(),
            next_opaque: 1,
        }
    }

    /// Returns the connection's unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the remote address of this connection.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns when this connection was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Establishes a new connection to the given address.
    pub async fn connect(
        address: SocketAddr,
        timeout: Duration,
        max_frame_size: usize,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                EmberError::Connection(format!(
                    "connection to {} timed out after {:?}",
                    address, timeout
                ))
            })?
            .map_err(|e| {
                EmberError::Connection(format!("failed to connect to {}: {}", address, e))
            })?;

        stream.set_nodelay(true).map_err(|e| {
            EmberError::Connection(format!("failed to set TCP_NODELAY: {}", e))
        })?;

        tracing::debug!(address = %address, "established connection");
        Ok(Self::new(stream, address, max_frame_size))
    }

    /// Sends a frame over this connection.
    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf)?;

        self.stream.write_all(&buf).await.map_err(|e| {
            EmberError::Connection(format!("failed to write to {}: {}", self.address, e))
        })?;

        Ok(())
    }

    /// Receives a frame from this connection.
    ///
    /// Returns `None` if the connection is closed cleanly.
    pub async fn receive(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }

            let bytes_read = self.stream.read_buf(&mut self.read_buffer).await.map_err(|e| {
                EmberError::Connection(format!("failed to read from {}: {}", self.address, e))
            })?;

            if bytes_read == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(EmberError::Connection(format!(
                    "connection to {} closed unexpectedly",
                    self.address
                )));
            }
        }
    }

    /// Sends `request` for vbucket 0 and waits for the response with the
    /// matching opaque. Responses with other opaques are discarded.
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1).max(1);

        self.send(request.encode(0, opaque)?).await?;

        loop {
            let frame = self.receive().await?.ok_or_else(|| {
                EmberError::Connection(format!("connection to {} closed", self.address))
            })?;
            if frame.opaque == opaque {
                return Ok(Response::decode(&frame));
            }
            tracing::trace!(opaque = frame.opaque, "discarding unexpected frame");
        }
    }

    /// Splits the connection into its stream and any bytes already read.
    pub fn into_parts(self) -> (ConnectionId, TcpStream, BytesMut) {
        (self.id, self.stream, self.read_buffer)
    }

    /// Closes this connection.
    pub async fn close(self) -> Result<()> {
        drop(self.stream);
        tracing::debug!(id = %self.id, address = %self.address, "connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::protocol::{Opcode, ResponseBody};
    use tokio::net::TcpListener;

    #[test]
    fn test_connection_id_uniqueness() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        let id3 = ConnectionId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId(42);
        assert_eq!(id.to_string(), "conn-42");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = Connection::connect(address, Duration::from_secs(1), 1 << 20).await;
        assert!(matches!(result, Err(EmberError::Connection(_))));
    }

    #[tokio::test]
    async fn test_request_matches_opaque() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut server = Connection::new(stream, peer, 1 << 20);
            let request = server.receive().await.unwrap().unwrap();
            let stray = Response::success(Opcode::Noop, request.opaque + 100, 0, ResponseBody::Empty);
            server.send(stray.to_frame()).await.unwrap();
            let reply = Response::success(Opcode::Noop, request.opaque, 7, ResponseBody::Empty);
            server.send(reply.to_frame()).await.unwrap();
        });

        let mut client = Connection::connect(address, Duration::from_secs(1), 1 << 20)
            .await
            .unwrap();
        let response = client.request(&Request::Noop).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.cas, 7);
    }
}
