//! Peer Transport: point-to-point request/reply between cluster members.
//!
//! `PeerTransport` is the seam spec.md names explicitly (teacher code
//! inlines `TcpStream::connect` per call; here it is a named, swappable
//! component). `TcpPeerTransport` is the production implementation;
//! `InProcessTransport` exists only for tests, so the deterministic
//! scenarios in spec §8 don't depend on real sockets or wall-clock sleeps.

use crate::message::{
    AppendEntriesReply, AppendEntriesRequest, ClientReply, ClientRequest, Envelope, PeerId,
    RequestVoteReply, RequestVoteRequest,
};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("peer {peer} is unavailable: {reason}")]
    Unavailable { peer: PeerId, reason: String },
    #[error("peer {peer} did not reply within the call deadline")]
    Timeout { peer: PeerId },
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Handlers a cluster member exposes to its peers and to forwarded client
/// calls. Implemented by `RaftNode` (see `raft` module); kept separate from
/// `PeerTransport` so the transport never needs to know about `RaftState`.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    async fn handle_request_vote(&self, from: PeerId, req: RequestVoteRequest) -> RequestVoteReply;
    async fn handle_append_entries(&self, from: PeerId, req: AppendEntriesRequest) -> AppendEntriesReply;
    async fn handle_client_request(&self, req: ClientRequest) -> ClientReply;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_request_vote(
        &self,
        from: PeerId,
        peer: PeerId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn send_append_entries(
        &self,
        from: PeerId,
        peer: PeerId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, TransportError>;

    async fn forward_client_request(
        &self,
        peer: PeerId,
        req: ClientRequest,
    ) -> Result<ClientReply, TransportError>;
}

// ------------------------------------------------------------------
// TCP implementation
// ------------------------------------------------------------------

struct CachedConn {
    stream: Mutex<Option<TcpStream>>,
    addr: SocketAddr,
}

pub struct TcpPeerTransport {
    conns: HashMap<PeerId, CachedConn>,
    timeout: Duration,
}

impl TcpPeerTransport {
    pub fn new(peers: &HashMap<PeerId, SocketAddr>, timeout: Duration) -> Self {
        let conns = peers
            .iter()
            .map(|(&id, &addr)| (id, CachedConn { stream: Mutex::new(None), addr }))
            .collect();
        Self { conns, timeout }
    }

    async fn call(&self, peer: PeerId, request: Envelope) -> Result<Envelope, TransportError> {
        let cached = self.conns.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        let mut guard = cached.stream.lock().await;

        tokio::time::timeout(self.timeout, async {
            if guard.is_none() {
                let stream = TcpStream::connect(cached.addr)
                    .await
                    .map_err(|e| TransportError::Unavailable { peer, reason: e.to_string() })?;
                *guard = Some(stream);
            }

            let result = write_then_read(guard.as_mut().unwrap(), &request).await;
            if result.is_err() {
                // Drop the cached connection; the next call reconnects.
                *guard = None;
            }
            result.map_err(|e| TransportError::Unavailable { peer, reason: e.to_string() })
        })
        .await
        .map_err(|_| TransportError::Timeout { peer })?
    }
}

async fn write_then_read(stream: &mut TcpStream, request: &Envelope) -> anyhow::Result<Envelope> {
    let body = serde_json::to_vec(request)?;
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    let reply_len = stream.read_u32().await?;
    let mut buf = vec![0u8; reply_len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    async fn send_request_vote(
        &self,
        from: PeerId,
        peer: PeerId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteReply, TransportError> {
        debug!("Node {from} sends RPC RequestVote to Node {peer}");
        match self.call(peer, Envelope::RequestVote { from, body: req }).await? {
            Envelope::RequestVoteReply { body, .. } => Ok(body),
            _ => Err(TransportError::Unavailable { peer, reason: "unexpected reply shape".into() }),
        }
    }

    async fn send_append_entries(
        &self,
        from: PeerId,
        peer: PeerId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, TransportError> {
        debug!("Node {from} sends RPC AppendEntries to Node {peer}");
        match self.call(peer, Envelope::AppendEntries { from, body: req }).await? {
            Envelope::AppendEntriesReply { body, .. } => Ok(body),
            _ => Err(TransportError::Unavailable { peer, reason: "unexpected reply shape".into() }),
        }
    }

    async fn forward_client_request(
        &self,
        peer: PeerId,
        req: ClientRequest,
    ) -> Result<ClientReply, TransportError> {
        match self.call(peer, Envelope::Client { body: req }).await? {
            Envelope::ClientReply { body } => Ok(body),
            _ => Err(TransportError::Unavailable { peer, reason: "unexpected reply shape".into() }),
        }
    }
}

/// Reads `Envelope` frames off an accepted TCP connection and dispatches
/// them to `endpoint`, writing back the matching reply. Used by the
/// `queue-server` binary's accept loop.
pub async fn serve_connection(mut stream: TcpStream, endpoint: Arc<dyn PeerEndpoint>) {
    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len,
            Err(_) => return,
        };
        let mut buf = vec![0u8; len as usize];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }
        let request: Envelope = match serde_json::from_slice(&buf) {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to decode inbound frame: {e}");
                return;
            }
        };

        let reply = match request {
            Envelope::RequestVote { from, body } => {
                let reply = endpoint.handle_request_vote(from, body).await;
                Envelope::RequestVoteReply { from, body: reply }
            }
            Envelope::AppendEntries { from, body } => {
                let reply = endpoint.handle_append_entries(from, body).await;
                Envelope::AppendEntriesReply { from, body: reply }
            }
            Envelope::Client { body } => {
                let reply = endpoint.handle_client_request(body).await;
                Envelope::ClientReply { body: reply }
            }
            Envelope::RequestVoteReply { .. }
            | Envelope::AppendEntriesReply { .. }
            | Envelope::ClientReply { .. } => return,
        };

        let Ok(bytes) = serde_json::to_vec(&reply) else { return };
        if stream.write_u32(bytes.len() as u32).await.is_err() {
            return;
        }
        if stream.write_all(&bytes).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
    }
}

// ------------------------------------------------------------------
// In-process implementation (test support)
// ------------------------------------------------------------------

/// Routes calls directly to a peer's `PeerEndpoint` in the same process,
/// with an injectable one-shot packet drop. Lets spec §8's "simulated
/// transport" scenarios run deterministically (in particular under
/// `tokio::time::pause`) instead of over real sockets.
#[derive(Default)]
pub struct InProcessTransport {
    endpoints: Mutex<HashMap<PeerId, Arc<dyn PeerEndpoint>>>,
    drop_once: Mutex<std::collections::HashSet<(PeerId, PeerId)>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: PeerId, endpoint: Arc<dyn PeerEndpoint>) {
        self.endpoints.lock().await.insert(id, endpoint);
    }

    /// The next message sent from `from` to `to` (in either RPC direction)
    /// is silently dropped, as if it never reached the network.
    pub async fn drop_next(&self, from: PeerId, to: PeerId) {
        self.drop_once.lock().await.insert((from, to));
    }

    async fn should_drop(&self, from: PeerId, to: PeerId) -> bool {
        self.drop_once.lock().await.remove(&(from, to))
    }

    async fn endpoint_for(&self, peer: PeerId) -> Result<Arc<dyn PeerEndpoint>, TransportError> {
        self.endpoints
            .lock()
            .await
            .get(&peer)
            .cloned()
            .ok_or(TransportError::UnknownPeer(peer))
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn send_request_vote(
        &self,
        from: PeerId,
        peer: PeerId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteReply, TransportError> {
        if self.should_drop(from, peer).await {
            return Err(TransportError::Unavailable { peer, reason: "dropped by test harness".into() });
        }
        let endpoint = self.endpoint_for(peer).await?;
        Ok(endpoint.handle_request_vote(from, req).await)
    }

    async fn send_append_entries(
        &self,
        from: PeerId,
        peer: PeerId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, TransportError> {
        if self.should_drop(from, peer).await {
            return Err(TransportError::Unavailable { peer, reason: "dropped by test harness".into() });
        }
        let endpoint = self.endpoint_for(peer).await?;
        Ok(endpoint.handle_append_entries(from, req).await)
    }

    async fn forward_client_request(
        &self,
        peer: PeerId,
        req: ClientRequest,
    ) -> Result<ClientReply, TransportError> {
        let endpoint = self.endpoint_for(peer).await?;
        Ok(endpoint.handle_client_request(req).await)
    }
}
