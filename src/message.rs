//! Wire types shared by the peer transport and the client gateway.

use serde::{Deserialize, Serialize};

/// Logical identity of a cluster member. Distinct from a `SocketAddr`
/// because log lines and vote bookkeeping key off this, not the TCP peer
/// address.
pub type PeerId = u64;

pub type Term = u64;
pub type Index = u64;

/// A track in the music queue. `id` is the dedup key the FSM uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub title: String,
    pub artist: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackId(pub u64);

/// The two mutating commands the FSM accepts. Modeled as a tagged variant,
/// not a string-keyed field, so `apply` dispatches on the type system
/// rather than on string comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Add(Track),
    Remove(TrackId),
}

/// One entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: Index,
    pub command: CommandKind,
}

// --- Peer RPCs -------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: PeerId,
    pub last_log_index: i64,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: PeerId,
    pub prev_log_index: i64,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

// --- Client RPCs -------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    AddTrack(Track),
    RemoveTrack(TrackId),
    GetQueue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientOutcome {
    Queued,
    QueuedButNotCommitted,
    NoLeader,
    Forwarded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientReply {
    pub outcome: ClientOutcome,
    pub queue: Vec<Track>,
}

/// Outer envelope on the wire: every frame names the logical sender so
/// handlers can log `called by Node <src>` without trusting the TCP peer
/// address, and tags which surface (peer vs. client) the payload belongs
/// to so both can share one listening socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    RequestVote { from: PeerId, body: RequestVoteRequest },
    RequestVoteReply { from: PeerId, body: RequestVoteReply },
    AppendEntries { from: PeerId, body: AppendEntriesRequest },
    AppendEntriesReply { from: PeerId, body: AppendEntriesReply },
    Client { body: ClientRequest },
    ClientReply { body: ClientReply },
}
