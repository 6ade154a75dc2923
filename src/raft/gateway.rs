//! Client Gateway: the surface `AddTrack`/`RemoveTrack`/`GetQueue` land on.
//! A Follower/Candidate forwards to the known leader; the Leader proposes
//! a log entry and blocks the caller until it commits or times out.

use super::RoleState;
use crate::message::{ClientOutcome, ClientReply, ClientRequest, CommandKind, Track};
use crate::raft::RaftNode;
use log::warn;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug)]
pub enum ProposeOutcome {
    Committed(Vec<Track>),
    TimedOut(Vec<Track>),
    NotLeader,
}

/// Appends `command` to the leader's log, kicks off an immediate
/// replication round, then blocks until `commit_index` reaches that
/// entry's index or the client-apply timeout elapses (§4.5). Does not
/// rescind the local append on timeout — the entry may still commit later.
pub(super) async fn propose_and_wait(node: &Arc<RaftNode>, command: CommandKind) -> ProposeOutcome {
    let index = {
        let mut state = node.state.lock().await;
        if state.role != RoleState::Leader {
            return ProposeOutcome::NotLeader;
        }
        let term = state.current_term;
        let index = state.log.append_local(term, command);
        log::info!("Node {} appended log[{}]", node.config.node_id, index);
        index
    };

    super::replication::broadcast_append_entries(node).await;

    let deadline = Instant::now() + node.config.timing.client_apply_timeout;
    loop {
        // Registering the `Notified` future *before* checking the
        // condition is what makes this race-free: `notify_waiters` only
        // wakes futures that already exist, so a commit-index advance
        // between the check below and the `.await` is not missed.
        let notified = node.commit_notify.notified();

        {
            let state = node.state.lock().await;
            if state.commit_index >= index as i64 {
                return ProposeOutcome::Committed(state.fsm.snapshot());
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let state = node.state.lock().await;
            return ProposeOutcome::TimedOut(state.fsm.snapshot());
        }

        let _ = tokio::time::timeout(remaining, notified).await;
    }
}

/// Handles a `ClientRequest` received directly on this node: serve reads
/// locally, forward mutations to the leader if this node isn't it, or
/// propose-and-wait if it is.
pub(super) async fn handle_client_request(node: &Arc<RaftNode>, req: ClientRequest) -> ClientReply {
    match req {
        ClientRequest::GetQueue => ClientReply { outcome: ClientOutcome::Forwarded, queue: node.snapshot_queue().await },
        ClientRequest::AddTrack(track) => mutate(node, CommandKind::Add(track)).await,
        ClientRequest::RemoveTrack(id) => mutate(node, CommandKind::Remove(id)).await,
    }
}

async fn mutate(node: &Arc<RaftNode>, command: CommandKind) -> ClientReply {
    if !node.is_leader().await {
        return match node.leader_id().await {
            Some(leader) => forward(node, leader, command).await,
            None => ClientReply { outcome: ClientOutcome::NoLeader, queue: node.snapshot_queue().await },
        };
    }

    match propose_and_wait(node, command).await {
        ProposeOutcome::Committed(queue) => ClientReply { outcome: ClientOutcome::Queued, queue },
        ProposeOutcome::TimedOut(queue) => ClientReply { outcome: ClientOutcome::QueuedButNotCommitted, queue },
        ProposeOutcome::NotLeader => ClientReply { outcome: ClientOutcome::NoLeader, queue: node.snapshot_queue().await },
    }
}

async fn forward(node: &Arc<RaftNode>, leader: crate::message::PeerId, command: CommandKind) -> ClientReply {
    let request = match command {
        CommandKind::Add(track) => ClientRequest::AddTrack(track),
        CommandKind::Remove(id) => ClientRequest::RemoveTrack(id),
    };
    match node.transport().forward_client_request(leader, request).await {
        Ok(reply) => ClientReply { outcome: ClientOutcome::Forwarded, queue: reply.queue },
        Err(e) => {
            warn!("Node {}: forwarding to leader {} failed: {}", node.config.node_id, leader, e);
            ClientReply { outcome: ClientOutcome::NoLeader, queue: node.snapshot_queue().await }
        }
    }
}
