use super::{next_commit_index, RaftNode, RoleState};
use crate::message::{AppendEntriesReply, AppendEntriesRequest, PeerId};
use log::info;
use std::sync::Arc;

/// `AppendEntries` RPC handler (receiver side), §4.4. Covers both
/// heartbeats (empty `entries`) and real replication.
pub(super) async fn handle_append_entries(node: &RaftNode, from: PeerId, req: AppendEntriesRequest) -> AppendEntriesReply {
    log::debug!("Node {} runs RPC AppendEntries called by Node {}", node.config.node_id, from);
    let mut state = node.state.lock().await;

    if req.term < state.current_term {
        return AppendEntriesReply { term: state.current_term, success: false };
    }

    if req.term > state.current_term {
        state.step_down(req.term, &node.config.timing);
    } else {
        // Same term: a valid AppendEntries from the current leader demotes
        // a Candidate, per §4.4's Candidate -> Follower rule.
        state.role = RoleState::Follower;
    }
    state.leader_id = Some(req.leader_id);
    state.reset_election_deadline(&node.config.timing);

    let outcome = state.log.apply_append(req.prev_log_index, req.prev_log_term, &req.entries);
    if !outcome.accepted {
        return AppendEntriesReply { term: state.current_term, success: false };
    }

    if req.leader_commit > state.commit_index {
        state.commit_index = std::cmp::min(req.leader_commit, state.log.last_index());
        info!("Node {} advanced commit_index to {}", node.config.node_id, state.commit_index);
        state.apply_committed();
    }

    AppendEntriesReply { term: state.current_term, success: true }
}

/// Leader replication loop, §4.4. Builds one `AppendEntries` per peer
/// (tailored to that peer's `next_index`) and sends each on its own task,
/// so a single slow follower cannot hold up replication to the others.
/// Called both from the heartbeat tick and immediately after a local
/// append.
pub(super) async fn broadcast_append_entries(node: &Arc<RaftNode>) {
    let (term, leader_commit, per_peer) = {
        let state = node.state.lock().await;
        let Some(leader_state) = &state.leader_state else { return };
        let last_index = state.log.last_index();

        let per_peer: Vec<(PeerId, i64, u64, Vec<_>)> = node
            .config
            .peer_ids()
            .map(|peer| {
                let next_index = *leader_state.next_index.get(&peer).unwrap_or(&((last_index + 1) as u64));
                let prev_log_index = next_index as i64 - 1;
                let prev_log_term = state.log.term_at(prev_log_index).unwrap_or(0);
                let entries = state.log.slice_from(next_index as i64);
                (peer, prev_log_index, prev_log_term, entries)
            })
            .collect();

        (state.current_term, state.commit_index, per_peer)
    };

    for (peer, prev_log_index, prev_log_term, entries) in per_peer {
        let node = Arc::clone(node);
        let req = AppendEntriesRequest {
            term,
            leader_id: node.config.node_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };
        let sent_up_to = prev_log_index + req.entries.len() as i64;
        tokio::spawn(async move {
            let reply = node.transport().send_append_entries(node.config.node_id, peer, req).await;
            if let Ok(reply) = reply {
                handle_append_entries_reply(&node, peer, prev_log_index, sent_up_to, reply).await;
            }
        });
    }
}

async fn handle_append_entries_reply(
    node: &Arc<RaftNode>,
    peer: PeerId,
    prev_log_index: i64,
    sent_up_to: i64,
    reply: AppendEntriesReply,
) {
    let mut state = node.state.lock().await;

    if reply.term > state.current_term {
        state.step_down(reply.term, &node.config.timing);
        return;
    }

    if state.role != RoleState::Leader || reply.term != state.current_term {
        return;
    }

    if state.leader_state.is_none() {
        return;
    }

    if reply.success {
        {
            let leader_state = state.leader_state.as_mut().unwrap();
            leader_state.match_index.insert(peer, sent_up_to);
            leader_state.next_index.insert(peer, (sent_up_to + 1) as u64);
        }

        let quorum = node.config.quorum();
        let current_term = state.current_term;
        let last_index = state.log.last_index();
        let advanced = {
            let match_index = &state.leader_state.as_ref().unwrap().match_index;
            next_commit_index(state.commit_index, last_index, current_term, quorum, match_index, |n| state.log.term_at(n))
        };

        if advanced > state.commit_index {
            state.commit_index = advanced;
            info!("Node {} advanced commit_index to {}", node.config.node_id, advanced);
            state.apply_committed();
            node.commit_notify.notify_waiters();
        }
    } else {
        let leader_state = state.leader_state.as_mut().unwrap();
        let current_next = *leader_state.next_index.get(&peer).unwrap_or(&((prev_log_index + 1) as u64));
        let backed_off = current_next.saturating_sub(1);
        leader_state.next_index.insert(peer, backed_off);
    }
}
