use super::{candidate_log_is_up_to_date, LeaderState, RaftNode, RoleState};
use crate::message::{PeerId, RequestVoteReply, RequestVoteRequest};
use log::info;
use std::sync::Arc;

/// `RequestVote` RPC handler (receiver side), §4.4.
pub(super) async fn handle_request_vote(node: &RaftNode, from: PeerId, req: RequestVoteRequest) -> RequestVoteReply {
    info!("Node {} runs RPC RequestVote called by Node {}", node.config.node_id, from);
    let mut state = node.state.lock().await;

    if req.term > state.current_term {
        state.step_down(req.term, &node.config.timing);
    }
    if req.term < state.current_term {
        return RequestVoteReply { term: state.current_term, vote_granted: false };
    }

    let already_voted_for_other = matches!(state.voted_for, Some(v) if v != from);
    let up_to_date = candidate_log_is_up_to_date(
        req.last_log_term,
        req.last_log_index,
        state.log.last_term(),
        state.log.last_index(),
    );

    let vote_granted = !already_voted_for_other && up_to_date;
    if vote_granted {
        state.voted_for = Some(from);
        state.reset_election_deadline(&node.config.timing);
        info!("Node {} voted for {} in term {}", node.config.node_id, from, state.current_term);
    }

    RequestVoteReply { term: state.current_term, vote_granted }
}

/// Follower/Candidate -> Candidate transition, §4.4. Bumps the term, votes
/// for self, and broadcasts `RequestVote` to every peer on its own task so
/// a slow or unreachable peer cannot delay the others.
pub(super) async fn start_election(node: &Arc<RaftNode>) {
    let (term, last_log_index, last_log_term) = {
        let mut state = node.state.lock().await;
        state.role = RoleState::Candidate;
        state.current_term += 1;
        state.voted_for = Some(node.config.node_id);
        state.votes_received.clear();
        state.votes_received.insert(node.config.node_id);
        state.reset_election_deadline(&node.config.timing);
        info!("Node {} became CANDIDATE for term {}", node.config.node_id, state.current_term);
        (state.current_term, state.log.last_index(), state.log.last_term())
    };

    for peer in node.config.peer_ids() {
        let node = Arc::clone(node);
        let req = RequestVoteRequest {
            term,
            candidate_id: node.config.node_id,
            last_log_index,
            last_log_term,
        };
        tokio::spawn(async move {
            let reply = node.transport().send_request_vote(node.config.node_id, peer, req).await;
            if let Ok(reply) = reply {
                handle_vote_reply(&node, term, peer, reply).await;
            }
        });
    }
}

async fn handle_vote_reply(node: &Arc<RaftNode>, election_term: crate::message::Term, peer: PeerId, reply: RequestVoteReply) {
    let become_leader = {
        let mut state = node.state.lock().await;

        if reply.term > state.current_term {
            state.step_down(reply.term, &node.config.timing);
            return;
        }

        // Discard replies for a term other than the one this election was
        // started for, or once we're no longer a candidate in that term.
        if state.role != RoleState::Candidate || state.current_term != election_term {
            return;
        }

        if reply.vote_granted {
            state.votes_received.insert(peer);
        }

        state.votes_received.len() >= node.config.quorum()
    };

    if become_leader {
        become_leader_locked(node).await;
    }
}

/// Candidate -> Leader transition, §4.4. Happens exactly once per term: the
/// `role != Candidate` guard in `handle_vote_reply` (and the state check
/// below) means only the first caller to cross the quorum threshold gets
/// here while still a Candidate.
async fn become_leader_locked(node: &Arc<RaftNode>) {
    {
        let mut state = node.state.lock().await;
        if state.role != RoleState::Candidate {
            return;
        }
        state.role = RoleState::Leader;
        state.leader_id = Some(node.config.node_id);

        let next_index = (state.log.last_index() + 1) as u64;
        let mut leader_state = LeaderState::default();
        for peer in node.config.peer_ids() {
            leader_state.next_index.insert(peer, next_index);
            leader_state.match_index.insert(peer, -1);
        }
        state.leader_state = Some(leader_state);
        info!("Node {} became LEADER for term {}", node.config.node_id, state.current_term);
    }

    super::replication::broadcast_append_entries(node).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, RaftTiming};
    use crate::transport::InProcessTransport;

    fn config(id: PeerId, peers: &[PeerId]) -> ClusterConfig {
        ClusterConfig {
            node_id: id,
            bind_addr: format!("127.0.0.1:{}", 20000 + id).parse().unwrap(),
            peers: peers.iter().map(|&p| (p, format!("127.0.0.1:{}", 20000 + p).parse().unwrap())).collect(),
            timing: RaftTiming { election_timeout_min: std::time::Duration::from_millis(50), election_timeout_max: std::time::Duration::from_millis(80), ..RaftTiming::default() },
        }
    }

    #[tokio::test]
    async fn single_vote_grant_elects_a_lone_candidate() {
        let transport = Arc::new(InProcessTransport::new());
        let node = RaftNode::new(config(1, &[2, 3]), transport);

        let req = RequestVoteRequest { term: 1, candidate_id: 1, last_log_index: -1, last_log_term: 0 };
        let reply = handle_request_vote(&node, 1, req).await;
        assert!(reply.vote_granted);
    }

    #[tokio::test]
    async fn vote_is_refused_for_a_stale_term() {
        let transport = Arc::new(InProcessTransport::new());
        let node = RaftNode::new(config(1, &[2, 3]), transport);
        {
            let mut state = node.state.lock().await;
            state.current_term = 5;
        }

        let req = RequestVoteRequest { term: 3, candidate_id: 2, last_log_index: -1, last_log_term: 0 };
        let reply = handle_request_vote(&node, 2, req).await;
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn a_peer_casts_at_most_one_vote_per_term() {
        let transport = Arc::new(InProcessTransport::new());
        let node = RaftNode::new(config(1, &[2, 3]), transport);

        let first = handle_request_vote(&node, 2, RequestVoteRequest { term: 1, candidate_id: 2, last_log_index: -1, last_log_term: 0 }).await;
        assert!(first.vote_granted);

        let second = handle_request_vote(&node, 3, RequestVoteRequest { term: 1, candidate_id: 3, last_log_index: -1, last_log_term: 0 }).await;
        assert!(!second.vote_granted);
    }
}
