//! The Raft node: role state machine, election timer, heartbeat timer,
//! RPC handlers, and commit-index bookkeeping. This is the core the rest
//! of the crate exists to serve.

mod election;
mod gateway;
mod replication;

pub use gateway::ProposeOutcome;

use crate::config::ClusterConfig;
use crate::fsm::MusicQueue;
use crate::message::{
    AppendEntriesReply, AppendEntriesRequest, ClientReply, ClientRequest, CommandKind, PeerId,
    RequestVoteReply, RequestVoteRequest, Term, Track,
};
use crate::raft_log::Log;
use crate::transport::{PeerEndpoint, PeerTransport};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Follower,
    Candidate,
    Leader,
}

/// Per-follower replication bookkeeping. Exists only while this node is
/// Leader; re-initialized on every Candidate->Leader transition.
#[derive(Debug, Default)]
pub struct LeaderState {
    pub next_index: HashMap<PeerId, u64>,
    pub match_index: HashMap<PeerId, i64>,
}

pub struct RaftState {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
    pub role: RoleState,
    pub leader_id: Option<PeerId>,
    pub votes_received: HashSet<PeerId>,

    pub log: Log,
    pub commit_index: i64,
    pub last_applied: i64,

    pub leader_state: Option<LeaderState>,
    pub fsm: MusicQueue,

    election_deadline: Instant,
    last_heartbeat_sent: Instant,
}

impl RaftState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            current_term: 0,
            voted_for: None,
            role: RoleState::Follower,
            leader_id: None,
            votes_received: HashSet::new(),
            log: Log::new(),
            commit_index: -1,
            last_applied: -1,
            leader_state: None,
            fsm: MusicQueue::new(),
            election_deadline: now,
            last_heartbeat_sent: now,
        }
    }

    /// Transition to Follower. Only adopts `term` (and clears `voted_for`)
    /// if it is strictly greater than ours, per the "currentTerm only ever
    /// grows" invariant; called both when we observe a genuinely higher
    /// term and when an incumbent leader's same-term `AppendEntries`
    /// demotes a Candidate. Resets the election deadline, since §4.4 lists
    /// "transition to Follower" as a reset event in its own right — without
    /// this a Leader or Candidate that steps down keeps its stale deadline
    /// and fires a spurious election on the next timer tick.
    fn step_down(&mut self, term: Term, timing: &crate::config::RaftTiming) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = RoleState::Follower;
        self.leader_state = None;
        self.reset_election_deadline(timing);
    }

    fn reset_election_deadline(&mut self, timing: &crate::config::RaftTiming) {
        let mut rng = rand::thread_rng();
        let millis = rng.gen_range(timing.election_timeout_min.as_millis()..=timing.election_timeout_max.as_millis());
        self.election_deadline = Instant::now() + Duration::from_millis(millis as u64);
    }

    /// Applies every committed-but-unapplied entry to the FSM, strictly in
    /// order.
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let Some(entry) = self.log.entry_at(next) else { break };
            self.fsm.apply(&entry.command);
            self.last_applied = next;
        }
    }
}

pub struct RaftNode {
    pub config: ClusterConfig,
    pub state: Mutex<RaftState>,
    transport: Arc<dyn PeerTransport>,
    commit_notify: Notify,
    stop: AtomicBool,
    self_ref: Weak<RaftNode>,
}

impl RaftNode {
    pub fn new(config: ClusterConfig, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let mut state = RaftState::new();
        state.reset_election_deadline(&config.timing);
        Arc::new_cyclic(|self_ref| Self {
            config,
            state: Mutex::new(state),
            transport,
            commit_notify: Notify::new(),
            stop: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Recovers the `Arc<RaftNode>` wrapping this node from a `&self`
    /// receiver. Needed by `PeerEndpoint::handle_client_request`, which the
    /// trait signature only gives `&self` for, but which must spawn tasks
    /// that outlive the call (via the gateway's replication round).
    fn arc(&self) -> Arc<RaftNode> {
        self.self_ref.upgrade().expect("RaftNode dropped while still in use")
    }

    /// Spawn the background timer task driving both the election and
    /// heartbeat deadlines at a fixed tick, as spec §5 requires. Does not
    /// block; returns immediately.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.timer_loop().await });
    }

    pub fn shut_down(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    async fn timer_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        loop {
            ticker.tick().await;
            if self.stop.load(Ordering::Relaxed) {
                return;
            }

            enum Action {
                None,
                Heartbeat,
                Election,
            }

            let action = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if state.role == RoleState::Leader {
                    if now.duration_since(state.last_heartbeat_sent) >= self.config.timing.heartbeat_interval {
                        state.last_heartbeat_sent = now;
                        Action::Heartbeat
                    } else {
                        Action::None
                    }
                } else if now >= state.election_deadline {
                    Action::Election
                } else {
                    Action::None
                }
            };

            match action {
                Action::Heartbeat => replication::broadcast_append_entries(&self).await,
                Action::Election => election::start_election(&self).await,
                Action::None => {}
            }
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == RoleState::Leader
    }

    pub async fn leader_id(&self) -> Option<PeerId> {
        self.state.lock().await.leader_id
    }

    pub async fn snapshot_queue(&self) -> Vec<Track> {
        self.state.lock().await.fsm.snapshot()
    }

    /// Leader-only: append `command` locally, kick off an immediate
    /// replication round, and block until either it commits or the
    /// client-apply timeout elapses.
    pub async fn propose_and_wait(self: &Arc<Self>, command: CommandKind) -> ProposeOutcome {
        gateway::propose_and_wait(self, command).await
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }
}

#[async_trait]
impl PeerEndpoint for RaftNode {
    async fn handle_request_vote(&self, from: PeerId, req: RequestVoteRequest) -> RequestVoteReply {
        election::handle_request_vote(self, from, req).await
    }

    async fn handle_append_entries(&self, from: PeerId, req: AppendEntriesRequest) -> AppendEntriesReply {
        replication::handle_append_entries(self, from, req).await
    }

    async fn handle_client_request(&self, req: ClientRequest) -> ClientReply {
        gateway::handle_client_request(&self.arc(), req).await
    }
}

/// Candidate up-to-date check (§4.4's `RequestVote` rule 3). Pure so it is
/// unit-testable without a `RaftNode`.
pub(crate) fn candidate_log_is_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: i64,
    our_last_term: Term,
    our_last_index: i64,
) -> bool {
    candidate_last_term > our_last_term
        || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
}

/// Leader-side commit rule (§4.4): advance to the largest N such that a
/// majority of `match_index` (leader included) is `>= N` *and*
/// `log[N].term == current_term`. Entries from prior terms are never
/// committed by count alone — only transitively once an entry of the
/// current term reaches majority. Pure so it is unit-testable.
pub(crate) fn next_commit_index(
    commit_index: i64,
    last_index: i64,
    current_term: Term,
    quorum: usize,
    match_index: &HashMap<PeerId, i64>,
    term_at: impl Fn(i64) -> Option<Term>,
) -> i64 {
    let mut advanced = commit_index;
    for n in (commit_index + 1)..=last_index {
        if term_at(n) != Some(current_term) {
            continue;
        }
        let count = 1 + match_index.values().filter(|&&m| m >= n).count();
        if count >= quorum {
            advanced = n;
        }
    }
    advanced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_candidate_term_is_up_to_date() {
        assert!(candidate_log_is_up_to_date(5, 0, 3, 10));
    }

    #[test]
    fn equal_term_requires_index_at_least_as_large() {
        assert!(candidate_log_is_up_to_date(3, 5, 3, 5));
        assert!(candidate_log_is_up_to_date(3, 6, 3, 5));
        assert!(!candidate_log_is_up_to_date(3, 4, 3, 5));
    }

    #[test]
    fn lower_candidate_term_is_never_up_to_date() {
        assert!(!candidate_log_is_up_to_date(2, 100, 3, 0));
    }

    #[test]
    fn commit_index_advances_with_majority_in_current_term() {
        let mut match_index = HashMap::new();
        match_index.insert(2, 3i64);
        // 2 of 3 nodes (leader + peer 2) have index 3; quorum is 2 -> advances.
        let next = next_commit_index(-1, 3, 1, 2, &match_index, |n| Some(1).filter(|_| n <= 3));
        assert_eq!(next, 3);
    }

    #[test]
    fn commit_index_does_not_advance_for_prior_term_entries() {
        let mut match_index = HashMap::new();
        match_index.insert(2, 5i64);
        match_index.insert(3, 5i64);
        // log[0..=4] are term 1, log[5] is term 2 (the leader's current term).
        let term_at = |n: i64| if n == 5 { Some(2) } else { Some(1) };
        let next = next_commit_index(-1, 5, 2, 3, &match_index, term_at);
        // Majority (3 of 3) have index 5 which is the current term -> commits,
        // and transitively commits the term-1 prefix too.
        assert_eq!(next, 5);
    }

    #[test]
    fn stale_term_entries_are_never_committed_by_count_alone() {
        let mut match_index = HashMap::new();
        match_index.insert(2, 5i64);
        match_index.insert(3, 5i64);
        // Everything including index 5 is from a prior term (current_term is 3,
        // but nothing in the log is from term 3 yet).
        let next = next_commit_index(-1, 5, 3, 3, &match_index, |_| Some(1));
        assert_eq!(next, -1);
    }
}
