//! Node identity, peer map, and tunables. Parsed once from the environment
//! at startup into an explicit record — never re-read from a process-wide
//! singleton deeper in the call stack.

use crate::message::PeerId;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RaftTiming {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub rpc_timeout: Duration,
    pub client_apply_timeout: Duration,
}

impl Default for RaftTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(300),
            election_timeout_min: Duration::from_millis(1500),
            election_timeout_max: Duration::from_millis(3000),
            rpc_timeout: Duration::from_millis(750),
            client_apply_timeout: Duration::from_secs(5),
        }
    }
}

impl RaftTiming {
    fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            bail!(
                "ELECTION_TIMEOUT_MIN ({:?}) must be less than ELECTION_TIMEOUT_MAX ({:?})",
                self.election_timeout_min,
                self.election_timeout_max
            );
        }
        if self.heartbeat_interval.is_zero()
            || self.rpc_timeout.is_zero()
            || self.client_apply_timeout.is_zero()
        {
            bail!("timing values must all be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: PeerId,
    pub bind_addr: SocketAddr,
    pub peers: HashMap<PeerId, SocketAddr>,
    pub timing: RaftTiming,
}

impl ClusterConfig {
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    /// Reads `NODE_ID` and `PEERS` (and the optional timing overrides) from
    /// the process environment. `PEERS` is a comma-separated
    /// `id=host:port` list excluding `self`; the node's own bind address is
    /// looked up in that same list by its own id (so `PEERS` fully
    /// describes the cluster, self included).
    pub fn from_env() -> Result<Self> {
        let node_id: PeerId = std::env::var("NODE_ID")
            .context("NODE_ID must be set")?
            .parse()
            .context("NODE_ID must be an integer")?;

        let peers_raw = std::env::var("PEERS").unwrap_or_default();
        let mut all_addrs: HashMap<PeerId, SocketAddr> = HashMap::new();
        for entry in peers_raw.split(',').filter(|s| !s.trim().is_empty()) {
            let (id_str, addr_str) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed PEERS entry: {entry:?}"))?;
            let id: PeerId = id_str.trim().parse().context("peer id must be an integer")?;
            let addr: SocketAddr = addr_str
                .trim()
                .parse()
                .with_context(|| format!("invalid address for peer {id}"))?;
            all_addrs.insert(id, addr);
        }

        let bind_addr = *all_addrs
            .get(&node_id)
            .ok_or_else(|| anyhow!("NODE_ID {node_id} not present in PEERS"))?;
        all_addrs.remove(&node_id);

        let mut timing = RaftTiming::default();
        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL") {
            timing.heartbeat_interval = parse_secs(&v)?;
        }
        if let Ok(v) = std::env::var("ELECTION_TIMEOUT_MIN") {
            timing.election_timeout_min = parse_secs(&v)?;
        }
        if let Ok(v) = std::env::var("ELECTION_TIMEOUT_MAX") {
            timing.election_timeout_max = parse_secs(&v)?;
        }
        if let Ok(v) = std::env::var("RPC_TIMEOUT") {
            timing.rpc_timeout = parse_secs(&v)?;
        }
        if let Ok(v) = std::env::var("CLIENT_APPLY_TIMEOUT") {
            timing.client_apply_timeout = parse_secs(&v)?;
        }
        timing.validate()?;

        Ok(Self { node_id, bind_addr, peers: all_addrs, timing })
    }
}

fn parse_secs(raw: &str) -> Result<Duration> {
    let secs: f64 = raw.parse().context("tunable must be a number of seconds")?;
    if secs <= 0.0 {
        bail!("tunable must be positive, got {secs}");
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_of_three_is_two() {
        let cfg = ClusterConfig {
            node_id: 1,
            bind_addr: "127.0.0.1:9001".parse().unwrap(),
            peers: [(2, "127.0.0.1:9002".parse().unwrap()), (3, "127.0.0.1:9003".parse().unwrap())]
                .into_iter()
                .collect(),
            timing: RaftTiming::default(),
        };
        assert_eq!(cfg.quorum(), 2);
    }

    #[test]
    fn quorum_of_five_is_three() {
        let cfg = ClusterConfig {
            node_id: 1,
            bind_addr: "127.0.0.1:9001".parse().unwrap(),
            peers: (2..=5).map(|id| (id, format!("127.0.0.1:{}", 9000 + id).parse().unwrap())).collect(),
            timing: RaftTiming::default(),
        };
        assert_eq!(cfg.quorum(), 3);
    }

    #[test]
    fn timing_rejects_inverted_election_bounds() {
        let mut timing = RaftTiming::default();
        timing.election_timeout_min = Duration::from_secs(3);
        timing.election_timeout_max = Duration::from_secs(1);
        assert!(timing.validate().is_err());
    }
}
