use anyhow::{Context, Result};
use log::{error, info};
use queue_raft::config::ClusterConfig;
use queue_raft::raft::RaftNode;
use queue_raft::transport::{serve_connection, TcpPeerTransport};
use socket2::{Domain, Socket, Type};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = ClusterConfig::from_env().context("loading cluster config")?;
    info!("Node {} starting, bind_addr={}, peers={:?}", config.node_id, config.bind_addr, config.peers);

    let transport = Arc::new(TcpPeerTransport::new(&config.peers, config.timing.rpc_timeout));
    let bind_addr = config.bind_addr;
    let node = RaftNode::new(config, transport);
    node.start();

    let listener = bind_with_reuse_addr(bind_addr)?;
    info!("Node {} listening on {}", node.config.node_id, bind_addr);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };
        info!("accepted connection from {}", peer_addr);
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            serve_connection(stream, node).await;
        });
    }
}

/// Binds with `SO_REUSEADDR` so restarting a node immediately after a crash
/// doesn't fail with "address already in use" while the old socket is
/// still draining in TIME_WAIT.
fn bind_with_reuse_addr(addr: std::net::SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None).context("creating listener socket")?;
    socket.set_reuse_address(true).context("setting SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("setting listener non-blocking")?;
    socket.bind(&addr.into()).with_context(|| format!("binding to {addr}"))?;
    socket.listen(1024).context("listen")?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).context("wrapping listener for tokio")
}
