pub mod config;
pub mod fsm;
pub mod message;
pub mod raft;
pub mod raft_log;
pub mod transport;
