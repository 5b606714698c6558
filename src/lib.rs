//! Consensus-replicated coordination node.
//!
//! Maintains a linearizable log of state-mutating actions across a small
//! group of manager replicas. Each replica drives a raft engine through a
//! single event loop, persists the log and periodic snapshots, and applies
//! committed entries to a shared in-memory store.

pub mod config;
pub mod error;
pub mod metrics;
pub mod raft;
pub mod rpc;
pub mod store;
pub mod transport;

pub use error::Error;
pub use raft::{LeadershipState, Node, NodeOptions};
pub use store::{MemoryStore, Proposer, StoreAction};
