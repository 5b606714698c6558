//! Error types surfaced by the coordination node.

use thiserror::Error;

/// Errors returned by the node, its proposal path and its durable storage.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration-change proposal was refused by the consensus engine.
    #[error("propose configuration change refused")]
    ConfChangeRefused,

    /// A proposal carried nothing to apply.
    #[error("proposal does not specify anything to apply")]
    ApplyNotSpecified,

    /// Failed to append entries to the consensus log store.
    #[error("failed to append entry to logs")]
    AppendEntry,

    /// Failed to persist the consensus hard state.
    #[error("failed to set the hard state for log append entry")]
    SetHardState,

    /// Failed to persist or apply a snapshot.
    #[error("failed to apply snapshot on node")]
    ApplySnapshot,

    /// The node was stopped while the request was in flight.
    #[error("failed to process the request: node is stopped")]
    Stopped,

    /// The node lost leadership before the request committed.
    #[error("failed to process the request: node lost leader status")]
    LostLeadership,

    /// The encoded proposal exceeds the message ceiling.
    #[error("raft message is too large and can't be sent")]
    RequestTooLarge,

    /// A node with this ID is already a cluster member.
    #[error("can't add node to cluster, node id is a duplicate")]
    IdExists,

    /// The ID was removed from the cluster during its lifetime.
    #[error("can't add node to cluster, node was removed during cluster lifetime")]
    IdRemoved,

    /// No member with this ID exists in the cluster list.
    #[error("member not found in cluster list")]
    IdNotFound,

    #[error(transparent)]
    Raft(#[from] raft::Error),

    #[error(transparent)]
    Wal(#[from] crate::raft::wal::WalError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("protobuf error: {0}")]
    Protobuf(#[from] protobuf::ProtobufError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
}

pub type Result<T> = std::result::Result<T, Error>;
