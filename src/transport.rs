//! Peer transport: one gRPC client per remote member.
//!
//! Connections are opened lazily and re-dialed indefinitely, so a peer that
//! is temporarily unreachable does not fail registration. Each send carries
//! a hard deadline; the consensus engine owns retries.

use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tonic::transport::{Channel, Endpoint};

use crate::error::Result;
use crate::rpc::pb;
use crate::rpc::pb::raft_client::RaftClient;

const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport handle to one peer. Cheap to clone; the underlying channel is
/// shared and closes when the last clone is dropped.
#[derive(Clone)]
pub struct PeerClient {
    client: RaftClient<Channel>,
}

impl PeerClient {
    /// Opens a lazily-connected channel to `addr`.
    pub fn connect(addr: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))?;
        let channel = endpoint.connect_lazy();
        Ok(PeerClient {
            client: RaftClient::new(channel),
        })
    }

    /// Delivers one consensus message, failing after the send deadline.
    pub async fn process_raft_message(&self, msg: &Message) -> Result<()> {
        let request = pb::ProcessRaftMessageRequest {
            message: msg.write_to_bytes()?,
        };
        let mut client = self.client.clone();
        match tokio::time::timeout(SEND_TIMEOUT, client.process_raft_message(request)).await {
            Ok(response) => {
                response?;
                Ok(())
            }
            Err(_) => Err(tonic::Status::deadline_exceeded("raft message send timed out").into()),
        }
    }

    /// Asks the remote member to admit `node`, returning the member list.
    pub async fn join(&self, node: pb::RaftMember) -> Result<Vec<pb::RaftMember>> {
        let mut client = self.client.clone();
        let response = client
            .join(pb::JoinRequest { node: Some(node) })
            .await?
            .into_inner();
        Ok(response.members)
    }

    /// Asks the remote member to remove `node` from the cluster.
    pub async fn leave(&self, node: pb::RaftMember) -> Result<()> {
        let mut client = self.client.clone();
        client.leave(pb::LeaveRequest { node: Some(node) }).await?;
        Ok(())
    }
}
