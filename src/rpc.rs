//! gRPC surface: membership changes and raft message delivery.

use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tonic::{Request, Response, Status};

use crate::error::Error;
use crate::raft::Node;

use pb::raft_server::Raft;
pub use pb::raft_server::RaftServer;

/// Generated protocol types for the cluster service.
pub mod pb {
    tonic::include_proto!("cluster");
}

pub struct RaftService {
    node: Arc<Node>,
}

impl RaftService {
    pub fn new(node: Arc<Node>) -> Self {
        RaftService { node }
    }
}

fn to_status(err: Error) -> Status {
    match err {
        Error::IdRemoved | Error::IdExists | Error::ConfChangeRefused => {
            Status::failed_precondition(err.to_string())
        }
        Error::IdNotFound => Status::not_found(err.to_string()),
        Error::Stopped | Error::LostLeadership => Status::unavailable(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl Raft for RaftService {
    async fn join(
        &self,
        request: Request<pb::JoinRequest>,
    ) -> Result<Response<pb::JoinResponse>, Status> {
        let node = request
            .into_inner()
            .node
            .ok_or_else(|| Status::invalid_argument("join request carries no node"))?;
        log::info!("node {} requesting to join from {}", node.id, node.addr);

        let members = self
            .node
            .join(node.id, node.addr)
            .await
            .map_err(to_status)?;
        Ok(Response::new(pb::JoinResponse { members }))
    }

    async fn leave(
        &self,
        request: Request<pb::LeaveRequest>,
    ) -> Result<Response<pb::LeaveResponse>, Status> {
        let node = request
            .into_inner()
            .node
            .ok_or_else(|| Status::invalid_argument("leave request carries no node"))?;
        log::info!("node {} requesting to leave", node.id);

        self.node.leave(node.id).await.map_err(to_status)?;
        Ok(Response::new(pb::LeaveResponse {}))
    }

    async fn process_raft_message(
        &self,
        request: Request<pb::ProcessRaftMessageRequest>,
    ) -> Result<Response<pb::ProcessRaftMessageResponse>, Status> {
        let message = Message::parse_from_bytes(&request.into_inner().message)
            .map_err(|err| Status::invalid_argument(format!("bad raft message: {}", err)))?;

        self.node.process_raft_message(message).map_err(to_status)?;
        Ok(Response::new(pb::ProcessRaftMessageResponse {}))
    }
}
