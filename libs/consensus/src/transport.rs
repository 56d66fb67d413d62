//! Network transport for Raft RPCs
//!
//! The consensus engine never opens a socket itself; it talks to peers
//! through the `RaftTransport` trait and accepts inbound RPCs through
//! `RaftRpcHandler`, which keeps the replication/election logic testable
//! without a real network.

use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

pub mod proto {
    tonic::include_proto!("kvraft.raft");
}

/// Rejects an advertise address whose host is unspecified (`0.0.0.0`, `::`)
/// -- such an address can never be dialed by a peer, so treating it as a
/// fatal startup error here is cheaper than debugging a cluster that can
/// never replicate.
pub fn validate_advertise_addr(addr: &str) -> Result<()> {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_unspecified() {
            return Err(RaftError::Internal(format!(
                "advertise address '{addr}' is unspecified and cannot be dialed by peers"
            )));
        }
    }
    Ok(())
}

fn entry_to_bytes(entry: &Entry) -> Result<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| RaftError::Internal(e.to_string()))
}

fn bytes_to_entry(bytes: &[u8]) -> Result<Entry> {
    bincode::deserialize(bytes).map_err(|e| RaftError::Internal(e.to_string()))
}

fn to_proto_append(req: &AppendEntriesRequest) -> Result<proto::AppendEntriesRequest> {
    let entries = req
        .entries
        .iter()
        .map(entry_to_bytes)
        .collect::<Result<Vec<_>>>()?;

    Ok(proto::AppendEntriesRequest {
        term: req.term.0,
        leader_id: req.leader_id.0,
        prev_log_index: req.prev_log_index.0,
        prev_log_term: req.prev_log_term.0,
        entries,
        leader_commit: req.leader_commit.0,
    })
}

fn from_proto_append(req: proto::AppendEntriesRequest) -> Result<AppendEntriesRequest> {
    let entries = req
        .entries
        .iter()
        .map(|b| bytes_to_entry(b))
        .collect::<Result<Vec<_>>>()?;

    Ok(AppendEntriesRequest {
        term: Term(req.term),
        leader_id: NodeId(req.leader_id),
        prev_log_index: LogIndex(req.prev_log_index),
        prev_log_term: Term(req.prev_log_term),
        entries,
        leader_commit: LogIndex(req.leader_commit),
    })
}

fn to_proto_append_resp(resp: &AppendEntriesResponse) -> proto::AppendEntriesResponse {
    proto::AppendEntriesResponse {
        term: resp.term.0,
        success: resp.success,
        match_index: resp.match_index.map(|i| i.0),
        commit_index: resp.commit_index.0,
    }
}

fn from_proto_append_resp(resp: proto::AppendEntriesResponse) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term: Term(resp.term),
        success: resp.success,
        match_index: resp.match_index.map(LogIndex),
        commit_index: LogIndex(resp.commit_index),
    }
}

fn to_proto_vote(req: &RequestVoteRequest) -> proto::RequestVoteRequest {
    proto::RequestVoteRequest {
        term: req.term.0,
        candidate_id: req.candidate_id.0,
        last_log_index: req.last_log_index.0,
        last_log_term: req.last_log_term.0,
    }
}

fn from_proto_vote(req: proto::RequestVoteRequest) -> RequestVoteRequest {
    RequestVoteRequest {
        term: Term(req.term),
        candidate_id: NodeId(req.candidate_id),
        last_log_index: LogIndex(req.last_log_index),
        last_log_term: Term(req.last_log_term),
    }
}

fn to_proto_vote_resp(resp: &RequestVoteResponse) -> proto::RequestVoteResponse {
    proto::RequestVoteResponse {
        term: resp.term.0,
        vote_granted: resp.vote_granted,
    }
}

fn from_proto_vote_resp(resp: proto::RequestVoteResponse) -> RequestVoteResponse {
    RequestVoteResponse {
        term: Term(resp.term),
        vote_granted: resp.vote_granted,
    }
}

fn to_proto_snapshot(req: &InstallSnapshotRequest) -> proto::InstallSnapshotRequest {
    proto::InstallSnapshotRequest {
        term: req.term.0,
        leader_id: req.leader_id.0,
        last_included_index: req.last_included_index.0,
        last_included_term: req.last_included_term.0,
        offset: req.offset,
        data: req.data.clone(),
        done: req.done,
    }
}

fn from_proto_snapshot(req: proto::InstallSnapshotRequest) -> InstallSnapshotRequest {
    InstallSnapshotRequest {
        term: Term(req.term),
        leader_id: NodeId(req.leader_id),
        last_included_index: LogIndex(req.last_included_index),
        last_included_term: Term(req.last_included_term),
        offset: req.offset,
        data: req.data,
        done: req.done,
    }
}

fn to_proto_snapshot_resp(resp: &InstallSnapshotResponse) -> proto::InstallSnapshotResponse {
    proto::InstallSnapshotResponse { term: resp.term.0 }
}

fn from_proto_snapshot_resp(resp: proto::InstallSnapshotResponse) -> InstallSnapshotResponse {
    InstallSnapshotResponse {
        term: Term(resp.term),
    }
}

/// Outbound side of the dedicated Raft transport: how a node calls its peers.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        peer_addr: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        peer_addr: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        peer_addr: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// Inbound side: anything that can answer the three Raft RPCs. `RaftNode`
/// implements this; the gRPC service below just forwards to it.
#[async_trait]
pub trait RaftRpcHandler: Send + Sync {
    async fn request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse;
    async fn append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse;
    async fn install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse;
}

/// `RaftTransport` over gRPC, using a lazily-connected channel per peer.
///
/// Channels are cached so the replication loop doesn't pay a connection
/// setup cost on every heartbeat.
pub struct TonicRaftTransport {
    channels: RwLock<HashMap<String, tonic::transport::Channel>>,
}

impl TonicRaftTransport {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn channel_for(&self, peer_addr: &str) -> Result<tonic::transport::Channel> {
        if let Some(ch) = self.channels.read().get(peer_addr) {
            return Ok(ch.clone());
        }

        let endpoint = tonic::transport::Endpoint::from_shared(format!("http://{peer_addr}"))
            .map_err(|e| RaftError::Rpc(e.to_string()))?;
        let channel = endpoint.connect_lazy();
        self.channels
            .write()
            .insert(peer_addr.to_string(), channel.clone());
        Ok(channel)
    }
}

impl Default for TonicRaftTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaftTransport for TonicRaftTransport {
    async fn request_vote(
        &self,
        peer_addr: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let channel = self.channel_for(peer_addr)?;
        let mut client = proto::raft_rpc_client::RaftRpcClient::new(channel);
        let resp = client
            .request_vote(to_proto_vote(&request))
            .await
            .map_err(|e| RaftError::Rpc(e.to_string()))?;
        Ok(from_proto_vote_resp(resp.into_inner()))
    }

    async fn append_entries(
        &self,
        peer_addr: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let channel = self.channel_for(peer_addr)?;
        let mut client = proto::raft_rpc_client::RaftRpcClient::new(channel);
        let proto_req = to_proto_append(&request)?;
        let resp = client
            .append_entries(proto_req)
            .await
            .map_err(|e| RaftError::Rpc(e.to_string()))?;
        Ok(from_proto_append_resp(resp.into_inner()))
    }

    async fn install_snapshot(
        &self,
        peer_addr: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let channel = self.channel_for(peer_addr)?;
        let mut client = proto::raft_rpc_client::RaftRpcClient::new(channel);
        let resp = client
            .install_snapshot(to_proto_snapshot(&request))
            .await
            .map_err(|e| RaftError::Rpc(e.to_string()))?;
        Ok(from_proto_snapshot_resp(resp.into_inner()))
    }
}

/// Adapts any `RaftRpcHandler` to the generated tonic service.
pub struct GrpcServer<H> {
    handler: Arc<H>,
}

impl<H> GrpcServer<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl<H: RaftRpcHandler + 'static> proto::raft_rpc_server::RaftRpc for GrpcServer<H> {
    async fn request_vote(
        &self,
        request: tonic::Request<proto::RequestVoteRequest>,
    ) -> std::result::Result<tonic::Response<proto::RequestVoteResponse>, tonic::Status> {
        let req = from_proto_vote(request.into_inner());
        let resp = self.handler.request_vote(req).await;
        Ok(tonic::Response::new(to_proto_vote_resp(&resp)))
    }

    async fn append_entries(
        &self,
        request: tonic::Request<proto::AppendEntriesRequest>,
    ) -> std::result::Result<tonic::Response<proto::AppendEntriesResponse>, tonic::Status> {
        let req = from_proto_append(request.into_inner())
            .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?;
        let resp = self.handler.append_entries(req).await;
        Ok(tonic::Response::new(to_proto_append_resp(&resp)))
    }

    async fn install_snapshot(
        &self,
        request: tonic::Request<proto::InstallSnapshotRequest>,
    ) -> std::result::Result<tonic::Response<proto::InstallSnapshotResponse>, tonic::Status> {
        let req = from_proto_snapshot(request.into_inner());
        let resp = self.handler.install_snapshot(req).await;
        Ok(tonic::Response::new(to_proto_snapshot_resp(&resp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unspecified_advertise_addr() {
        assert!(validate_advertise_addr("0.0.0.0:9000").is_err());
        assert!(validate_advertise_addr("[::]:9000").is_err());
        assert!(validate_advertise_addr("127.0.0.1:9000").is_ok());
        assert!(validate_advertise_addr("node-2.internal:9000").is_ok());
    }

    #[test]
    fn test_entry_roundtrip_through_bytes() {
        let entry = Entry::new_command(Term(4), LogIndex(9), b"payload".to_vec());
        let bytes = entry_to_bytes(&entry).unwrap();
        let back = bytes_to_entry(&bytes).unwrap();
        assert_eq!(back.term, entry.term);
        assert_eq!(back.index, entry.index);
        assert_eq!(back.as_command(), entry.as_command());
    }
}
