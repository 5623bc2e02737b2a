//! The consensus substrate as seen by the coordination layer.
//!
//! Leader election, log replication and snapshot transport live behind
//! [`Consensus`]. The production implementation is
//! [`RaftHandle`](crate::runtime::RaftHandle); unit tests use an in-process
//! stub. All operations are safe to call concurrently from request handlers.

use std::future::Future;
use std::time::Duration;

use raft::StateRole;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::command::ApplyResult;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl From<StateRole> for Role {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Follower => Role::Follower,
            StateRole::PreCandidate => Role::PreCandidate,
            StateRole::Candidate => Role::Candidate,
            StateRole::Leader => Role::Leader,
        }
    }
}

/// A voting member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub node_id: u64,
    pub raft_address: String,
}

/// Point-in-time status of the local raft instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStats {
    pub node_id: u64,
    pub state: Role,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_snapshot_index: u64,
    pub num_peers: usize,
    pub latest_configuration: Vec<Server>,
}

/// "This node's view of leadership may have changed."
///
/// Carries no payload: observers re-query [`Consensus::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadershipChanged;

pub trait Consensus: Clone + Send + Sync + 'static {
    /// Submits an opaque command and waits until this node has applied it.
    fn apply(
        &self,
        command: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<ApplyResult>> + Send;

    fn state(&self) -> impl Future<Output = Result<Role>> + Send;

    fn leader(&self) -> impl Future<Output = Result<Option<Server>>> + Send;

    fn configuration(&self) -> impl Future<Output = Result<Vec<Server>>> + Send;

    /// Initializes a brand-new cluster whose only voter is `server`.
    fn bootstrap(&self, server: Server) -> impl Future<Output = Result<()>> + Send;

    fn add_voter(&self, server: Server) -> impl Future<Output = Result<()>> + Send;

    fn remove_server(&self, node_id: u64) -> impl Future<Output = Result<()>> + Send;

    /// Hands leadership to another voter. Only valid on the leader.
    fn leadership_transfer(&self) -> impl Future<Output = Result<()>> + Send;

    fn stats(&self) -> impl Future<Output = Result<RaftStats>> + Send;

    /// Subscribes to leadership-change signals.
    fn observe(&self) -> broadcast::Receiver<LeadershipChanged>;
}
