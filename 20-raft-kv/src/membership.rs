//! Cluster membership: bootstrap, join, remove and leave.
//!
//! A node takes exactly one path at startup. Without seeds it bootstraps a
//! single-member cluster. With seeds it runs a join loop that cycles through
//! them at a fixed interval until one (the leader) accepts. The current
//! [`MembershipState`] is published on a `watch` channel so other components
//! can wait for the node to become a member.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{NodeConfig, NodeOptions};
use crate::consensus::{Consensus, RaftStats, Role, Server};
use crate::error::{Error, Result};
use crate::forward::{ForwardRequest, Forwarder};
use crate::locator::member_key;
use crate::router::{Hop, Routed, WriteRouter};
use crate::transfer::pass_leadership;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MembershipState {
    Unbootstrapped,
    /// Founded a new cluster as its sole voter.
    Bootstrapped,
    Joining,
    Joined,
}

impl MembershipState {
    pub fn is_member(self) -> bool {
        matches!(self, MembershipState::Bootstrapped | MembershipState::Joined)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub node_id: u64,
    pub raft_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveRequest {
    pub node_id: u64,
}

/// How long `leave` waits for a successor to record itself after handing
/// off leadership.
const SUCCESSOR_WAIT: Duration = Duration::from_secs(5);
const SUCCESSOR_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct MembershipCoordinator<C> {
    router: WriteRouter<C>,
    forwarder: Forwarder,
    config: Arc<NodeConfig>,
    join_interval: Duration,
    max_join_attempts: Option<u32>,
    state: Arc<watch::Sender<MembershipState>>,
}

impl<C: Consensus> MembershipCoordinator<C> {
    pub fn new(
        router: WriteRouter<C>,
        forwarder: Forwarder,
        config: Arc<NodeConfig>,
        options: &NodeOptions,
    ) -> Self {
        let (state, _) = watch::channel(MembershipState::Unbootstrapped);
        Self {
            router,
            forwarder,
            config,
            join_interval: options.join_interval,
            max_join_attempts: options.max_join_attempts,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> MembershipState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MembershipState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: MembershipState) {
        self.state.send_replace(state);
    }

    fn consensus(&self) -> &C {
        self.router.consensus()
    }

    fn local_server(&self) -> Server {
        Server {
            node_id: self.config.raft_node_id,
            raft_address: self.config.raft_address.clone(),
        }
    }

    /// Forms a new cluster whose only voter is this node.
    pub async fn bootstrap(&self) -> Result<()> {
        self.consensus().bootstrap(self.local_server()).await?;
        self.set_state(MembershipState::Bootstrapped);
        info!(node_id = self.config.raft_node_id, "bootstrapped new cluster");
        Ok(())
    }

    /// Adds the requesting node as a voter. Only succeeds on the leader.
    pub async fn handle_join(&self, request: JoinRequest) -> Result<RaftStats> {
        if request.node_id == 0 || request.raft_address.trim().is_empty() {
            return Err(Error::InvalidInput(
                "nodeId and raftAddress are required".into(),
            ));
        }
        self.consensus()
            .add_voter(Server {
                node_id: request.node_id,
                raft_address: request.raft_address.clone(),
            })
            .await?;
        info!(
            node_id = request.node_id,
            raft_address = %request.raft_address,
            "node joined"
        );
        self.consensus().stats().await
    }

    /// Removes a voter. Only succeeds on the leader; not retried.
    pub async fn handle_remove(&self, request: RemoveRequest) -> Result<()> {
        if request.node_id == 0 {
            return Err(Error::InvalidInput("nodeId is required".into()));
        }
        self.consensus().remove_server(request.node_id).await?;
        info!(node_id = request.node_id, "node removed");
        Ok(())
    }

    /// Asks seeds to add this node until one accepts.
    ///
    /// Seeds are tried in order, one attempt per interval, wrapping around.
    /// Returns `Ok(false)` if `shutdown` fires first, and a membership error
    /// once `max_join_attempts` (if set) is exhausted.
    pub async fn retry_join(&self, shutdown: &CancellationToken) -> Result<bool> {
        let seeds = self.config.seeds();
        if seeds.is_empty() {
            return Err(Error::Membership("no seed to join through".into()));
        }
        self.set_state(MembershipState::Joining);

        let body = serde_json::to_value(JoinRequest {
            node_id: self.config.raft_node_id,
            raft_address: self.config.raft_address.clone(),
        })
        .map_err(Error::Encode)?;
        let request = ForwardRequest::post(&["raft", "join"], body);

        let mut attempts: u32 = 0;
        loop {
            let seed = &seeds[attempts as usize % seeds.len()];
            attempts += 1;
            match self.forwarder.call(seed, &request).await {
                Ok(response) if response.status == 200 => {
                    self.set_state(MembershipState::Joined);
                    info!(seed = %seed, attempts, "joined cluster");
                    return Ok(true);
                }
                Ok(response) => {
                    warn!(
                        seed = %seed,
                        attempts,
                        status = response.status,
                        body = %response.body,
                        "join refused"
                    );
                }
                Err(err) => warn!(seed = %seed, attempts, error = %err, "join attempt failed"),
            }

            if self.max_join_attempts.is_some_and(|max| attempts >= max) {
                return Err(Error::Membership(format!(
                    "gave up joining after {attempts} attempts"
                )));
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.join_interval) => {}
            }
        }
    }

    /// Writes this node's `member_<id>` record through the leader, retrying at
    /// the join interval until it lands or `shutdown` fires.
    pub async fn register_member(&self, shutdown: &CancellationToken) -> Result<bool> {
        let key = member_key(self.config.raft_node_id);
        let value = serde_json::to_value(&*self.config).map_err(Error::Encode)?;
        loop {
            match self.router.store(&key, value.clone(), Hop::Origin).await {
                Ok(Routed::Local(_)) => return Ok(true),
                Ok(Routed::Forwarded(response)) if response.status == 200 => return Ok(true),
                Ok(Routed::Forwarded(response)) => {
                    warn!(
                        status = response.status,
                        body = %response.body,
                        "leader refused member record"
                    );
                }
                Err(err) => warn!(error = %err, "could not register member record yet"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.join_interval) => {}
            }
        }
    }

    /// Takes the configured startup path, then registers the member record.
    ///
    /// A failed bootstrap or an exhausted join loop cancels `fatal`: the node
    /// cannot serve without knowing its membership.
    pub fn start(&self, shutdown: CancellationToken, fatal: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let joined = if coordinator.config.bootstraps() {
                coordinator.bootstrap().await.map(|()| true)
            } else {
                coordinator.retry_join(&shutdown).await
            };
            match joined {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    error!(error = %err, "could not become a cluster member");
                    fatal.cancel();
                    return;
                }
            }
            if let Err(err) = coordinator.register_member(&shutdown).await {
                error!(error = %err, "could not register member record");
                fatal.cancel();
            }
        })
    }

    /// Removes this node from the voting configuration.
    ///
    /// A leader first hands leadership off and waits for its successor to
    /// record itself, since a leader cannot remove itself.
    pub async fn leave(&self) -> Result<Routed<()>> {
        let id = self.config.raft_node_id;
        if self.consensus().state().await? == Role::Leader {
            match pass_leadership(&self.router, Hop::Origin).await? {
                Routed::Local(()) => self.await_successor().await?,
                Routed::Forwarded(response) => return Ok(Routed::Forwarded(response)),
            }
        }
        let request = ForwardRequest::post(&["raft", "remove"], json!({ "nodeId": id }));
        let routed = self
            .router
            .execute_or_forward(request, Hop::Origin, || self.consensus().remove_server(id))
            .await?;
        let accepted = match &routed {
            Routed::Local(()) => true,
            Routed::Forwarded(response) => response.status == 200,
        };
        if accepted {
            self.set_state(MembershipState::Unbootstrapped);
            info!(node_id = id, "left cluster");
        }
        Ok(routed)
    }

    async fn await_successor(&self) -> Result<()> {
        let id = self.config.raft_node_id;
        let wait = async {
            loop {
                if let Some(leader) = self.router.locator().current_leader()? {
                    if leader.raft_node_id != id {
                        return Ok(());
                    }
                }
                tokio::time::sleep(SUCCESSOR_POLL).await;
            }
        };
        tokio::time::timeout(SUCCESSOR_WAIT, wait)
            .await
            .map_err(|_| Error::Transfer("no successor recorded itself as leader".into()))?
    }

    /// Resolves once the node is a member; `false` if `shutdown` fired first.
    pub async fn wait_until_member(&self, shutdown: &CancellationToken) -> bool {
        let mut state = self.subscribe();
        tokio::select! {
            changed = state.wait_for(|s| s.is_member()) => changed.is_ok(),
            _ = shutdown.cancelled() => false,
        }
    }
}
