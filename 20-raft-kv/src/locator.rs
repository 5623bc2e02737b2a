//! Leader location cache.
//!
//! The last known leader's [`NodeConfig`] lives in the replicated store under
//! [`CURRENT_LEADER_KEY`]. Only a node that has just observed itself become
//! leader writes it, through the raft log, so every replica eventually holds
//! the same pointer and a restarted node can forward before it hears from a
//! leader. Followers never correct a stale pointer; forwarders treat failure
//! as retryable instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{ApplyResult, Command};
use crate::config::NodeConfig;
use crate::consensus::{Consensus, Role};
use crate::error::{Error, Result};
use crate::store::DurableStore;

pub const CURRENT_LEADER_KEY: &str = "CurrentLeader";

/// Pause between attempts to record leadership after an inconclusive failure.
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Reserved key holding a member's advertised [`NodeConfig`].
pub fn member_key(node_id: u64) -> String {
    format!("member_{node_id}")
}

#[derive(Clone)]
pub struct LeaderLocator<C> {
    consensus: C,
    store: DurableStore,
    config: Arc<NodeConfig>,
    apply_timeout: Duration,
}

impl<C: Consensus> LeaderLocator<C> {
    pub fn new(
        consensus: C,
        store: DurableStore,
        config: Arc<NodeConfig>,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            store,
            config,
            apply_timeout,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    /// Reads the persisted pointer. It may be stale.
    pub fn current_leader(&self) -> Result<Option<NodeConfig>> {
        self.store.get_as(CURRENT_LEADER_KEY)
    }

    /// Replicates the local config as the current leader pointer.
    pub async fn record_self_as_leader(&self) -> Result<ApplyResult> {
        self.publish(CURRENT_LEADER_KEY.to_string()).await
    }

    /// Replicates the local config under `member_<id>`.
    pub async fn record_membership(&self) -> Result<ApplyResult> {
        self.publish(member_key(self.config.raft_node_id)).await
    }

    async fn publish(&self, key: String) -> Result<ApplyResult> {
        let command = Command::Set {
            key,
            value: serde_json::to_value(&*self.config).map_err(Error::Encode)?,
        };
        self.consensus
            .apply(command.encode()?, self.apply_timeout)
            .await
    }

    /// Re-queries the local role and, if leader, records the pointer and the
    /// member record. Returns whether this node was leader.
    pub async fn refresh(&self) -> Result<bool> {
        if self.consensus.state().await? != Role::Leader {
            return Ok(false);
        }
        self.record_self_as_leader().await?;
        self.record_membership().await?;
        Ok(true)
    }

    /// Runs [`refresh`](Self::refresh) after every leadership signal until
    /// `shutdown` is cancelled.
    ///
    /// Subscribes before returning so no signal emitted after this call is
    /// missed. An inconclusive failure (ambiguous timeout, leadership moving
    /// mid-write) is retried until the records land or the node stops
    /// leading; any other failure cancels `fatal`.
    pub fn spawn_watcher(
        &self,
        shutdown: CancellationToken,
        fatal: CancellationToken,
    ) -> JoinHandle<()> {
        let mut signals = self.consensus.observe();
        let locator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = signals.recv() => match signal {
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "coalesced leadership signals");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }

                if !locator.settle(&shutdown, &fatal).await {
                    break;
                }
            }
        })
    }

    /// Refreshes until the records land or this node is no longer leader.
    /// Returns `false` when the watcher must stop.
    async fn settle(&self, shutdown: &CancellationToken, fatal: &CancellationToken) -> bool {
        loop {
            match self.refresh().await {
                Ok(true) => {
                    info!(
                        node_id = self.config.raft_node_id,
                        server_address = %self.config.server_address,
                        "recorded self as current leader"
                    );
                    return true;
                }
                Ok(false) => return true,
                Err(err) if tolerable(&err) => {
                    warn!(error = %err, "could not record leadership, retrying");
                }
                Err(err) => {
                    error!(error = %err, "leader locator failed");
                    fatal.cancel();
                    return false;
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }
}

/// Inconclusive failures: the write may still land, or leadership moved mid-write.
fn tolerable(err: &Error) -> bool {
    err.is_ambiguous() || matches!(err, Error::NotLeader | Error::Commit(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::stub::StubConsensus;
    use crate::fsm::StateMachine;

    fn config(id: u64) -> NodeConfig {
        NodeConfig {
            server_address: format!("127.0.0.1:80{id:02}"),
            join_address: None,
            raft_node_id: id,
            raft_address: format!("127.0.0.1:70{id:02}"),
            volume_dir: format!("/tmp/node{id}").into(),
            peers: vec![],
        }
    }

    fn locator(role: Role) -> (LeaderLocator<StubConsensus>, StubConsensus, DurableStore) {
        let store = DurableStore::temporary().unwrap();
        let consensus = StubConsensus::new(1, role, StateMachine::new(store.clone()));
        let locator = LeaderLocator::new(
            consensus.clone(),
            store.clone(),
            Arc::new(config(1)),
            Duration::from_millis(500),
        );
        (locator, consensus, store)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..50 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn new_leader_records_pointer_and_membership() {
        let (locator, consensus, store) = locator(Role::Follower);
        let shutdown = CancellationToken::new();
        locator.spawn_watcher(shutdown.clone(), CancellationToken::new());

        consensus.set_role(Role::Leader);

        assert!(eventually(|| locator.current_leader().unwrap().is_some()).await);
        assert_eq!(locator.current_leader().unwrap(), Some(config(1)));
        assert!(eventually(|| store.get(&member_key(1)).unwrap().is_some()).await);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn follower_leaves_stale_pointer_alone() {
        let (locator, consensus, store) = locator(Role::Leader);
        store
            .put(CURRENT_LEADER_KEY, &serde_json::to_value(config(2)).unwrap())
            .unwrap();

        consensus.set_role(Role::Follower);
        assert!(!locator.refresh().await.unwrap());

        assert_eq!(locator.current_leader().unwrap(), Some(config(2)));
        assert_eq!(consensus.applies(), 0);
    }

    #[tokio::test]
    async fn missing_pointer_reads_as_none() {
        let (locator, _, _) = locator(Role::Follower);
        assert_eq!(locator.current_leader().unwrap(), None);
    }

    #[tokio::test]
    async fn commit_timeout_is_not_fatal() {
        let (locator, consensus, _) = locator(Role::Follower);
        consensus.stall_applies();
        let shutdown = CancellationToken::new();
        let fatal = CancellationToken::new();
        locator.spawn_watcher(shutdown.clone(), fatal.clone());

        consensus.set_role(Role::Leader);
        assert!(eventually(|| consensus.applies() > 0).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!fatal.is_cancelled());
        assert_eq!(locator.current_leader().unwrap(), None);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn leader_retries_after_commit_timeout() {
        let (locator, consensus, _) = locator(Role::Follower);
        consensus.stall_applies();
        let shutdown = CancellationToken::new();
        let fatal = CancellationToken::new();
        locator.spawn_watcher(shutdown.clone(), fatal.clone());

        consensus.set_role(Role::Leader);
        assert!(eventually(|| consensus.applies() > 0).await);
        consensus.resume_applies();

        assert!(eventually(|| locator.current_leader().unwrap().is_some()).await);
        assert_eq!(locator.current_leader().unwrap(), Some(config(1)));
        assert!(!fatal.is_cancelled());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn retry_stops_once_leadership_is_lost() {
        let (locator, consensus, _) = locator(Role::Follower);
        consensus.stall_applies();
        let shutdown = CancellationToken::new();
        let handle = locator.spawn_watcher(shutdown.clone(), CancellationToken::new());

        consensus.set_role(Role::Leader);
        assert!(eventually(|| consensus.applies() > 0).await);
        consensus.set_role(Role::Follower);
        tokio::time::sleep(RETRY_INTERVAL * 2).await;
        let settled = consensus.applies();
        tokio::time::sleep(RETRY_INTERVAL * 2).await;

        assert_eq!(consensus.applies(), settled);
        assert!(!handle.is_finished());
        shutdown.cancel();
    }
}
