//! Leader-or-forward execution of writes.
//!
//! Every operation that must run on the leader goes through
//! [`WriteRouter::execute_or_forward`]: the role is queried fresh on each
//! call, the leader runs the operation locally, any other node makes one
//! bounded forward to the address in the [`LeaderLocator`]. Store, delete,
//! leadership transfer and member removal all share this path, so they share
//! one timeout and retry policy.

use std::future::Future;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use crate::command::{ApplyResult, Command};
use crate::consensus::{Consensus, Role};
use crate::error::{Error, Result};
use crate::forward::{ForwardRequest, ForwardedResponse, Forwarder};
use crate::locator::LeaderLocator;
use crate::store::StoredRecord;

/// Whether the request reached this node directly or from another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    Origin,
    /// Already forwarded once; must not be forwarded again.
    Forwarded,
}

/// Where an operation ran.
#[derive(Debug)]
pub enum Routed<T> {
    Local(T),
    Forwarded(ForwardedResponse),
}

#[derive(Clone)]
pub struct WriteRouter<C> {
    consensus: C,
    locator: LeaderLocator<C>,
    forwarder: Forwarder,
    apply_timeout: Duration,
}

impl<C: Consensus> WriteRouter<C> {
    pub fn new(
        consensus: C,
        locator: LeaderLocator<C>,
        forwarder: Forwarder,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            consensus,
            locator,
            forwarder,
            apply_timeout,
        }
    }

    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    pub fn locator(&self) -> &LeaderLocator<C> {
        &self.locator
    }

    /// Runs `local` if this node is leader, otherwise forwards `request` to the
    /// recorded leader.
    ///
    /// A forwarded hop that lands on a non-leader fails with
    /// [`Error::NotLeader`] rather than travelling further. A missing pointer,
    /// or one naming this very node, is [`Error::NoKnownLeader`].
    pub async fn execute_or_forward<T, F, Fut>(
        &self,
        request: ForwardRequest,
        hop: Hop,
        local: F,
    ) -> Result<Routed<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.consensus.state().await? == Role::Leader {
            return local().await.map(Routed::Local);
        }
        if hop == Hop::Forwarded {
            return Err(Error::NotLeader);
        }

        let leader = self
            .locator
            .current_leader()?
            .ok_or_else(|| Error::NoKnownLeader("no leader has been recorded yet".into()))?;
        if leader.raft_node_id == self.locator.config().raft_node_id {
            return Err(Error::NoKnownLeader(
                "recorded leader is this node, which is no longer leader".into(),
            ));
        }

        debug!(
            leader = leader.raft_node_id,
            address = %leader.server_address,
            "not leader, forwarding"
        );
        let response = self
            .forwarder
            .send(&leader.server_address, &request)
            .await?;
        Ok(Routed::Forwarded(response))
    }

    /// Writes `value` under `key` through the leader.
    pub async fn store(&self, key: &str, value: Value, hop: Hop) -> Result<Routed<ApplyResult>> {
        let key = validate_key(key)?;
        let request = ForwardRequest::post(&["store"], json!({ "key": key, "value": value }));
        let command = Command::Set {
            key: key.to_string(),
            value,
        };
        self.execute_or_forward(request, hop, || self.apply_on_leader(command))
            .await
    }

    pub async fn delete(&self, key: &str, hop: Hop) -> Result<Routed<ApplyResult>> {
        let key = validate_key(key)?;
        let request = ForwardRequest::delete(&["store", key]);
        let command = Command::Delete {
            key: key.to_string(),
        };
        self.execute_or_forward(request, hop, || self.apply_on_leader(command))
            .await
    }

    /// Reads from the local replica. May lag the leader.
    pub fn get(&self, key: &str) -> Result<StoredRecord> {
        let key = validate_key(key)?;
        let store = self.locator.store();
        match store.get(key)? {
            Some(value) => Ok(StoredRecord {
                key: key.to_string(),
                value,
            }),
            None => Err(Error::NotFound(key.to_string())),
        }
    }

    async fn apply_on_leader(&self, command: Command) -> Result<ApplyResult> {
        self.consensus
            .apply(command.encode()?, self.apply_timeout)
            .await
    }
}

/// Returns the key without surrounding whitespace, which must leave
/// something behind.
pub fn validate_key(key: &str) -> Result<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::InvalidInput("key must not be empty".into()));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};

    use crate::config::NodeConfig;
    use crate::consensus::stub::StubConsensus;
    use crate::forward::FORWARDED_HEADER;
    use crate::fsm::StateMachine;
    use crate::locator::CURRENT_LEADER_KEY;
    use crate::store::DurableStore;

    fn config(id: u64, server_address: &str) -> NodeConfig {
        NodeConfig {
            server_address: server_address.into(),
            join_address: None,
            raft_node_id: id,
            raft_address: format!("127.0.0.1:70{id:02}"),
            volume_dir: format!("/tmp/node{id}").into(),
            peers: vec![],
        }
    }

    fn router(role: Role) -> (WriteRouter<StubConsensus>, StubConsensus, DurableStore) {
        let store = DurableStore::temporary().unwrap();
        let consensus = StubConsensus::new(1, role, StateMachine::new(store.clone()));
        let locator = LeaderLocator::new(
            consensus.clone(),
            store.clone(),
            Arc::new(config(1, "127.0.0.1:8001")),
            Duration::from_millis(500),
        );
        let forwarder = Forwarder::new(1, Duration::from_secs(2)).unwrap();
        let router = WriteRouter::new(
            consensus.clone(),
            locator,
            forwarder,
            Duration::from_millis(500),
        );
        (router, consensus, store)
    }

    fn point_leader_at(store: &DurableStore, leader: &NodeConfig) {
        store
            .put(CURRENT_LEADER_KEY, &serde_json::to_value(leader).unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn leader_applies_locally_and_reads_back() {
        let (router, consensus, _) = router(Role::Leader);
        let routed = router.store("x", json!(1), Hop::Origin).await.unwrap();
        assert!(matches!(routed, Routed::Local(ref result) if result.key == "x"));
        assert_eq!(consensus.applies(), 1);

        let record = router.get("x").unwrap();
        assert_eq!(record.value, json!(1));

        router.delete("x", Hop::Origin).await.unwrap();
        assert!(matches!(router.get("x"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn blank_key_is_rejected_before_consensus() {
        for role in [Role::Leader, Role::Follower] {
            let (router, consensus, _) = router(role);
            for key in ["", "   "] {
                let err = router.store(key, json!(1), Hop::Origin).await.unwrap_err();
                assert!(matches!(err, Error::InvalidInput(_)));
            }
            assert!(matches!(router.get(" "), Err(Error::InvalidInput(_))));
            assert_eq!(consensus.applies(), 0);
        }
    }

    #[tokio::test]
    async fn padded_keys_are_trimmed() {
        let (router, _, store) = router(Role::Leader);
        let routed = router.store(" x ", json!(1), Hop::Origin).await.unwrap();
        assert!(matches!(routed, Routed::Local(ref result) if result.key == "x"));

        assert_eq!(router.get("x").unwrap().value, json!(1));
        assert_eq!(router.get("\tx ").unwrap().key, "x");
        assert_eq!(store.get(" x ").unwrap(), None);

        router.delete(" x", Hop::Origin).await.unwrap();
        assert!(matches!(router.get("x"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn forwarded_body_carries_trimmed_key() {
        let (leader_address, seen) = fake_leader().await;
        let (router, _, store) = router(Role::Follower);
        point_leader_at(&store, &config(2, &leader_address));

        router.store("  y", json!(2), Hop::Origin).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, json!({ "key": "y", "value": 2 }));
    }

    #[tokio::test]
    async fn follower_without_pointer_has_no_known_leader() {
        let (router, _, _) = router(Role::Follower);
        let err = router.store("x", json!(1), Hop::Origin).await.unwrap_err();
        assert!(matches!(err, Error::NoKnownLeader(_)));
    }

    #[tokio::test]
    async fn pointer_at_self_is_not_followed() {
        let (router, _, store) = router(Role::Follower);
        point_leader_at(&store, &config(1, "127.0.0.1:8001"));
        let err = router.store("x", json!(1), Hop::Origin).await.unwrap_err();
        assert!(matches!(err, Error::NoKnownLeader(_)));
    }

    #[tokio::test]
    async fn forwarded_request_is_not_forwarded_again() {
        let (router, _, store) = router(Role::Follower);
        point_leader_at(&store, &config(2, "127.0.0.1:1"));
        let err = router.store("x", json!(1), Hop::Forwarded).await.unwrap_err();
        assert!(matches!(err, Error::NotLeader));
    }

    type Seen = Arc<Mutex<Vec<(Value, String)>>>;

    async fn fake_leader() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/store",
                post(
                    |State(seen): State<Seen>,
                     headers: HeaderMap,
                     Json(body): Json<Value>| async move {
                        let hop = headers
                            .get(FORWARDED_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        seen.lock().unwrap().push((body, hop));
                        Json(json!({ "message": "success persisting data", "data": null }))
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (address, seen)
    }

    #[tokio::test]
    async fn follower_forwards_without_applying_locally() {
        let (leader_address, seen) = fake_leader().await;
        let (router, consensus, store) = router(Role::Follower);
        point_leader_at(&store, &config(2, &leader_address));

        let routed = router.store("x", json!({"n": 1}), Hop::Origin).await.unwrap();
        let Routed::Forwarded(response) = routed else {
            panic!("expected a forward");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.body["message"], "success persisting data");

        assert_eq!(consensus.applies(), 0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, json!({ "key": "x", "value": {"n": 1} }));
        assert_eq!(seen[0].1, "1");
    }
}
