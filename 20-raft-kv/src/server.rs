//! Wires a node together: durable store, raft worker, leader locator, write
//! router, membership coordinator and the HTTP listener.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{AppState, routes};
use crate::config::{NodeConfig, NodeOptions};
use crate::forward::Forwarder;
use crate::fsm::StateMachine;
use crate::locator::LeaderLocator;
use crate::membership::{MembershipCoordinator, MembershipState};
use crate::router::{Routed, WriteRouter};
use crate::runtime::{self, RaftHandle, RaftOptions};
use crate::store::DurableStore;

/// A started node. Dropping it does not stop anything; call
/// [`shutdown`](Self::shutdown) or [`run_until`](Self::run_until).
pub struct RunningNode {
    http_addr: SocketAddr,
    raft: RaftHandle,
    store: DurableStore,
    membership: MembershipCoordinator<RaftHandle>,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    http: JoinHandle<()>,
    leave_on_shutdown: bool,
}

/// Starts every component of a node and returns once the HTTP listener is
/// bound. Joining the cluster continues in the background.
pub async fn launch(config: NodeConfig, options: NodeOptions) -> Result<RunningNode> {
    config.validate()?;
    let config = Arc::new(config);

    let store = DurableStore::open(config.volume_dir.join("fsm"))
        .with_context(|| format!("failed to open store in {}", config.volume_dir.display()))?;
    let shutdown = CancellationToken::new();
    let fatal = CancellationToken::new();

    let raft = runtime::spawn(
        RaftOptions {
            id: config.raft_node_id,
            raft_address: config.raft_address.clone(),
            snapshot_threshold: options.snapshot_threshold,
        },
        StateMachine::new(store.clone()),
        shutdown.clone(),
        fatal.clone(),
    )?;

    let locator = LeaderLocator::new(
        raft.clone(),
        store.clone(),
        config.clone(),
        options.apply_timeout,
    );
    locator.spawn_watcher(shutdown.clone(), fatal.clone());

    let forwarder = Forwarder::new(config.raft_node_id, options.forward_timeout)?;
    let router = WriteRouter::new(
        raft.clone(),
        locator,
        forwarder.clone(),
        options.apply_timeout,
    );
    let membership =
        MembershipCoordinator::new(router.clone(), forwarder, config.clone(), &options);

    let listener = TcpListener::bind(&config.server_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server_address))?;
    let http_addr = listener.local_addr()?;
    let app = routes(AppState {
        router,
        membership: membership.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let stop = shutdown.clone();
    let http = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        if let Err(err) = served {
            warn!(error = %err, "http server exited with error");
        }
    });
    info!(node_id = config.raft_node_id, %http_addr, "http api listening");

    membership.start(shutdown.clone(), fatal.clone());

    Ok(RunningNode {
        http_addr,
        raft,
        store,
        membership,
        shutdown,
        fatal,
        http,
        leave_on_shutdown: options.leave_on_shutdown,
    })
}

impl RunningNode {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.raft
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn membership_state(&self) -> MembershipState {
        self.membership.state()
    }

    /// Resolves once the node has bootstrapped or joined; `false` if the node
    /// stopped first.
    pub async fn wait_until_member(&self) -> bool {
        let stopped = CancellationToken::new();
        let shutdown = self.shutdown.clone();
        let fatal = self.fatal.clone();
        let watch = stopped.clone();
        let guard = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = fatal.cancelled() => {}
            }
            watch.cancel();
        });
        let member = self.membership.wait_until_member(&stopped).await;
        guard.abort();
        member
    }

    pub async fn leave(&self) -> crate::error::Result<Routed<()>> {
        self.membership.leave().await
    }

    /// Stops the worker and the HTTP server, then flushes the store.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        if let Err(err) = self.http.await {
            warn!(error = %err, "http task did not finish cleanly");
        }
        self.store.flush()?;
        info!(node_id = self.raft.id(), "node stopped");
        Ok(())
    }

    /// Serves until `signal` resolves or a component fails fatally.
    ///
    /// With `leave_on_shutdown` set, a signalled node first leaves the voting
    /// configuration; failing to leave is logged and does not block the stop.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let failed = tokio::select! {
            _ = signal => false,
            _ = self.fatal.cancelled() => true,
        };
        let node_id = self.raft.id();
        if !failed && self.leave_on_shutdown {
            match self.leave().await {
                Ok(Routed::Local(())) => {}
                Ok(Routed::Forwarded(response)) if response.status == 200 => {}
                Ok(Routed::Forwarded(response)) => {
                    warn!(
                        node_id,
                        status = response.status,
                        body = %response.body,
                        "leader refused removal"
                    );
                }
                Err(err) => warn!(node_id, error = %err, "could not leave cluster"),
            }
        }
        self.shutdown().await?;
        if failed {
            bail!("node {node_id} stopped after a fatal error");
        }
        Ok(())
    }
}
