//! Worker runtime for a Raft node.
//!
//! This module orchestrates the threading model:
//!
//! - **Worker thread**: runs the Raft event loop and owns the [`RaftNode`]
//! - **Network threads**: the peer listener and one sender per peer (see
//!   [`transport`](crate::transport))
//! - **Async callers**: request handlers talk to the worker through a
//!   [`RaftHandle`], which implements [`Consensus`]
//!
//! Requests travel over a crossbeam channel and are answered through tokio
//! oneshots, so the worker stays single-threaded and synchronous while the
//! HTTP side awaits without blocking.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use raft::StateRole;
use raft::prelude::{ConfChangeType, Message, MessageType};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::ApplyResult;
use crate::consensus::{Consensus, LeadershipChanged, RaftStats, Role, Server};
use crate::error::{self, Error};
use crate::fsm::StateMachine;
use crate::node::{Applied, ApplyReport, RaftNode};
use crate::transport::{Inbound, Listener, Transport};

/// Raft logical clock interval.
///
/// The worker calls `node.tick()` every 100ms, which drives Raft's timeout logic:
/// - Heartbeat timeout: 3 ticks = 300ms
/// - Election timeout: 10 ticks = 1000ms
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long a leadership transfer may take before it is reported as failed.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on membership changes, which need a quorum round trip.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity and tuning of the local raft instance.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub id: u64,
    /// Address to bind for incoming Raft messages (e.g., "127.0.0.1:7101")
    pub raft_address: String,
    pub snapshot_threshold: u64,
}

/// Requests sent from async callers to the worker thread.
///
/// Every variant carries a oneshot for the worker's answer.
enum Request {
    Propose {
        data: Vec<u8>,
        respond_to: oneshot::Sender<error::Result<ApplyResult>>,
    },
    Status {
        respond_to: oneshot::Sender<error::Result<Status>>,
    },
    Bootstrap {
        respond_to: oneshot::Sender<error::Result<()>>,
    },
    AddVoter {
        server: Server,
        respond_to: oneshot::Sender<error::Result<()>>,
    },
    RemoveServer {
        node_id: u64,
        respond_to: oneshot::Sender<error::Result<()>>,
    },
    TransferLeadership {
        respond_to: oneshot::Sender<error::Result<()>>,
    },
}

struct Status {
    stats: RaftStats,
    leader: Option<Server>,
}

/// Handle for sending requests to a running Raft node.
///
/// Cheap to clone; all clones talk to the same worker.
#[derive(Clone)]
pub struct RaftHandle {
    id: u64,
    requests: Sender<Request>,
    observers: broadcast::Sender<LeadershipChanged>,
}

/// Starts the raft worker and its network listener.
///
/// The listener is bound before this returns, so a port conflict is reported
/// here. The worker stops when `shutdown` is cancelled; if it fails it
/// cancels `fatal`, since a replica that cannot apply the log must not keep
/// serving.
pub fn spawn(
    options: RaftOptions,
    fsm: StateMachine,
    shutdown: CancellationToken,
    fatal: CancellationToken,
) -> Result<RaftHandle> {
    let node = RaftNode::new(
        options.id,
        options.raft_address.clone(),
        fsm,
        options.snapshot_threshold,
    )?;
    let (request_tx, request_rx) = unbounded();
    let (inbound_tx, inbound_rx) = unbounded();
    let (observers, _) = broadcast::channel(64);

    let listener = Listener::bind(&options.raft_address, inbound_tx)?;
    let transport = Transport::new(options.id, options.raft_address.clone())?;

    let mut worker = Worker {
        node,
        transport,
        request_rx,
        inbound_rx,
        observers: observers.clone(),
        pending: BTreeMap::new(),
        transfer: None,
        last_view: (StateRole::Follower, 0),
        shutdown,
    };
    let id = options.id;
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = worker.run() {
                error!(node_id = id, error = ?err, "raft worker crashed");
                fatal.cancel();
            }
            worker.fail_outstanding();
            listener.stop();
        })
        .context("failed to spawn raft worker")?;

    info!(node_id = id, raft_address = %options.raft_address, "raft worker started");
    Ok(RaftHandle {
        id,
        requests: request_tx,
        observers,
    })
}

impl RaftHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<error::Result<T>>) -> Request,
    ) -> error::Result<oneshot::Receiver<error::Result<T>>> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| worker_gone())?;
        Ok(rx)
    }

    async fn status(&self) -> error::Result<Status> {
        let rx = self.call(|respond_to| Request::Status { respond_to })?;
        rx.await.map_err(|_| worker_gone())?
    }

    /// Waits for a worker answer, bounded by `timeout`.
    async fn bounded<T>(
        rx: oneshot::Receiver<error::Result<T>>,
        operation: &'static str,
        timeout: Duration,
    ) -> error::Result<T> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(worker_gone()),
            Err(_) => Err(Error::CommitTimeout { operation, timeout }),
        }
    }
}

fn worker_gone() -> Error {
    Error::Consensus("raft worker has stopped".into())
}

impl Consensus for RaftHandle {
    async fn apply(&self, command: Vec<u8>, timeout: Duration) -> error::Result<ApplyResult> {
        let rx = self
            .call(|respond_to| Request::Propose {
                data: command,
                respond_to,
            })?;
        Self::bounded(rx, "apply", timeout).await
    }

    async fn state(&self) -> error::Result<Role> {
        Ok(self.status().await?.stats.state)
    }

    async fn leader(&self) -> error::Result<Option<Server>> {
        Ok(self.status().await?.leader)
    }

    async fn configuration(&self) -> error::Result<Vec<Server>> {
        Ok(self.status().await?.stats.latest_configuration)
    }

    async fn bootstrap(&self, server: Server) -> error::Result<()> {
        if server.node_id != self.id {
            return Err(Error::Consensus(format!(
                "cannot bootstrap node {} from node {}",
                server.node_id, self.id
            )));
        }
        let rx = self.call(|respond_to| Request::Bootstrap { respond_to })?;
        rx.await.map_err(|_| worker_gone())?
    }

    async fn add_voter(&self, server: Server) -> error::Result<()> {
        let rx = self.call(|respond_to| Request::AddVoter { server, respond_to })?;
        Self::bounded(rx, "add voter", MEMBERSHIP_TIMEOUT).await
    }

    async fn remove_server(&self, node_id: u64) -> error::Result<()> {
        let rx = self
            .call(|respond_to| Request::RemoveServer {
                node_id,
                respond_to,
            })?;
        Self::bounded(rx, "remove server", MEMBERSHIP_TIMEOUT).await
    }

    async fn leadership_transfer(&self) -> error::Result<()> {
        let rx = self.call(|respond_to| Request::TransferLeadership { respond_to })?;
        // The worker enforces TRANSFER_TIMEOUT itself.
        rx.await.map_err(|_| worker_gone())?
    }

    async fn stats(&self) -> error::Result<RaftStats> {
        Ok(self.status().await?.stats)
    }

    fn observe(&self) -> broadcast::Receiver<LeadershipChanged> {
        self.observers.subscribe()
    }
}

/// A caller waiting for its entry to be applied.
enum Waiter {
    Apply(oneshot::Sender<error::Result<ApplyResult>>),
    Membership(oneshot::Sender<error::Result<()>>),
}

impl Waiter {
    fn fail(self, err: Error) {
        match self {
            Waiter::Apply(tx) => {
                let _ = tx.send(Err(err));
            }
            Waiter::Membership(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// A proposal identified by the `(index, term)` raft gave it.
struct Pending {
    term: u64,
    waiter: Waiter,
}

struct Transfer {
    target: u64,
    deadline: Instant,
    respond_to: oneshot::Sender<error::Result<()>>,
}

/// The worker that runs the Raft event loop.
///
/// Owns the RaftNode and processes three types of events:
/// 1. **Requests** from [`RaftHandle`]s
/// 2. **Inbound traffic** (hellos and raft messages) from peers
/// 3. **Tick events** (every 100ms) to drive Raft timeouts
struct Worker {
    node: RaftNode,
    transport: Transport,
    request_rx: Receiver<Request>,
    inbound_rx: Receiver<Inbound>,
    observers: broadcast::Sender<LeadershipChanged>,
    pending: BTreeMap<u64, Pending>,
    transfer: Option<Transfer>,
    last_view: (StateRole, u64),
    shutdown: CancellationToken,
}

impl Worker {
    /// Runs the main event loop until shutdown.
    ///
    /// Each iteration waits (at most until the next tick) for a request or
    /// inbound frame, ticks when due, drains Ready state, then settles
    /// waiters whose fate is now known.
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        while !self.shutdown.is_cancelled() {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.request_rx) -> req => match req {
                    Ok(req) => self.handle_request(req)?,
                    Err(_) => break, // every handle dropped
                },
                recv(self.inbound_rx) -> inbound => match inbound {
                    Ok(inbound) => self.handle_inbound(inbound),
                    Err(_) => break, // listener died
                },
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.observe_leadership();
            self.check_transfer();
        }
        info!(node_id = self.node.id(), "raft worker stopped");
        Ok(())
    }

    fn handle_request(&mut self, req: Request) -> Result<()> {
        match req {
            Request::Propose { data, respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(Error::NotLeader));
                    return Ok(());
                }
                match self.node.propose(data) {
                    Ok((index, term)) => self.track(index, term, Waiter::Apply(respond_to)),
                    Err(err) => {
                        let _ = respond_to.send(Err(Error::Commit(format!("{err:#}"))));
                    }
                }
            }
            Request::Status { respond_to } => {
                let status = self.node.stats().map(|stats| Status {
                    leader: stats.leader_id.map(|id| Server {
                        node_id: id,
                        raft_address: self
                            .node
                            .peer_address(id)
                            .unwrap_or_default()
                            .to_string(),
                    }),
                    stats,
                });
                let _ = respond_to.send(status.map_err(|err| Error::Consensus(format!("{err:#}"))));
            }
            Request::Bootstrap { respond_to } => {
                let result = self
                    .node
                    .bootstrap()
                    .map_err(|err| Error::Consensus(format!("{err:#}")));
                if result.is_ok() {
                    info!(node_id = self.node.id(), "bootstrapped single-node cluster");
                }
                let _ = respond_to.send(result);
            }
            Request::AddVoter { server, respond_to } => {
                match self.prepare_add(&server)? {
                    Some(result) => {
                        let _ = respond_to.send(result);
                    }
                    None => self.propose_membership(
                        ConfChangeType::AddNode,
                        server.node_id,
                        server.raft_address.into_bytes(),
                        respond_to,
                    ),
                }
            }
            Request::RemoveServer {
                node_id,
                respond_to,
            } => match self.prepare_remove(node_id)? {
                Some(result) => {
                    let _ = respond_to.send(result);
                }
                None => self.propose_membership(
                    ConfChangeType::RemoveNode,
                    node_id,
                    Vec::new(),
                    respond_to,
                ),
            },
            Request::TransferLeadership { respond_to } => self.start_transfer(respond_to)?,
        }
        Ok(())
    }

    /// Returns an immediate answer, or `None` if the change must be proposed.
    fn prepare_add(&mut self, server: &Server) -> Result<Option<error::Result<()>>> {
        if self.node.role() != StateRole::Leader {
            return Ok(Some(Err(Error::NotLeader)));
        }
        if server.node_id == 0 || server.raft_address.trim().is_empty() {
            return Ok(Some(Err(Error::Membership(
                "node id and raft address are required".into(),
            ))));
        }
        self.node
            .remember_peer(server.node_id, server.raft_address.clone());
        if self.node.is_voter(server.node_id)? {
            return Ok(Some(Ok(())));
        }
        if self.node.has_pending_conf() {
            return Ok(Some(Err(Error::Membership(
                "another configuration change is in progress".into(),
            ))));
        }
        Ok(None)
    }

    fn prepare_remove(&mut self, node_id: u64) -> Result<Option<error::Result<()>>> {
        if self.node.role() != StateRole::Leader {
            return Ok(Some(Err(Error::NotLeader)));
        }
        if node_id == self.node.id() {
            return Ok(Some(Err(Error::Membership(
                "the leader cannot remove itself; transfer leadership first".into(),
            ))));
        }
        if !self.node.is_voter(node_id)? {
            return Ok(Some(Ok(())));
        }
        if self.node.has_pending_conf() {
            return Ok(Some(Err(Error::Membership(
                "another configuration change is in progress".into(),
            ))));
        }
        Ok(None)
    }

    fn propose_membership(
        &mut self,
        change: ConfChangeType,
        node_id: u64,
        context: Vec<u8>,
        respond_to: oneshot::Sender<error::Result<()>>,
    ) {
        match self.node.propose_conf_change(change, node_id, context) {
            Ok((index, term)) => {
                info!(
                    node_id = self.node.id(),
                    ?change,
                    target = node_id,
                    index,
                    "proposed membership change"
                );
                self.track(index, term, Waiter::Membership(respond_to));
            }
            Err(err) => {
                let _ = respond_to.send(Err(Error::Membership(format!("{err:#}"))));
            }
        }
    }

    fn start_transfer(&mut self, respond_to: oneshot::Sender<error::Result<()>>) -> Result<()> {
        if self.node.role() != StateRole::Leader {
            let _ = respond_to.send(Err(Error::NotLeader));
            return Ok(());
        }
        if self.transfer.is_some() {
            let _ = respond_to.send(Err(Error::Transfer(
                "a leadership transfer is already in progress".into(),
            )));
            return Ok(());
        }
        let Some(target) = self.node.transfer_target()? else {
            let _ = respond_to.send(Err(Error::Transfer(
                "no other voter to transfer leadership to".into(),
            )));
            return Ok(());
        };
        info!(node_id = self.node.id(), target, "transferring leadership");
        self.node.transfer_leader(target);
        self.transfer = Some(Transfer {
            target,
            deadline: Instant::now() + TRANSFER_TIMEOUT,
            respond_to,
        });
        Ok(())
    }

    fn track(&mut self, index: u64, term: u64, waiter: Waiter) {
        if let Some(replaced) = self.pending.insert(index, Pending { term, waiter }) {
            // Only possible if an earlier term's proposal was truncated.
            replaced
                .waiter
                .fail(Error::Commit(format!("entry {index} was overwritten")));
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Hello(hello) => self.node.remember_peer(hello.node_id, hello.raft_address),
            Inbound::Message(msg) => {
                if let Err(err) = self.node.step(msg) {
                    debug!(node_id = self.node.id(), error = %err, "dropped raft message");
                }
            }
        }
    }

    /// Drains all ready state from Raft and processes it.
    ///
    /// Messages are sent before waiters are notified so replication is not
    /// held up by client bookkeeping.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.settle(report);
            }
        }
        if self.node.role() != StateRole::Leader && !self.pending.is_empty() {
            let count = self.pending.len();
            warn!(node_id = self.node.id(), count, "lost leadership with proposals in flight");
            for (_, pending) in std::mem::take(&mut self.pending) {
                pending.waiter.fail(Error::LeadershipLost);
            }
        }
        Ok(())
    }

    /// Sends a Raft message to its destination.
    ///
    /// Messages addressed to this node are fed back into `node.step()`.
    /// Messages for nodes whose address is still unknown are dropped; raft
    /// retries them.
    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }

        let to = msg.to;
        let Some(address) = self.node.peer_address(to).map(str::to_owned) else {
            debug!(node_id = self.node.id(), peer = to, "no address for peer, dropping message");
            return Ok(());
        };
        self.transport.send(to, &address, &msg);
        if msg.msg_type() == MessageType::MsgSnapshot {
            // Resume probing; a lost snapshot is simply sent again.
            self.node.report_snapshot_sent(to);
        }
        Ok(())
    }

    /// Answers the caller waiting on this entry, if any.
    fn settle(&mut self, report: ApplyReport) {
        if let Applied::ConfChange {
            change: ConfChangeType::RemoveNode,
            node_id,
        } = report.applied
        {
            self.transport.disconnect(node_id);
        }

        let Some(pending) = self.pending.remove(&report.index) else {
            return;
        };
        if pending.term != report.term {
            pending.waiter.fail(Error::Commit(format!(
                "entry {} was replaced by a term {} entry",
                report.index, report.term
            )));
            return;
        }
        match (pending.waiter, report.applied) {
            (Waiter::Apply(tx), Applied::Command(result)) => {
                let _ = tx.send(Ok(result));
            }
            (Waiter::Membership(tx), Applied::ConfChange { .. }) => {
                let _ = tx.send(Ok(()));
            }
            (Waiter::Membership(tx), _) => {
                let _ = tx.send(Err(Error::Membership(
                    "configuration change was dropped by raft".into(),
                )));
            }
            (Waiter::Apply(tx), _) => {
                let _ = tx.send(Err(Error::Commit("proposal was dropped by raft".into())));
            }
        }
    }

    /// Broadcasts a signal when the local role or known leader changes.
    fn observe_leadership(&mut self) {
        let view = (self.node.role(), self.node.leader_id());
        if view == self.last_view {
            return;
        }
        info!(
            node_id = self.node.id(),
            from = ?self.last_view.0,
            to = ?view.0,
            leader = view.1,
            term = self.node.term(),
            "leadership view changed"
        );
        self.last_view = view;
        // No subscribers is fine.
        let _ = self.observers.send(LeadershipChanged);
    }

    fn check_transfer(&mut self) {
        let Some(transfer) = self.transfer.take() else {
            return;
        };
        if self.node.role() != StateRole::Leader {
            info!(node_id = self.node.id(), target = transfer.target, "leadership transferred");
            let _ = transfer.respond_to.send(Ok(()));
        } else if Instant::now() >= transfer.deadline {
            warn!(
                node_id = self.node.id(),
                target = transfer.target,
                "leadership transfer timed out"
            );
            let _ = transfer.respond_to.send(Err(Error::Transfer(format!(
                "node {} did not take over within {:?}",
                transfer.target, TRANSFER_TIMEOUT
            ))));
        } else {
            self.transfer = Some(transfer);
        }
    }

    /// Answers everyone still waiting once the loop has exited.
    fn fail_outstanding(&mut self) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            pending.waiter.fail(worker_gone());
        }
        if let Some(transfer) = self.transfer.take() {
            let _ = transfer.respond_to.send(Err(worker_gone()));
        }
        for req in self.request_rx.try_iter() {
            match req {
                Request::Propose { respond_to, .. } => {
                    let _ = respond_to.send(Err(worker_gone()));
                }
                Request::Status { respond_to } => {
                    let _ = respond_to.send(Err(worker_gone()));
                }
                Request::Bootstrap { respond_to }
                | Request::AddVoter { respond_to, .. }
                | Request::RemoveServer { respond_to, .. }
                | Request::TransferLeadership { respond_to } => {
                    let _ = respond_to.send(Err(worker_gone()));
                }
            }
        }
    }
}
