//! Core Raft node implementation.
//!
//! This module wraps the tikv/raft library. [`RaftNode`] combines the raw Raft
//! state machine with the key-value [`StateMachine`], the raft address book and
//! snapshot-based log compaction. It is single-threaded: the runtime's worker
//! owns it and drives it with ticks, peer messages and proposals.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::{SnapshotStatus, StateRole, Storage};
use slog::{Logger, o};
use tracing::{debug, info};

use crate::command::ApplyResult;
use crate::consensus::{RaftStats, Server};
use crate::fsm::StateMachine;
use crate::snapshot::{SnapshotEnvelope, SnapshotStorage};

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a logger, but we log through `tracing` at the
/// application level instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// What applying one committed entry did.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Command(ApplyResult),
    ConfChange {
        change: ConfChangeType,
        node_id: u64,
    },
    /// Leader no-op, or a proposal raft replaced with an empty entry.
    Empty,
}

/// Records the outcome of applying a committed entry.
///
/// The runtime matches `(index, term)` against the proposals it is waiting on.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub applied: Applied,
}

/// Output from processing a Raft ready state: messages to send to other nodes
/// and entries that were committed and applied locally.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

/// A Raft consensus node applying committed entries to a [`StateMachine`].
///
/// The replicated log lives in memory; only the state machine is durable. A
/// snapshot is taken (and the log compacted) after every membership change
/// and every `snapshot_threshold` applied entries, so new or lagging members
/// are brought up to date with a full state image.
pub struct RaftNode {
    id: u64,
    config: Config,
    raw: RawNode<SnapshotStorage>,
    storage: SnapshotStorage,
    fsm: StateMachine,
    logger: Logger,
    peers: BTreeMap<u64, String>,
    applied_index: u64,
    snapshot_threshold: u64,
}

impl RaftNode {
    /// Creates a node that belongs to no cluster yet.
    ///
    /// It never campaigns until it is either bootstrapped or added to an
    /// existing cluster and receives its configuration from the leader.
    ///
    /// # Raft timing configuration
    ///
    /// - `election_tick: 10`: Elections triggered after ~1 second of no leader heartbeats
    /// - `heartbeat_tick: 3`: Leader sends heartbeats every ~300ms
    /// - Assumes each `tick()` call happens every 100ms (set by runtime)
    pub fn new(
        id: u64,
        raft_address: String,
        fsm: StateMachine,
        snapshot_threshold: u64,
    ) -> Result<Self> {
        let config = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        let storage = SnapshotStorage::new();
        let logger = silent_logger();
        let raw = RawNode::new(&config, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            config,
            raw,
            storage,
            fsm,
            logger,
            peers: BTreeMap::from([(id, raft_address)]),
            applied_index: 0,
            snapshot_threshold: snapshot_threshold.max(1),
        })
    }

    /// Makes this node the sole voter of a new cluster and starts an election,
    /// which a single voter wins immediately.
    pub fn bootstrap(&mut self) -> Result<()> {
        if !self.voters()?.is_empty() {
            bail!("node {} is already part of a cluster", self.id);
        }
        self.storage
            .wl()
            .set_conf_state(ConfState::from((vec![self.id], vec![])));
        self.raw = RawNode::new(&self.config, self.storage.clone(), &self.logger)
            .with_context(|| format!("failed to rebuild RawNode {}", self.id))?;
        self.raw.campaign().context("campaign failed")
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns this node's current role (Follower, Candidate, or Leader).
    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    /// Current voting members, sorted by id.
    pub fn voters(&self) -> Result<Vec<u64>> {
        let mut voters = self.storage.initial_state()?.conf_state.voters;
        voters.sort_unstable();
        Ok(voters)
    }

    pub fn is_voter(&self, id: u64) -> Result<bool> {
        Ok(self.voters()?.contains(&id))
    }

    pub fn has_pending_conf(&self) -> bool {
        self.raw.raft.has_pending_conf()
    }

    /// Raft address of a node, if known.
    pub fn peer_address(&self, id: u64) -> Option<&str> {
        self.peers.get(&id).map(String::as_str)
    }

    /// Learns (or updates) the raft address of a node.
    pub fn remember_peer(&mut self, id: u64, address: String) {
        if id == self.id || address.is_empty() {
            return;
        }
        if self.peers.get(&id) != Some(&address) {
            debug!(node_id = self.id, peer = id, %address, "learned peer address");
            self.peers.insert(id, address);
        }
    }

    /// Appends a command to the local log.
    ///
    /// Success only means "appended"; returns the `(index, term)` the entry was
    /// given so the caller can recognise it when it is applied.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64)> {
        self.raw.propose(vec![], data).context("propose failed")?;
        Ok(self.last_proposal())
    }

    /// Proposes a single-step membership change. `context` carries the raft
    /// address of an added node.
    pub fn propose_conf_change(
        &mut self,
        change: ConfChangeType,
        node_id: u64,
        context: Vec<u8>,
    ) -> Result<(u64, u64)> {
        let mut cc = ConfChange::default();
        cc.set_change_type(change);
        cc.node_id = node_id;
        cc.context = context.into();
        self.raw
            .propose_conf_change(vec![], cc)
            .context("propose conf change failed")?;
        Ok(self.last_proposal())
    }

    fn last_proposal(&self) -> (u64, u64) {
        (self.raw.raft.raft_log.last_index(), self.raw.raft.term)
    }

    /// The most caught-up voter other than this node.
    pub fn transfer_target(&self) -> Result<Option<u64>> {
        let progress = self.raw.raft.prs();
        Ok(self
            .voters()?
            .into_iter()
            .filter(|id| *id != self.id)
            .max_by_key(|id| progress.get(*id).map_or(0, |pr| pr.matched)))
    }

    pub fn transfer_leader(&mut self, target: u64) {
        self.raw.transfer_leader(target);
    }

    /// Tells raft a snapshot for `to` has been handed to the transport, so it
    /// resumes probing that follower instead of waiting indefinitely.
    pub fn report_snapshot_sent(&mut self, to: u64) {
        self.raw.report_snapshot(to, SnapshotStatus::Finish);
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// # Processing flow
    ///
    /// **Phase 1 (Ready)**: install a received snapshot (restoring the state
    /// machine from it), append new entries, persist the hard state, then apply
    /// committed entries.
    ///
    /// **Phase 2 (LightReady)**: update the commit index and apply any entries
    /// that became committed by persisting phase 1.
    ///
    /// Errors from the state machine are returned; the runtime treats them as
    /// fatal since replicas must not diverge.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = ready.take_messages();

        // Phase 1: Persist durable state

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            self.restore(&snapshot)?;
            self.storage
                .install(snapshot)
                .context("apply snapshot failed")?;
        }

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_persisted_messages());

        // Phase 2: Continue processing after persistence acknowledgment

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }

        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();
        self.maybe_compact()?;

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    /// Applies committed entries in log order.
    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut reports = Vec::with_capacity(entries.len());
        for entry in entries {
            let applied = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => Applied::Empty,
                EntryType::EntryNormal => {
                    let result = self
                        .fsm
                        .apply(entry.index, &entry.data[..])
                        .with_context(|| format!("failed to apply entry {}", entry.index))?;
                    Applied::Command(result)
                }
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    bail!("unexpected joint configuration change at index {}", entry.index)
                }
            };
            self.applied_index = entry.index;
            if matches!(applied, Applied::ConfChange { .. }) {
                // Joiners need a snapshot whose configuration already lists them.
                self.compact(entry.index, entry.term)?;
            }
            reports.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                applied,
            });
        }
        Ok(reports)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<Applied> {
        let cc = ConfChange::decode(&entry.data[..]).context("decode conf change failed")?;
        let conf_state = self
            .raw
            .apply_conf_change(&cc)
            .context("apply conf change failed")?;
        self.storage.wl().set_conf_state(conf_state);

        let change = cc.change_type();
        match change {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                let address = String::from_utf8(cc.context.to_vec())
                    .context("conf change context is not a utf-8 address")?;
                self.remember_peer(cc.node_id, address);
            }
            ConfChangeType::RemoveNode => {
                if cc.node_id != self.id {
                    self.peers.remove(&cc.node_id);
                }
            }
        }
        info!(
            node_id = self.id,
            change = ?change,
            target = cc.node_id,
            index = entry.index,
            "applied membership change"
        );
        Ok(Applied::ConfChange {
            change,
            node_id: cc.node_id,
        })
    }

    /// Replaces the state machine and address book with a snapshot's contents.
    fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        let envelope = SnapshotEnvelope::decode(&snapshot.data[..])?;
        self.fsm
            .restore(&envelope.state)
            .with_context(|| format!("failed to restore snapshot at index {index}"))?;
        for (id, address) in envelope.peers {
            self.remember_peer(id, address);
        }
        self.applied_index = index;
        info!(node_id = self.id, index, "restored state machine from snapshot");
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let since = self
            .applied_index
            .saturating_sub(self.storage.snapshot_index());
        if since < self.snapshot_threshold {
            return Ok(());
        }
        let term = self.storage.term(self.applied_index)?;
        self.compact(self.applied_index, term)
    }

    /// Snapshots the state machine at `index` and compacts the log up to it.
    fn compact(&mut self, index: u64, term: u64) -> Result<()> {
        let envelope = SnapshotEnvelope {
            peers: self.peers.clone(),
            state: self.fsm.snapshot()?,
        };
        let mut snapshot = Snapshot::default();
        snapshot.data = envelope.encode()?.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        *meta.mut_conf_state() = self.storage.initial_state()?.conf_state;

        self.storage
            .compact(snapshot)
            .context("compact log failed")?;
        debug!(node_id = self.id, index, term, "took snapshot");
        Ok(())
    }

    pub fn stats(&self) -> Result<RaftStats> {
        let voters = self.voters()?;
        let leader = self.leader_id();
        Ok(RaftStats {
            node_id: self.id,
            state: self.role().into(),
            term: self.term(),
            leader_id: (leader != 0).then_some(leader),
            last_log_index: self.raw.raft.raft_log.last_index(),
            commit_index: self.raw.raft.raft_log.committed,
            applied_index: self.applied_index,
            last_snapshot_index: self.storage.snapshot_index(),
            num_peers: voters.iter().filter(|id| **id != self.id).count(),
            latest_configuration: voters
                .into_iter()
                .map(|node_id| Server {
                    node_id,
                    raft_address: self.peers.get(&node_id).cloned().unwrap_or_default(),
                })
                .collect(),
        })
    }
}
