//! Raft log storage that serves state machine snapshots.
//!
//! `MemStorage` keeps the log, hard state and configuration but produces
//! snapshots without any application data. [`SnapshotStorage`] delegates to it
//! and additionally holds the latest snapshot taken by the node, whose data is
//! a [`SnapshotEnvelope`]: the FSM image plus the raft address book, so a
//! node restored from it can reach every member.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLockWriteGuard};

use anyhow::{Context, Result};
use raft::prelude::{Entry, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage, MemStorageCore};
use raft::{RaftState, Storage, StorageError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    /// Raft address of every known node, by id.
    pub peers: BTreeMap<u64, String>,
    /// Output of `StateMachine::snapshot`.
    pub state: Vec<u8>,
}

impl SnapshotEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("encode snapshot envelope failed")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("decode snapshot envelope failed")
    }
}

#[derive(Clone, Default)]
pub struct SnapshotStorage {
    log: MemStorage,
    latest: Arc<Mutex<Snapshot>>,
}

impl SnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.log.wl()
    }

    fn latest(&self) -> MutexGuard<'_, Snapshot> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot_index(&self) -> u64 {
        self.latest().get_metadata().index
    }

    /// Installs a snapshot received from the leader.
    pub fn install(&self, snapshot: Snapshot) -> raft::Result<()> {
        self.log.wl().apply_snapshot(snapshot.clone())?;
        *self.latest() = snapshot;
        Ok(())
    }

    /// Records a locally taken snapshot and drops the log entries it covers.
    ///
    /// The entry at the snapshot index itself is kept so the log is never empty.
    pub fn compact(&self, snapshot: Snapshot) -> raft::Result<()> {
        let index = snapshot.get_metadata().index;
        *self.latest() = snapshot;
        self.log.wl().compact(index)
    }
}

impl Storage for SnapshotStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.log.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.log.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        {
            let latest = self.latest();
            let meta = latest.get_metadata();
            if meta.index != 0 && idx == meta.index {
                return Ok(meta.term);
            }
        }
        self.log.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.log.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.log.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let latest = self.latest();
        let index = latest.get_metadata().index;
        if index == 0 || index < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(latest.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::ConfState;

    fn entry(index: u64, term: u64) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry
    }

    fn snapshot_at(index: u64, term: u64, data: Vec<u8>) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        *meta.mut_conf_state() = ConfState::from((vec![1, 2], vec![]));
        snapshot
    }

    #[test]
    fn envelope_survives_encoding() {
        let envelope = SnapshotEnvelope {
            peers: BTreeMap::from([(1, "127.0.0.1:7001".to_string())]),
            state: b"[]".to_vec(),
        };
        let decoded = SnapshotEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn no_snapshot_is_served_before_one_is_taken() {
        let storage = SnapshotStorage::new();
        let err = storage.snapshot(0, 2).unwrap_err();
        assert!(matches!(
            err,
            raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)
        ));
    }

    #[test]
    fn compaction_serves_latest_snapshot_and_trims_log() {
        let storage = SnapshotStorage::new();
        storage
            .wl()
            .append(&[entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)])
            .unwrap();

        storage.compact(snapshot_at(3, 2, b"image".to_vec())).unwrap();

        assert_eq!(storage.first_index().unwrap(), 3);
        assert_eq!(storage.last_index().unwrap(), 4);
        assert_eq!(storage.term(3).unwrap(), 2);
        assert_eq!(storage.snapshot_index(), 3);

        let served = storage.snapshot(0, 2).unwrap();
        assert_eq!(served.get_metadata().index, 3);
        assert_eq!(&served.data[..], b"image");
    }

    #[test]
    fn installing_a_snapshot_resets_the_log() {
        let storage = SnapshotStorage::new();
        storage.install(snapshot_at(10, 3, Vec::new())).unwrap();

        assert_eq!(storage.first_index().unwrap(), 11);
        assert_eq!(storage.last_index().unwrap(), 10);
        assert_eq!(storage.term(10).unwrap(), 3);
        assert_eq!(
            storage.initial_state().unwrap().conf_state.voters,
            vec![1, 2]
        );
    }
}
