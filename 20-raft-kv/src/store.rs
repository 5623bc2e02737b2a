//! Durable key-value storage for the raft state machine.
//!
//! Wraps an embedded `sled` database. Values are JSON documents stored as
//! bytes. Single-key operations are atomic; [`DurableStore::replace_all`]
//! swaps the whole data set in one batch so a snapshot restore is never
//! partially visible.
//!
//! User data and the reserved records (`CurrentLeader`, `member_<id>`)
//! share one key space.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub value: Value,
}

/// Handle to the node's store. Cloning shares the same database.
#[derive(Clone)]
pub struct DurableStore {
    db: sled::Db,
}

impl DurableStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn temporary() -> Result<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    /// Reads the current value for a key.
    ///
    /// Local read with no consensus: returns whatever this replica has applied.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.get_as(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stores a value, overwriting any existing one.
    pub fn put(&self, key: &str, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(Error::Encode)?;
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Removes a key. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.db.remove(key.as_bytes())?.is_some())
    }

    /// Every record in key order.
    pub fn scan(&self) -> Result<Vec<StoredRecord>> {
        let mut records = Vec::with_capacity(self.db.len());
        for item in self.db.iter() {
            let (key, value) = item?;
            records.push(StoredRecord {
                key: String::from_utf8_lossy(&key).into_owned(),
                value: serde_json::from_slice(&value)?,
            });
        }
        Ok(records)
    }

    /// Atomically replaces the whole data set with `records`.
    pub fn replace_all(&self, records: &[StoredRecord]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for item in self.db.iter().keys() {
            batch.remove(item?);
        }
        for record in records {
            let bytes = serde_json::to_vec(&record.value).map_err(Error::Encode)?;
            batch.insert(record.key.as_bytes(), bytes);
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
