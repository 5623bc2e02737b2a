//! The finite state machine fed by committed raft entries.

use crate::command::{ApplyResult, Command};
use crate::error::{Error, Result};
use crate::store::{DurableStore, StoredRecord};

/// Applies committed commands to the [`DurableStore`].
///
/// Entries arrive strictly in log order and one at a time. `apply` does
/// nothing besides the single store mutation, so replicas that apply the same
/// sequence end up with the same key space.
#[derive(Clone)]
pub struct StateMachine {
    store: DurableStore,
}

impl StateMachine {
    pub fn new(store: DurableStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    /// Decodes and applies one committed entry.
    ///
    /// A decode failure means an entry this system never produced reached the
    /// log; it is returned as an error and the caller treats it as fatal.
    pub fn apply(&self, index: u64, payload: &[u8]) -> Result<ApplyResult> {
        let command = Command::decode(payload)?;
        match &command {
            Command::Set { key, value } => self.store.put(key, value)?,
            Command::Delete { key } => {
                self.store.delete(key)?;
            }
        }
        Ok(ApplyResult {
            index,
            operation: command.operation(),
            key: command.key().to_owned(),
        })
    }

    /// Serializes the entire key space as a JSON array of `{key, value}`.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.store.scan()?).map_err(Error::Encode)
    }

    /// Replaces the store's contents with a snapshot image.
    ///
    /// The image is fully decoded before the store is touched, and the
    /// replacement is one atomic batch.
    pub fn restore(&self, image: &[u8]) -> Result<()> {
        let records: Vec<StoredRecord> = serde_json::from_slice(image)?;
        self.store.replace_all(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Operation;
    use serde_json::json;

    fn machine() -> StateMachine {
        StateMachine::new(DurableStore::temporary().unwrap())
    }

    fn set(key: &str, value: serde_json::Value) -> Vec<u8> {
        Command::Set {
            key: key.into(),
            value,
        }
        .encode()
        .unwrap()
    }

    fn delete(key: &str) -> Vec<u8> {
        Command::Delete { key: key.into() }.encode().unwrap()
    }

    fn history() -> Vec<Vec<u8>> {
        vec![
            set("a", json!(1)),
            set("b", json!({"x": "y"})),
            set("a", json!(2)),
            delete("b"),
            set("c", json!([true, null])),
        ]
    }

    #[test]
    fn apply_set_writes_and_echoes_entry() {
        let fsm = machine();
        let result = fsm.apply(42, &set("k", json!("v"))).unwrap();
        assert_eq!(
            result,
            ApplyResult {
                index: 42,
                operation: Operation::Set,
                key: "k".into()
            }
        );
        assert_eq!(fsm.store().get("k").unwrap(), Some(json!("v")));
    }

    #[test]
    fn malformed_entry_is_rejected_without_side_effects() {
        let fsm = machine();
        fsm.apply(1, &set("k", json!(1))).unwrap();

        let err = fsm.apply(2, b"not a command").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(fsm.store().scan().unwrap().len(), 1);
    }

    #[test]
    fn replicas_applying_the_same_log_converge() {
        let left = machine();
        let right = machine();
        for (i, entry) in history().iter().enumerate() {
            left.apply(i as u64 + 1, entry).unwrap();
            right.apply(i as u64 + 1, entry).unwrap();
        }
        assert_eq!(left.store().scan().unwrap(), right.store().scan().unwrap());
        assert_eq!(left.store().get("a").unwrap(), Some(json!(2)));
        assert_eq!(left.store().get("b").unwrap(), None);
    }

    #[test]
    fn restore_from_snapshot_matches_direct_application() {
        let source = machine();
        for (i, entry) in history().iter().enumerate() {
            source.apply(i as u64 + 1, entry).unwrap();
        }
        let image = source.snapshot().unwrap();

        let target = machine();
        target.apply(1, &set("stale", json!("should vanish"))).unwrap();
        target.restore(&image).unwrap();

        assert_eq!(target.store().scan().unwrap(), source.store().scan().unwrap());
    }

    #[test]
    fn corrupt_snapshot_leaves_store_untouched() {
        let fsm = machine();
        fsm.apply(1, &set("keep", json!("me"))).unwrap();

        assert!(fsm.restore(b"[{\"key\": \"half\"").is_err());
        assert_eq!(fsm.store().get("keep").unwrap(), Some(json!("me")));
        assert_eq!(fsm.store().scan().unwrap().len(), 1);
    }
}
