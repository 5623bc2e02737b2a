use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Mutations that flow through the raft log.
///
/// Serialized as JSON with the operation in a tag field, e.g.
/// `{"operation":"SET","key":"x","value":1}`. New operations are new
/// variants; the envelope stays the same.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "UPPERCASE")]
pub enum Command {
    Set { key: String, value: Value },
    Delete { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Set,
    Delete,
}

/// Confirmation that one specific committed entry was applied to this replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub index: u64,
    pub operation: Operation,
    pub key: String,
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Command::Set { .. } => Operation::Set,
            Command::Delete { .. } => Operation::Delete,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_uses_tagged_wire_format() {
        let command = Command::Set {
            key: "x".into(),
            value: json!({"nested": [1, 2]}),
        };
        let wire: Value = serde_json::from_slice(&command.encode().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({"operation": "SET", "key": "x", "value": {"nested": [1, 2]}})
        );
    }

    #[test]
    fn decodes_delete() {
        let command = Command::decode(br#"{"operation":"DELETE","key":"gone"}"#).unwrap();
        assert_eq!(command, Command::Delete { key: "gone".into() });
        assert_eq!(command.operation(), Operation::Delete);
        assert_eq!(command.key(), "gone");
    }

    #[test]
    fn rejects_unknown_operation() {
        let err = Command::decode(br#"{"operation":"INCR","key":"n"}"#).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
