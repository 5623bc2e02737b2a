//! Error taxonomy for the key-value coordination layer.
//!
//! Every request-boundary failure is one of these kinds. The HTTP layer turns
//! them into a `422 {"error": ...}` envelope; background tasks decide from the
//! kind whether a failure is fatal to the node.

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before touching the consensus substrate (empty key, bad body).
    #[error("{0}")]
    InvalidInput(String),

    #[error("key {0:?} not found")]
    NotFound(String),

    /// Raised by a non-leader that may not forward (forwarded hop, membership calls).
    #[error("node is not the leader")]
    NotLeader,

    #[error("no known leader to forward to: {0}")]
    NoKnownLeader(String),

    /// Transport-level failure talking to the believed leader. Retryable.
    #[error("forwarding to leader at {address} failed: {message}")]
    Forward { address: String, message: String },

    #[error("leader at {address} did not answer within {timeout:?}, outcome unknown")]
    ForwardTimeout { address: String, timeout: Duration },

    #[error("{operation} not confirmed within {timeout:?}, outcome unknown")]
    CommitTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("leadership lost before the entry was applied, outcome unknown")]
    LeadershipLost,

    #[error("failed to commit entry: {0}")]
    Commit(String),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("membership change rejected: {0}")]
    Membership(String),

    #[error("leadership transfer failed: {0}")]
    Transfer(String),

    #[error("consensus error: {0}")]
    Consensus(String),
}

impl Error {
    /// True when the request may still take effect after this error was reported.
    ///
    /// Callers should re-read rather than blindly retry a non-idempotent write.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Error::ForwardTimeout { .. } | Error::CommitTimeout { .. } | Error::LeadershipLost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_leadership_loss_are_ambiguous() {
        let timeout = Duration::from_millis(500);
        assert!(Error::CommitTimeout {
            operation: "apply",
            timeout
        }
        .is_ambiguous());
        assert!(Error::ForwardTimeout {
            address: "127.0.0.1:1".into(),
            timeout
        }
        .is_ambiguous());
        assert!(Error::LeadershipLost.is_ambiguous());

        assert!(!Error::NotLeader.is_ambiguous());
        assert!(!Error::Commit("dropped".into()).is_ambiguous());
        assert!(!Error::Forward {
            address: "127.0.0.1:1".into(),
            message: "connection refused".into()
        }
        .is_ambiguous());
    }

    #[test]
    fn encode_and_decode_failures_are_told_apart() {
        use std::collections::BTreeMap;

        let unencodable = BTreeMap::from([((1, 2), 3)]);
        let err = Error::Encode(serde_json::to_vec(&unencodable).unwrap_err());
        assert!(err.to_string().starts_with("failed to encode payload"));
        assert!(!err.is_ambiguous());

        let err: Error = serde_json::from_slice::<u8>(b"{").unwrap_err().into();
        assert!(matches!(err, Error::Decode(_)));
        assert!(err.to_string().starts_with("malformed payload"));
    }
}
