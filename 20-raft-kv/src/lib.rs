//! Replicated key-value coordination layer over raft.
//!
//! Every node exposes the same HTTP API. Writes are replicated through the
//! raft log and applied to a sled-backed store on every replica; a node that
//! is not the leader forwards writes to the leader it last saw recorded in
//! the store. Reads are served locally and may be stale.
//!
//! # Architecture
//!
//! - **Raft worker thread**: owns the [`node::RaftNode`], drives ticks, peer
//!   messages and proposals. Async callers reach it through
//!   [`runtime::RaftHandle`], which implements [`consensus::Consensus`].
//! - **Peer transport threads**: one listener plus one sender per peer,
//!   exchanging length-prefixed raft messages.
//! - **Tokio tasks**: the axum server, the leader locator watching for
//!   leadership changes, and the membership coordinator joining the cluster.
//!
//! The rest of the crate only talks to raft through [`consensus::Consensus`],
//! so routing, membership and the HTTP handlers are tested against a stub.

pub mod api;
pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod forward;
pub mod fsm;
pub mod locator;
pub mod membership;
pub mod node;
pub mod router;
pub mod runtime;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod transfer;
pub mod transport;

pub use config::{NodeConfig, NodeOptions};
pub use error::{Error, Result};
pub use server::{RunningNode, launch};
