//! Murmur Gossip -- cluster membership and liveness core.
//!
//! Tracks the peer set of a share-nothing database cluster, disseminates
//! per-node application state through SYN/ACK/ACK2 anti-entropy rounds,
//! maintains liveness with an echo-based failure detector, and fans
//! membership events out to local subscribers. The coordinator owns the
//! canonical state; shard replicas are refreshed before any operation
//! completes.

pub mod config;
pub mod detector;
pub mod exchange;
pub mod features;
pub mod gossiper;
pub mod listeners;
pub mod membership;
pub mod net;
pub mod pinger;
pub mod shard;
pub mod store;
pub mod version;

pub use config::GossipConfig;
pub use features::FeatureListener;
pub use gossiper::{AllMembersRing, GossipStatus, Gossiper, RingView, StatsSnapshot};
pub use listeners::{EndpointEventListener, Notifier};
pub use net::{NetError, NetHandle, NetRequest};
pub use pinger::DirectPinger;
pub use shard::{EndpointRecord, ShardReader};
pub use store::StateStore;

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("gossip is not running")]
    NotRunning,
    #[error("shadow round failed: no peer replied within the deadline")]
    ShadowRoundFailed,
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(SocketAddr),
    #[error("endpoint state changed during the verification wait")]
    EndpointStateChanged,
    #[error("operation aborted by shutdown")]
    Aborted,
    #[error("storage error: {0}")]
    Storage(#[from] murmur_storage::StorageError),
    #[error("{0}")]
    Administrative(String),
}
