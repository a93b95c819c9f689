//! Gossip core configuration.
//!
//! Wire-observable timing lives in `murmur_protocol::params`; everything here
//! is node-local policy. Defaults mirror the protocol parameters so a plain
//! `GossipConfig::default()` is cluster-compatible; tests shorten intervals.

use murmur_protocol::params::PARAMS;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Peer-checked cluster name; SYNs from a different cluster are dropped.
    pub cluster_name: String,
    /// Peer-checked partitioner name; empty means "don't check".
    pub partitioner: String,
    /// Initial contact addresses. Never emptied at runtime.
    pub seeds: Vec<SocketAddr>,

    /// Basis for the quarantine window and the assassinate verification wait.
    pub ring_delay: Duration,
    /// Echo grace period added on top of the echo interval.
    pub failure_detector_timeout: Duration,
    /// Hard cap for shadow-round convergence.
    pub shadow_round_timeout: Duration,
    /// Retry cadence for shadow-round contacts.
    pub shadow_retry: Duration,
    /// Post-announce sleep before disabling on graceful stop.
    pub shutdown_announce: Duration,

    /// `0` bypasses the settle wait, positive caps the poll count, negative
    /// means wait until settled.
    pub skip_wait_for_gossip_to_settle: i32,
    /// If > 0, overrides the startup generation (operational recovery).
    pub force_gossip_generation: i32,
    /// When off, this node rejects Echo probes and is never marked UP.
    pub advertise_myself: bool,

    /// Number of state replicas beyond the coordinator view.
    pub shards: usize,

    /// Gossip round cadence. Protocol default is 1 s; tests shorten it.
    pub round_interval: Duration,
    /// Echo probe cadence of the active failure detector.
    pub echo_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            cluster_name: "murmur".into(),
            partitioner: String::new(),
            seeds: Vec::new(),
            ring_delay: Duration::from_millis(30_000),
            failure_detector_timeout: Duration::from_millis(20_000),
            shadow_round_timeout: Duration::from_millis(300_000),
            shadow_retry: Duration::from_millis(PARAMS.shadow_retry_ms),
            shutdown_announce: Duration::from_millis(2_000),
            skip_wait_for_gossip_to_settle: -1,
            force_gossip_generation: 0,
            advertise_myself: true,
            shards: 4,
            round_interval: Duration::from_millis(PARAMS.round_interval_ms),
            echo_interval: Duration::from_millis(PARAMS.echo_interval_ms),
        }
    }
}

impl GossipConfig {
    /// Quarantine window: `2 * max(30 s, ring_delay)`.
    pub fn quarantine_delay(&self) -> Duration {
        2 * self
            .ring_delay
            .max(Duration::from_millis(PARAMS.quarantine_floor_ms))
    }

    /// Silence window after which a gossip-only peer is dropped.
    pub fn fat_client_timeout(&self) -> Duration {
        self.quarantine_delay() / 2
    }

    /// Grace window for a single echo probe.
    pub fn echo_grace(&self) -> Duration {
        self.echo_interval + self.failure_detector_timeout
    }
}
