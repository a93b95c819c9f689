//! Protocol parameters -- the timing and sizing constants peers rely on.
//!
//! These values are observable on the wire (round cadence, echo cadence,
//! generation sanity bound) and must not drift between nodes of one cluster.
//! Node-local tuning (seed lists, shard counts) lives in configuration, not
//! here.

/// The protocol parameter set. All peers of a cluster operate under the same
/// values; changing any of them is a protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    // -- Anti-entropy --
    /// Milliseconds between gossip rounds on the coordinator.
    pub round_interval_ms: u64,
    /// Number of rounds within which every live peer is contacted once.
    /// Per-round chunk size is ceil(live / fanout_rounds).
    pub fanout_rounds: usize,

    // -- Failure detection --
    /// Milliseconds between echo probes to each live peer.
    pub echo_interval_ms: u64,
    /// Deadline for the mark-alive echo handshake, in milliseconds.
    pub mark_alive_timeout_ms: u64,

    // -- State hygiene --
    /// Default expiry horizon for dead endpoint entries (~3 days).
    pub very_long_time_ms: u64,
    /// A remote generation more than this many seconds ahead of the local
    /// process-start generation is rejected as corrupt (1 year).
    pub max_generation_difference_secs: i32,
    /// Lower bound on the quarantine basis: quarantine = 2 * max(this, ring_delay).
    pub quarantine_floor_ms: u64,

    // -- Shadow round --
    /// Per-RPC timeout while collecting shadow-round replies.
    pub shadow_rpc_timeout_ms: u64,
    /// Retry cadence for shadow-round contacts.
    pub shadow_retry_ms: u64,

    // -- Settling --
    /// Consecutive unchanged polls required before gossip counts as settled.
    pub settle_required_polls: u32,
    /// Poll cadence while waiting for gossip to settle.
    pub settle_poll_interval_ms: u64,

    // -- Transport --
    /// Maximum wire message size in bytes.
    pub max_message_bytes: usize,
    /// QUIC idle timeout in seconds.
    pub quic_idle_timeout_secs: u64,
}

/// The active parameter set.
pub const PARAMS: ProtocolParams = ProtocolParams {
    round_interval_ms: 1_000,
    fanout_rounds: 10,

    echo_interval_ms: 2_000,
    mark_alive_timeout_ms: 15_000,

    very_long_time_ms: 3 * 24 * 3_600 * 1_000, // 3 days
    max_generation_difference_secs: 365 * 24 * 3_600, // 1 year of seconds
    quarantine_floor_ms: 30_000,

    shadow_rpc_timeout_ms: 5_000,
    shadow_retry_ms: 1_000,

    settle_required_polls: 3,
    settle_poll_interval_ms: 1_000,

    max_message_bytes: 1024 * 1024, // 1 MiB -- digests plus full state maps
    quic_idle_timeout_secs: 30,
};
