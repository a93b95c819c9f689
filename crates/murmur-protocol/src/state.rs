//! Versioned endpoint state -- the data model gossiped between peers.
//!
//! Each peer owns a heartbeat (generation + version) and a map of
//! application states, every entry carrying a version drawn from the same
//! monotonic counter as the heartbeat. `(generation, max_version)` orders any
//! two observations of one peer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Generation: seconds since epoch at process start, signed 32-bit.
pub type Generation = i32;

/// Version: in-generation monotonic counter, signed 32-bit.
pub type Version = i32;

// ============================================================================
// Application state keys
// ============================================================================

/// The closed set of application-state keys a peer may publish.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStateKey {
    Status,
    Tokens,
    HostId,
    RpcReady,
    Load,
    ViewBacklog,
    CacheHitrates,
    SupportedFeatures,
    InternalIp,
    SnitchName,
    NetVersion,
    RemovalCoordinator,
}

impl AppStateKey {
    /// Keys whose churn does not count against gossip settling. These are
    /// refreshed continuously by healthy nodes and would otherwise keep the
    /// settle poll from ever observing a quiet interval.
    pub fn is_insignificant(self) -> bool {
        matches!(
            self,
            AppStateKey::Load | AppStateKey::ViewBacklog | AppStateKey::CacheHitrates
        )
    }
}

// ============================================================================
// Status values
// ============================================================================

/// Values carried under [`AppStateKey::Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normal,
    Left,
    Removing,
    Removed,
    Shutdown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Normal => "NORMAL",
            Status::Left => "LEFT",
            Status::Removing => "REMOVING",
            Status::Removed => "REMOVED",
            Status::Shutdown => "SHUTDOWN",
        }
    }

    /// Dead states: a peer here is never transitioned back to alive.
    pub fn is_dead(&self) -> bool {
        matches!(self, Status::Left | Status::Removing | Status::Removed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Removal statuses carry a payload after a comma (coordinator host
        // id, expiry timestamp); only the leading token selects the status.
        let head = s.split(',').next().unwrap_or(s);
        match head {
            "NORMAL" => Ok(Status::Normal),
            "LEFT" => Ok(Status::Left),
            "REMOVING" => Ok(Status::Removing),
            "REMOVED" => Ok(Status::Removed),
            "SHUTDOWN" => Ok(Status::Shutdown),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ============================================================================
// Versioned value
// ============================================================================

/// A string value stamped with the version at which it was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: String,
    pub version: Version,
}

impl VersionedValue {
    pub fn new(value: impl Into<String>, version: Version) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }

    /// Parse as a status value. `None` when the value is not a valid status.
    pub fn status(&self) -> Option<Status> {
        self.value.parse().ok()
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Per-peer heartbeat: process incarnation plus in-generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub generation: Generation,
    pub version: Version,
}

impl HeartbeatState {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            version: 0,
        }
    }
}

// ============================================================================
// Endpoint state
// ============================================================================

/// The wire-visible state of one peer: heartbeat plus application states.
///
/// Liveness (`alive`) and freshness timestamps are node-local judgements and
/// are never carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointState {
    pub heartbeat: HeartbeatState,
    #[serde(default)]
    pub application_states: BTreeMap<AppStateKey, VersionedValue>,
}

impl EndpointState {
    pub fn new(generation: Generation) -> Self {
        Self {
            heartbeat: HeartbeatState::new(generation),
            application_states: BTreeMap::new(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.heartbeat.generation
    }

    /// Maximum of the heartbeat version and all application-state versions.
    pub fn max_version(&self) -> Version {
        self.application_states
            .values()
            .map(|v| v.version)
            .chain(std::iter::once(self.heartbeat.version))
            .max()
            .unwrap_or(0)
    }

    pub fn get(&self, key: AppStateKey) -> Option<&VersionedValue> {
        self.application_states.get(&key)
    }

    /// Current status, if published.
    pub fn status(&self) -> Option<Status> {
        self.get(AppStateKey::Status).and_then(|v| v.status())
    }

    /// Subset of this state strictly newer than `version`: the heartbeat if
    /// its counter exceeds the bound, and every application entry above it.
    /// Returns `None` when nothing qualifies.
    pub fn state_above(&self, version: Version) -> Option<EndpointState> {
        let application_states: BTreeMap<AppStateKey, VersionedValue> = self
            .application_states
            .iter()
            .filter(|(_, v)| v.version > version)
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        if application_states.is_empty() && self.heartbeat.version <= version {
            return None;
        }

        Some(EndpointState {
            heartbeat: self.heartbeat,
            application_states,
        })
    }

    /// Copy of this state restricted to `wanted` keys (heartbeat always kept).
    pub fn filtered(&self, wanted: &std::collections::BTreeSet<AppStateKey>) -> EndpointState {
        EndpointState {
            heartbeat: self.heartbeat,
            application_states: self
                .application_states
                .iter()
                .filter(|(k, _)| wanted.contains(k))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }
}

// ============================================================================
// Digest
// ============================================================================

/// Gossip digest: what a peer claims to know about one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub endpoint: std::net::SocketAddr,
    pub generation: Generation,
    pub max_version: Version,
}

impl Digest {
    pub fn new(endpoint: std::net::SocketAddr, generation: Generation, max_version: Version) -> Self {
        Self {
            endpoint,
            generation,
            max_version,
        }
    }
}
