//! Shard replicas of the authoritative state.
//!
//! The coordinator owns the canonical tables; every shard holds a read-mostly
//! copy refreshed through the `ShardSet` fan-out. Writes never originate on a
//! shard. A coordinator mutation does not complete until every shard has
//! acknowledged the update, so a reader that observes the canonical value is
//! guaranteed the replicas already carry it.

use murmur_protocol::state::EndpointState;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// One peer's entry as held on every shard: wire state plus the node-local
/// liveness judgement.
#[derive(Debug, Clone)]
pub struct EndpointRecord {
    pub state: EndpointState,
    pub alive: bool,
    /// Monotonic instant of the last observed update from this peer.
    pub update_ts: Instant,
}

impl EndpointRecord {
    pub fn new(state: EndpointState) -> Self {
        Self {
            state,
            alive: false,
            update_ts: Instant::now(),
        }
    }
}

/// A shard's copy of the membership view.
#[derive(Debug, Default)]
pub struct ShardView {
    pub endpoint_states: HashMap<SocketAddr, EndpointRecord>,
    pub live_endpoints: Vec<SocketAddr>,
    pub unreachable_endpoints: HashMap<SocketAddr, Instant>,
}

/// Read handle onto one shard's view.
#[derive(Clone)]
pub struct ShardReader {
    view: Arc<RwLock<ShardView>>,
}

impl ShardReader {
    pub async fn get(&self, addr: &SocketAddr) -> Option<EndpointRecord> {
        self.view.read().await.endpoint_states.get(addr).cloned()
    }

    pub async fn live_endpoints(&self) -> Vec<SocketAddr> {
        self.view.read().await.live_endpoints.clone()
    }

    pub async fn unreachable_endpoints(&self) -> Vec<SocketAddr> {
        self.view
            .read()
            .await
            .unreachable_endpoints
            .keys()
            .copied()
            .collect()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.view.read().await.endpoint_states.len()
    }
}

/// The fan-out primitive: single producer (coordinator), N replica views.
pub struct ShardSet {
    shards: Vec<Arc<RwLock<ShardView>>>,
}

impl ShardSet {
    pub fn new(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| Arc::new(RwLock::new(ShardView::default())))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn reader(&self, shard: usize) -> ShardReader {
        ShardReader {
            view: self.shards[shard % self.shards.len()].clone(),
        }
    }

    /// Mirror one endpoint's record onto every shard. Idempotent: replaying
    /// the same record leaves the views unchanged.
    pub async fn replicate_record(&self, addr: SocketAddr, record: &EndpointRecord) {
        for shard in &self.shards {
            shard
                .write()
                .await
                .endpoint_states
                .insert(addr, record.clone());
        }
    }

    /// Mirror the live/unreachable sets and the `alive` bit of every entry.
    /// Only liveness is touched; application state on the shards is left to
    /// `replicate_record`.
    pub async fn replicate_liveness(
        &self,
        live: &[SocketAddr],
        unreachable: &HashMap<SocketAddr, Instant>,
        alive_bits: &HashMap<SocketAddr, bool>,
    ) {
        for shard in &self.shards {
            let mut view = shard.write().await;
            view.live_endpoints = live.to_vec();
            view.unreachable_endpoints = unreachable.clone();
            for (addr, alive) in alive_bits {
                if let Some(rec) = view.endpoint_states.get_mut(addr) {
                    rec.alive = *alive;
                }
            }
        }
    }

    /// Remove an endpoint from every shard.
    pub async fn evict(&self, addr: &SocketAddr) {
        for shard in &self.shards {
            let mut view = shard.write().await;
            view.endpoint_states.remove(addr);
            view.live_endpoints.retain(|a| a != addr);
            view.unreachable_endpoints.remove(addr);
        }
    }
}
