//! Authoritative state store (coordinator side).
//!
//! Owns the canonical endpoint-state map and membership tables and mirrors
//! every change onto the shard replicas before the mutating call returns.
//! Mutations of one endpoint are serialised by a keyed unit semaphore; the
//! permit is held across the fan-out so a reader who takes the same lock
//! always observes a post-fan-out view.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::shard::{EndpointRecord, ShardReader, ShardSet};

pub struct StateStore {
    /// Canonical peer -> record map.
    endpoint_states: Mutex<HashMap<SocketAddr, EndpointRecord>>,
    /// Live peers, append-ordered; shuffled by consumers for fairness.
    live_endpoints: Mutex<Vec<SocketAddr>>,
    /// Bumped on every `live_endpoints` mutation.
    live_endpoints_version: AtomicU64,
    /// Peer -> instant of first observed down.
    unreachable_endpoints: Mutex<HashMap<SocketAddr, Instant>>,
    /// Quarantine timestamps of recently removed peers.
    just_removed_endpoints: Mutex<HashMap<SocketAddr, Instant>>,
    /// Wall-clock expiry per dead peer.
    expire_time_endpoint_map: Mutex<HashMap<SocketAddr, DateTime<Utc>>>,
    /// Keyed unit semaphores serialising per-endpoint mutation.
    locks: Mutex<HashMap<SocketAddr, Arc<Semaphore>>>,
    /// Read-mostly replicas.
    shards: ShardSet,
}

impl StateStore {
    pub fn new(shards: usize) -> Self {
        Self {
            endpoint_states: Mutex::new(HashMap::new()),
            live_endpoints: Mutex::new(Vec::new()),
            live_endpoints_version: AtomicU64::new(0),
            unreachable_endpoints: Mutex::new(HashMap::new()),
            just_removed_endpoints: Mutex::new(HashMap::new()),
            expire_time_endpoint_map: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            shards: ShardSet::new(shards),
        }
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Exclusive permit for one endpoint. Dropped on every exit path,
    /// including cancellation.
    pub async fn lock_endpoint(&self, addr: SocketAddr) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(addr)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.acquire_owned().await.expect("endpoint lock never closed")
    }

    // ------------------------------------------------------------------
    // Canonical reads
    // ------------------------------------------------------------------

    pub async fn get(&self, addr: &SocketAddr) -> Option<EndpointRecord> {
        self.endpoint_states.lock().await.get(addr).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<SocketAddr, EndpointRecord> {
        self.endpoint_states.lock().await.clone()
    }

    pub async fn known_endpoints(&self) -> Vec<SocketAddr> {
        self.endpoint_states.lock().await.keys().copied().collect()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoint_states.lock().await.len()
    }

    pub fn reader(&self, shard: usize) -> ShardReader {
        self.shards.reader(shard)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.shard_count()
    }

    // ------------------------------------------------------------------
    // Canonical writes (always fan out before returning)
    // ------------------------------------------------------------------

    /// Install or replace an endpoint's record and mirror it to every shard.
    /// Call under the endpoint lock.
    pub async fn put(&self, addr: SocketAddr, record: EndpointRecord) {
        self.endpoint_states
            .lock()
            .await
            .insert(addr, record.clone());
        self.shards.replicate_record(addr, &record).await;
    }

    /// Refresh the freshness timestamp of a peer, if known. Timestamp-only
    /// refreshes do not fan out; the alive bit travels with the next
    /// liveness snapshot.
    pub async fn refresh_timestamp(&self, addr: &SocketAddr) {
        if let Some(rec) = self.endpoint_states.lock().await.get_mut(addr) {
            rec.update_ts = Instant::now();
        }
    }

    /// Remove an endpoint everywhere: canonical tables, shards, lock map.
    pub async fn evict(&self, addr: &SocketAddr) {
        self.endpoint_states.lock().await.remove(addr);
        self.remove_live(addr).await;
        self.unreachable_endpoints.lock().await.remove(addr);
        self.expire_time_endpoint_map.lock().await.remove(addr);
        self.locks.lock().await.remove(addr);
        self.shards.evict(addr).await;
    }

    // ------------------------------------------------------------------
    // Live set
    // ------------------------------------------------------------------

    pub async fn live_snapshot(&self) -> Vec<SocketAddr> {
        self.live_endpoints.lock().await.clone()
    }

    pub fn live_version(&self) -> u64 {
        self.live_endpoints_version.load(Ordering::SeqCst)
    }

    pub async fn is_live(&self, addr: &SocketAddr) -> bool {
        self.live_endpoints.lock().await.contains(addr)
    }

    /// Append to the live set if absent. Returns true when the set changed.
    pub async fn add_live(&self, addr: SocketAddr) -> bool {
        let mut live = self.live_endpoints.lock().await;
        if live.contains(&addr) {
            return false;
        }
        live.push(addr);
        self.live_endpoints_version.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Remove from the live set. Returns true when the set changed.
    pub async fn remove_live(&self, addr: &SocketAddr) -> bool {
        let mut live = self.live_endpoints.lock().await;
        let before = live.len();
        live.retain(|a| a != addr);
        if live.len() != before {
            self.live_endpoints_version.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Unreachable set
    // ------------------------------------------------------------------

    pub async fn unreachable_snapshot(&self) -> Vec<(SocketAddr, Instant)> {
        self.unreachable_endpoints
            .lock()
            .await
            .iter()
            .map(|(a, t)| (*a, *t))
            .collect()
    }

    /// Record first-observed-down time; keeps the earliest.
    pub async fn mark_unreachable(&self, addr: SocketAddr) {
        self.unreachable_endpoints
            .lock()
            .await
            .entry(addr)
            .or_insert_with(Instant::now);
    }

    pub async fn clear_unreachable(&self, addr: &SocketAddr) {
        self.unreachable_endpoints.lock().await.remove(addr);
    }

    // ------------------------------------------------------------------
    // Quarantine
    // ------------------------------------------------------------------

    pub async fn quarantine(&self, addr: SocketAddr) {
        self.just_removed_endpoints
            .lock()
            .await
            .insert(addr, Instant::now());
    }

    pub async fn is_quarantined(&self, addr: &SocketAddr) -> bool {
        self.just_removed_endpoints.lock().await.contains_key(addr)
    }

    /// Drop quarantine entries older than `delay`; returns the released peers.
    pub async fn release_quarantined(&self, delay: std::time::Duration) -> Vec<SocketAddr> {
        let mut map = self.just_removed_endpoints.lock().await;
        let released: Vec<SocketAddr> = map
            .iter()
            .filter(|(_, t)| t.elapsed() > delay)
            .map(|(a, _)| *a)
            .collect();
        for addr in &released {
            map.remove(addr);
        }
        released
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    pub async fn set_expire_time(&self, addr: SocketAddr, at: DateTime<Utc>) {
        self.expire_time_endpoint_map.lock().await.insert(addr, at);
    }

    pub async fn expire_time(&self, addr: &SocketAddr) -> Option<DateTime<Utc>> {
        self.expire_time_endpoint_map.lock().await.get(addr).copied()
    }

    pub async fn clear_expire_time(&self, addr: &SocketAddr) {
        self.expire_time_endpoint_map.lock().await.remove(addr);
    }

    // ------------------------------------------------------------------
    // Liveness fan-out
    // ------------------------------------------------------------------

    /// Mirror the live/unreachable sets and every record's alive bit onto
    /// all shards.
    pub async fn replicate_liveness(&self) {
        let live = self.live_endpoints.lock().await.clone();
        let unreachable = self.unreachable_endpoints.lock().await.clone();
        let alive_bits: HashMap<SocketAddr, bool> = self
            .endpoint_states
            .lock()
            .await
            .iter()
            .map(|(a, r)| (*a, r.alive))
            .collect();
        self.shards
            .replicate_liveness(&live, &unreachable, &alive_bits)
            .await;
    }
}
