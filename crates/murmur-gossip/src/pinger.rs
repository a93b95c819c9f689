//! Direct failure-detector pinger.
//!
//! An external per-node failure detector addresses peers by a compact
//! numeric endpoint id instead of a socket address. Ids are allocated once
//! on the coordinator; each shard keeps a lazily filled reverse cache it
//! consults before falling back to the allocator.

use murmur_protocol::messages::EchoRequest;
use murmur_protocol::state::Generation;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::net::{NetError, NetHandle};

/// Coordinator-side id allocation table (both directions).
#[derive(Default)]
struct AllocTable {
    forward: HashMap<SocketAddr, u64>,
    reverse: HashMap<u64, SocketAddr>,
}

pub struct DirectPinger {
    net: NetHandle,
    next_id: AtomicU64,
    table: Mutex<AllocTable>,
    /// Per-shard reverse caches, filled on first use.
    shard_caches: Vec<RwLock<HashMap<u64, SocketAddr>>>,
    /// Propagated whenever the local heartbeat generation changes.
    generation: AtomicI32,
    echo_timeout: Duration,
}

impl DirectPinger {
    pub fn new(net: NetHandle, shards: usize, echo_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            net,
            next_id: AtomicU64::new(1),
            table: Mutex::new(AllocTable::default()),
            shard_caches: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            generation: AtomicI32::new(0),
            echo_timeout,
        })
    }

    /// Allocate (or look up) the id for an address. Coordinator only.
    pub async fn allocate_endpoint_id(&self, addr: SocketAddr) -> u64 {
        let mut table = self.table.lock().await;
        if let Some(id) = table.forward.get(&addr) {
            return *id;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        table.forward.insert(addr, id);
        table.reverse.insert(id, addr);
        id
    }

    /// Resolve an id on a shard, filling the shard cache from the
    /// coordinator table on a miss.
    pub async fn endpoint_for_id(&self, shard: usize, id: u64) -> Option<SocketAddr> {
        let cache = &self.shard_caches[shard % self.shard_caches.len()];
        if let Some(addr) = cache.read().await.get(&id) {
            return Some(*addr);
        }
        let addr = self.table.lock().await.reverse.get(&id).copied()?;
        cache.write().await.insert(id, addr);
        Some(addr)
    }

    pub fn set_generation(&self, generation: Generation) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    pub fn generation_number(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    /// Echo the peer behind `id` from `shard`. `true` on success, `false`
    /// when the connection closed under us; other transport failures
    /// propagate. The abort receiver cancels the probe cleanly.
    pub async fn ping(
        &self,
        shard: usize,
        id: u64,
        abort: &mut broadcast::Receiver<()>,
    ) -> Result<bool, NetError> {
        let Some(addr) = self.endpoint_for_id(shard, id).await else {
            return Err(NetError::Transport(format!("unknown endpoint id {id}")));
        };

        let echo = self.net.echo(
            addr,
            EchoRequest {
                generation: Some(self.generation_number()),
            },
            self.echo_timeout,
        );

        tokio::select! {
            result = echo => match result {
                Ok(reply) if reply.accepted => Ok(true),
                Ok(reply) => {
                    tracing::trace!(peer = %addr, reason = ?reply.reason, "fd: echo declined");
                    Ok(false)
                }
                Err(NetError::ConnectionClosed) => Ok(false),
                Err(e) => Err(e),
            },
            _ = abort.recv() => Err(NetError::Shutdown),
        }
    }
}
