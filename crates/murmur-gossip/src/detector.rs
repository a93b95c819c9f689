//! Active failure detector.
//!
//! While gossip runs, every live peer is probed with an Echo every
//! `echo_interval`. A peer that misses its grace window
//! (`echo_interval + failure_detector_timeout`) is convicted on the
//! coordinator. Probe waves snapshot the live set and its version; a version
//! change invalidates the wave so tasks rebalance promptly.

use murmur_protocol::messages::EchoRequest;
use murmur_protocol::state::Status;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

use crate::gossiper::Gossiper;

impl Gossiper {
    /// Outer loop: one probe wave per live-set version.
    pub(crate) async fn run_failure_detector_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx();
        tracing::debug!("fd: loop started");

        loop {
            if !self.is_running() {
                break;
            }

            let snapshot = self.store.live_snapshot().await;
            if snapshot.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.echo_interval) => continue,
                    _ = shutdown.recv() => break,
                }
            }

            let version = self.store.live_version();
            let mut wave: JoinSet<()> = JoinSet::new();
            for (index, peer) in snapshot.iter().enumerate() {
                // Probe tasks are spread across the shards round-robin.
                let shard = index % self.store.shard_count();
                let this = self.clone();
                let peer = *peer;
                wave.spawn(async move {
                    this.echo_probe_task(peer, shard, version).await;
                });
            }
            while wave.join_next().await.is_some() {}

            // Convict whoever silently fell out of the live set between
            // snapshots. convict() is a no-op for peers already down.
            let now_live: HashSet<SocketAddr> =
                self.store.live_snapshot().await.into_iter().collect();
            for peer in snapshot {
                if !now_live.contains(&peer) {
                    self.convict(peer).await;
                }
            }
        }
        tracing::debug!("fd: loop stopped");
    }

    /// Per-peer probe: echo every interval, convict after the grace window,
    /// exit when the live set is rebalanced or gossip stops.
    async fn echo_probe_task(self: &Arc<Self>, peer: SocketAddr, shard: usize, version: u64) {
        let grace = self.cfg.echo_grace();
        let mut shutdown = self.shutdown_rx();
        let mut last_ok = Instant::now();

        loop {
            if self.store.live_version() != version || !self.is_running() {
                return;
            }

            let echo = self.net.echo(
                peer,
                EchoRequest {
                    generation: Some(self.generation.current()),
                },
                grace,
            );
            tokio::select! {
                result = echo => match result {
                    Ok(reply) if reply.accepted => {
                        last_ok = Instant::now();
                    }
                    Ok(reply) => {
                        tracing::trace!(%peer, shard, reason = ?reply.reason, "fd: echo declined");
                    }
                    Err(e) => {
                        tracing::trace!(%peer, shard, "fd: echo failed: {e}");
                    }
                },
                _ = shutdown.recv() => return,
            }

            if last_ok.elapsed() > grace {
                tracing::warn!(
                    %peer,
                    shard,
                    silent_ms = last_ok.elapsed().as_millis() as u64,
                    "fd: peer exceeded grace window"
                );
                self.convict(peer).await;
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.echo_interval) => {}
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Convict an unresponsive peer. A peer that announced SHUTDOWN is
    /// marked as shut down; anything else is marked dead.
    pub async fn convict(self: &Arc<Self>, peer: SocketAddr) {
        let Some(rec) = self.store.get(&peer).await else {
            return;
        };
        if !rec.alive {
            return;
        }
        self.stats.convictions.fetch_add(1, Ordering::Relaxed);

        if rec.state.status() == Some(Status::Shutdown) {
            self.mark_as_shutdown(peer).await;
        } else {
            self.mark_dead(peer).await;
        }
    }
}
