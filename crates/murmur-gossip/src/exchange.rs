//! Three-phase digest exchange and state application.
//!
//! SYN and ACK handling is serialised per source peer with coalescing: at
//! most one in-flight handler and one stashed message, newest wins. State
//! application replicates to the shards before any listener observes the
//! change.

use murmur_protocol::messages::{
    EchoReply, EchoRequest, EndpointStateReply, EndpointStateRequest, GossipDigestAck,
    GossipDigestAck2, GossipDigestSyn, ShutdownAnnounce, StateMap,
};
use murmur_protocol::params::PARAMS;
use murmur_protocol::state::{
    AppStateKey, Digest, EndpointState, Status, VersionedValue,
};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::gossiper::Gossiper;
use crate::shard::EndpointRecord;
use crate::GossipError;

/// Per-source coalescing slot: one handler in flight, newest message stashed.
#[derive(Debug)]
pub(crate) struct Backlog<T> {
    pub in_flight: bool,
    pub pending: Option<T>,
}

impl<T> Default for Backlog<T> {
    fn default() -> Self {
        Self {
            in_flight: false,
            pending: None,
        }
    }
}

/// Decrements the in-flight significant counter on every exit path.
struct SignificanceGuard<'a>(&'a AtomicI64);

impl<'a> SignificanceGuard<'a> {
    fn arm(counter: &'a AtomicI64, states: &StateMap) -> Option<Self> {
        if is_significant(states) {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Self(counter))
        } else {
            None
        }
    }
}

impl Drop for SignificanceGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A message counts toward settling only when it carries at least one
/// application-state key outside the high-frequency noise set.
fn is_significant(states: &StateMap) -> bool {
    states.values().any(|st| {
        st.application_states
            .keys()
            .any(|k| !k.is_insignificant())
    })
}

impl Gossiper {
    // ------------------------------------------------------------------
    // SYN
    // ------------------------------------------------------------------

    pub async fn handle_syn(self: &Arc<Self>, syn: GossipDigestSyn) -> anyhow::Result<()> {
        if syn.cluster_name != self.cfg.cluster_name {
            tracing::warn!(
                from = %syn.from,
                theirs = %syn.cluster_name,
                ours = %self.cfg.cluster_name,
                "gossip: dropping SYN from foreign cluster"
            );
            return Ok(());
        }
        if !syn.partitioner.is_empty()
            && !self.cfg.partitioner.is_empty()
            && syn.partitioner != self.cfg.partitioner
        {
            tracing::warn!(
                from = %syn.from,
                theirs = %syn.partitioner,
                ours = %self.cfg.partitioner,
                "gossip: dropping SYN with mismatched partitioner"
            );
            return Ok(());
        }

        let from = syn.from;
        {
            let mut backlog = self.syn_backlog.lock().await;
            let slot = backlog.entry(from).or_default();
            if slot.in_flight {
                tracing::trace!(%from, "gossip: coalescing SYN (newest wins)");
                slot.pending = Some(syn);
                return Ok(());
            }
            slot.in_flight = true;
        }

        let mut current = syn;
        loop {
            self.process_syn(current).await?;

            let next = {
                let mut backlog = self.syn_backlog.lock().await;
                let slot = backlog.entry(from).or_default();
                match slot.pending.take() {
                    Some(p) => Some(p),
                    None => {
                        slot.in_flight = false;
                        None
                    }
                }
            };
            match next {
                Some(p) => current = p,
                None => break,
            }
        }
        Ok(())
    }

    async fn process_syn(self: &Arc<Self>, syn: GossipDigestSyn) -> anyhow::Result<()> {
        let (digests, states) = self.examine_gossiper(syn.digests).await;
        let ack = GossipDigestAck {
            from: self.local_addr,
            digests,
            states,
        };
        self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(to = %syn.from, "gossip: sending ACK");
        self.net.send_ack(syn.from, ack).await?;
        Ok(())
    }

    /// Compare incoming digests against local knowledge. Returns the digests
    /// to request and the state deltas to send, most-diverged endpoints
    /// first.
    pub(crate) async fn examine_gossiper(
        &self,
        mut digests: Vec<Digest>,
    ) -> (Vec<Digest>, StateMap) {
        let snapshot = self.store.snapshot().await;

        // An empty digest list is a shadow probe: discuss everything we know
        // from scratch so the reply carries full states.
        if digests.is_empty() {
            digests = snapshot
                .keys()
                .map(|addr| Digest::new(*addr, 0, 0))
                .collect();
        }

        // Most-diverged endpoints first, so truncated conversations still
        // make progress where it matters.
        digests.sort_by_key(|d| {
            let local_version = snapshot
                .get(&d.endpoint)
                .map(|r| r.state.max_version())
                .unwrap_or(0);
            std::cmp::Reverse((d.max_version as i64 - local_version as i64).abs())
        });

        let mut request_digests = Vec::new();
        let mut send_states = StateMap::new();

        for digest in digests {
            match snapshot.get(&digest.endpoint) {
                None => {
                    // The remote knows an endpoint we don't: ask for all of it.
                    if digest.generation > 0 {
                        request_digests.push(Digest::new(digest.endpoint, digest.generation, 0));
                    }
                }
                Some(rec) => {
                    let local_gen = rec.state.generation();
                    let local_version = rec.state.max_version();

                    if digest.generation > local_gen {
                        request_digests.push(Digest::new(digest.endpoint, digest.generation, 0));
                    } else if digest.generation < local_gen {
                        send_states.insert(digest.endpoint, rec.state.clone());
                    } else if digest.max_version > local_version {
                        request_digests.push(Digest::new(
                            digest.endpoint,
                            digest.generation,
                            local_version,
                        ));
                    } else if digest.max_version < local_version {
                        if let Some(delta) = rec.state.state_above(digest.max_version) {
                            send_states.insert(digest.endpoint, delta);
                        }
                    }
                    // Equal generation and version: nothing to discuss.
                }
            }
        }

        (request_digests, send_states)
    }

    // ------------------------------------------------------------------
    // ACK
    // ------------------------------------------------------------------

    pub async fn handle_ack(self: &Arc<Self>, ack: GossipDigestAck) -> anyhow::Result<()> {
        // Every peer mentioned in the reply is provably reachable via the
        // sender; refresh their freshness timestamps.
        for addr in ack.states.keys() {
            self.store.refresh_timestamp(addr).await;
        }
        for digest in &ack.digests {
            self.store.refresh_timestamp(&digest.endpoint).await;
        }

        let from = ack.from;
        {
            let mut backlog = self.ack_backlog.lock().await;
            let slot = backlog.entry(from).or_default();
            if slot.in_flight {
                tracing::trace!(%from, "gossip: coalescing ACK (newest wins)");
                slot.pending = Some(ack);
                return Ok(());
            }
            slot.in_flight = true;
        }

        let mut current = ack;
        loop {
            self.process_ack(current).await?;

            let next = {
                let mut backlog = self.ack_backlog.lock().await;
                let slot = backlog.entry(from).or_default();
                match slot.pending.take() {
                    Some(p) => Some(p),
                    None => {
                        slot.in_flight = false;
                        None
                    }
                }
            };
            match next {
                Some(p) => current = p,
                None => break,
            }
        }
        Ok(())
    }

    async fn process_ack(self: &Arc<Self>, ack: GossipDigestAck) -> anyhow::Result<()> {
        let shadow = self.is_shadow_round();

        if !ack.states.is_empty() {
            let _guard = SignificanceGuard::arm(&self.in_flight_significant, &ack.states);
            self.apply_state_locally(ack.states, !shadow).await;
        }

        if shadow {
            // The empty-SYN probe got its answer; the shadow round is done.
            self.shadow_got_response.store(true, Ordering::SeqCst);
            return Ok(());
        }

        // Reply with exactly the deltas the peer requested.
        let mut states = StateMap::new();
        for digest in &ack.digests {
            if let Some(rec) = self.store.get(&digest.endpoint).await {
                if let Some(delta) = rec.state.state_above(digest.max_version) {
                    states.insert(digest.endpoint, delta);
                }
            }
        }

        let ack2 = GossipDigestAck2 {
            from: self.local_addr,
            states,
        };
        self.stats.ack2s_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(to = %ack.from, "gossip: sending ACK2");
        self.net.send_ack2(ack.from, ack2).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // ACK2
    // ------------------------------------------------------------------

    pub async fn handle_ack2(self: &Arc<Self>, ack2: GossipDigestAck2) -> anyhow::Result<()> {
        for addr in ack2.states.keys() {
            self.store.refresh_timestamp(addr).await;
        }
        let shadow = self.is_shadow_round();
        if !ack2.states.is_empty() {
            let _guard = SignificanceGuard::arm(&self.in_flight_significant, &ack2.states);
            self.apply_state_locally(ack2.states, !shadow).await;
        }
        if shadow {
            self.shadow_got_response.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // State application
    // ------------------------------------------------------------------

    /// Apply a batch of remote endpoint states. Seeds are handled first so
    /// cluster-wide facts converge quickly; the rest in random order.
    /// `fire_listeners` is false during the shadow round.
    pub(crate) async fn apply_state_locally(
        self: &Arc<Self>,
        states: StateMap,
        fire_listeners: bool,
    ) {
        let mut entries: Vec<(SocketAddr, EndpointState)> = states.into_iter().collect();
        entries.shuffle(&mut rand::thread_rng());
        let seeds = self.seeds.read().await.clone();
        // Stable partition: seeds keep their shuffled relative order up front.
        entries.sort_by_key(|(addr, _)| !seeds.contains(addr));

        for (addr, remote) in entries {
            if addr == self.local_addr && !self.is_shadow_round() {
                continue;
            }
            if self.store.is_quarantined(&addr).await {
                tracing::trace!(peer = %addr, "gossip: dropping state for quarantined endpoint");
                continue;
            }

            let _apply_permit = self
                .apply_sem
                .clone()
                .acquire_owned()
                .await
                .expect("apply semaphore never closed");
            let _endpoint_permit = self.store.lock_endpoint(addr).await;
            self.do_apply_state(addr, remote, fire_listeners).await;
        }
    }

    /// Apply one endpoint's remote state. Caller holds the endpoint lock.
    async fn do_apply_state(
        self: &Arc<Self>,
        addr: SocketAddr,
        remote: EndpointState,
        fire_listeners: bool,
    ) {
        let remote_generation = remote.generation();
        let generation_bound = self
            .start_generation
            .load(Ordering::SeqCst)
            .saturating_add(PARAMS.max_generation_difference_secs);

        match self.store.get(&addr).await {
            None => {
                if remote_generation > generation_bound {
                    tracing::warn!(
                        peer = %addr,
                        remote_generation,
                        bound = generation_bound,
                        "gossip: rejecting corrupt generation for unknown endpoint"
                    );
                    return;
                }
                self.handle_major_state_change(addr, remote, None, fire_listeners)
                    .await;
            }
            Some(local_rec) => {
                let local_generation = local_rec.state.generation();

                if remote_generation > generation_bound {
                    tracing::warn!(
                        peer = %addr,
                        remote_generation,
                        local_generation,
                        bound = generation_bound,
                        "gossip: rejecting corrupt generation"
                    );
                } else if remote_generation > local_generation {
                    self.handle_major_state_change(addr, remote, Some(local_rec), fire_listeners)
                        .await;
                } else if remote_generation == local_generation {
                    let local_version = local_rec.state.max_version();
                    let remote_version = remote.max_version();
                    if remote_version > local_version {
                        self.apply_new_states(addr, local_rec, remote, fire_listeners)
                            .await;
                    } else {
                        tracing::trace!(
                            peer = %addr,
                            local_version,
                            remote_version,
                            "gossip: no newer state"
                        );
                    }
                } else {
                    tracing::trace!(
                        peer = %addr,
                        remote_generation,
                        local_generation,
                        "gossip: ignoring state from older generation"
                    );
                }
            }
        }

        // Independently of the merge outcome: a known, not-alive peer that is
        // not in a dead state gets the mark-alive handshake.
        if fire_listeners {
            if let Some(rec) = self.store.get(&addr).await {
                let dead = rec.state.status().map(|s| s.is_dead()).unwrap_or(false);
                if !rec.alive && !dead && addr != self.local_addr {
                    self.mark_alive(addr).await;
                }
            }
        }
    }

    /// Replace the whole entry: first observation or generation restart.
    /// Caller holds the endpoint lock.
    pub(crate) async fn handle_major_state_change(
        self: &Arc<Self>,
        addr: SocketAddr,
        remote: EndpointState,
        old: Option<EndpointRecord>,
        fire_listeners: bool,
    ) {
        let is_restart = old.is_some();
        if fire_listeners {
            if let Some(ref old_rec) = old {
                // on_restart observes the pre-restart state.
                self.notifier.on_restart(addr, &old_rec.state).await;
            }
        }

        let record = EndpointRecord::new(remote.clone());
        self.store.put(addr, record).await;
        self.store.remove_live(&addr).await;

        tracing::debug!(
            peer = %addr,
            generation = remote.generation(),
            restart = is_restart,
            "gossip: major state change"
        );

        if fire_listeners && !is_restart {
            self.notifier.on_join(addr, &remote).await;
        }

        let dead = remote.status().map(|s| s.is_dead()).unwrap_or(false);
        if dead {
            self.mark_dead_locked(addr).await;
            if fire_listeners {
                self.notifier.on_dead(addr, &remote).await;
            }
        }
        // Live peers re-enter through the mark-alive handshake driven by the
        // caller.
    }

    /// Same-generation merge: adopt every entry with a newer version.
    /// Caller holds the endpoint lock.
    pub(crate) async fn apply_new_states(
        self: &Arc<Self>,
        addr: SocketAddr,
        mut record: EndpointRecord,
        remote: EndpointState,
        fire_listeners: bool,
    ) {
        if remote.heartbeat.version > record.state.heartbeat.version {
            record.state.heartbeat = remote.heartbeat;
        }

        let mut changed: Vec<(AppStateKey, Option<VersionedValue>, VersionedValue)> = Vec::new();
        for (key, value) in &remote.application_states {
            let newer = record
                .state
                .application_states
                .get(key)
                .map(|local| value.version > local.version)
                .unwrap_or(true);
            if newer {
                let old = record.state.application_states.insert(*key, value.clone());
                changed.push((*key, old, value.clone()));
            }
        }

        record.update_ts = std::time::Instant::now();
        // Replication must complete before any listener runs.
        self.store.put(addr, record).await;
        self.stats
            .deltas_applied
            .fetch_add(changed.len() as u64, Ordering::Relaxed);

        if fire_listeners {
            for (key, old, new) in changed {
                self.notifier.before_change(addr, key, old.as_ref()).await;
                self.notifier.on_change(addr, key, &new).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Mark-alive handshake
    // ------------------------------------------------------------------

    /// Two-phase UP transition: only a successful Echo proves the peer is
    /// reachable at its claimed incarnation.
    pub(crate) async fn mark_alive(self: &Arc<Self>, addr: SocketAddr) {
        if !self.is_running() {
            return;
        }
        {
            let mut pending = self.pending_mark_alive.lock().await;
            if !pending.insert(addr) {
                return; // handshake already under way
            }
        }

        let this = self.clone();
        self.tracker.spawn(async move {
            let echo = this
                .net
                .echo(
                    addr,
                    EchoRequest {
                        generation: Some(this.generation.current()),
                    },
                    Duration::from_millis(PARAMS.mark_alive_timeout_ms),
                )
                .await;

            match echo {
                Ok(reply) if reply.accepted => this.real_mark_alive(addr).await,
                Ok(reply) => {
                    tracing::trace!(peer = %addr, reason = ?reply.reason, "gossip: mark-alive echo declined");
                }
                Err(e) => {
                    tracing::trace!(peer = %addr, "gossip: mark-alive echo failed: {e}");
                }
            }
            this.pending_mark_alive.lock().await.remove(&addr);
        });
    }

    async fn real_mark_alive(self: &Arc<Self>, addr: SocketAddr) {
        let _permit = self.store.lock_endpoint(addr).await;
        let Some(mut rec) = self.store.get(&addr).await else {
            return;
        };

        match rec.state.status() {
            Some(Status::Shutdown) => {
                tracing::debug!(peer = %addr, "gossip: not marking shutdown endpoint alive");
                return;
            }
            Some(s) if s.is_dead() => return,
            _ => {}
        }
        if rec.alive {
            return;
        }

        rec.alive = true;
        rec.update_ts = std::time::Instant::now();
        let state = rec.state.clone();
        self.store.put(addr, rec).await;
        self.store.clear_unreachable(&addr).await;
        self.store.clear_expire_time(&addr).await;
        self.store.add_live(addr).await;
        self.store.replicate_liveness().await;
        // Talk to the newly live peer promptly.
        self.talk_queue.lock().await.push_back(vec![addr]);

        tracing::info!(peer = %addr, generation = state.generation(), "gossip: endpoint is now UP");
        self.notifier.on_alive(addr, &state).await;
    }

    // ------------------------------------------------------------------
    // Self-originated state
    // ------------------------------------------------------------------

    /// Publish a local application state. The supplied value is re-stamped
    /// with the next monotonic version before it becomes visible.
    pub async fn add_local_application_state(
        self: &Arc<Self>,
        key: AppStateKey,
        value: String,
    ) -> Result<(), GossipError> {
        let _permit = self.store.lock_endpoint(self.local_addr).await;
        let Some(mut rec) = self.store.get(&self.local_addr).await else {
            return Err(GossipError::NotRunning);
        };

        let version = self.versions.next();
        let new = VersionedValue::new(value, version);
        let old = rec.state.application_states.insert(key, new.clone());
        rec.update_ts = std::time::Instant::now();
        self.store.put(self.local_addr, rec).await;

        self.notifier
            .before_change(self.local_addr, key, old.as_ref())
            .await;
        self.notifier.on_change(self.local_addr, key, &new).await;
        Ok(())
    }

    /// Bump the local generation to `max(now, current + 1)` and republish
    /// our state under it (administrative state pushes must win).
    pub async fn force_newer_generation(self: &Arc<Self>) -> Result<(), GossipError> {
        let generation = self.generation.force_newer();
        let _permit = self.store.lock_endpoint(self.local_addr).await;
        let Some(mut rec) = self.store.get(&self.local_addr).await else {
            return Err(GossipError::NotRunning);
        };
        rec.state.heartbeat.generation = generation;
        rec.state.heartbeat.version = self.versions.next();
        self.store.put(self.local_addr, rec).await;
        self.pinger.set_generation(generation);
        tracing::info!(generation, "gossip: forced newer generation");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request/response verbs
    // ------------------------------------------------------------------

    /// Echo probe handler. Rejected when this node does not advertise.
    pub fn handle_echo(&self, req: &EchoRequest) -> EchoReply {
        self.stats.echoes_served.fetch_add(1, Ordering::Relaxed);
        if !self.advertise.load(Ordering::SeqCst) {
            return EchoReply {
                accepted: false,
                reason: Some("not advertising".into()),
            };
        }
        tracing::trace!(generation = ?req.generation, "gossip: echo served");
        EchoReply {
            accepted: true,
            reason: None,
        }
    }

    /// Shadow-round state pull: a filtered view of everything we know.
    pub async fn handle_state_request(&self, req: &EndpointStateRequest) -> EndpointStateReply {
        let snapshot = self.store.snapshot().await;
        let states: BTreeMap<SocketAddr, EndpointState> = snapshot
            .iter()
            .map(|(addr, rec)| (*addr, rec.state.filtered(&req.wanted_keys)))
            .collect();
        EndpointStateReply { states }
    }

    /// Graceful-shutdown announcement from a peer.
    pub async fn handle_shutdown_announce(
        self: &Arc<Self>,
        ann: ShutdownAnnounce,
    ) -> anyhow::Result<()> {
        if ann.from == self.local_addr {
            return Ok(());
        }
        if let (Some(generation), Some(rec)) =
            (ann.generation, self.store.get(&ann.from).await)
        {
            if generation < rec.state.generation() {
                tracing::debug!(
                    peer = %ann.from,
                    generation,
                    known = rec.state.generation(),
                    "gossip: ignoring stale shutdown announcement"
                );
                return Ok(());
            }
        }
        tracing::info!(peer = %ann.from, "gossip: peer announced shutdown");
        self.mark_as_shutdown(ann.from).await;
        Ok(())
    }

    /// Force a peer into shutdown state: STATUS=SHUTDOWN at the highest
    /// version, dead in the liveness view.
    pub(crate) async fn mark_as_shutdown(self: &Arc<Self>, addr: SocketAddr) {
        let _permit = self.store.lock_endpoint(addr).await;
        let Some(mut rec) = self.store.get(&addr).await else {
            return;
        };
        if !rec.alive && rec.state.status() == Some(Status::Shutdown) {
            return; // already processed
        }
        rec.state.application_states.insert(
            AppStateKey::Status,
            VersionedValue::new(Status::Shutdown.as_str(), i32::MAX),
        );
        rec.alive = false;
        let state = rec.state.clone();
        self.store.put(addr, rec).await;
        self.mark_dead_locked(addr).await;
        self.notifier.on_dead(addr, &state).await;
    }

    // ------------------------------------------------------------------
    // DOWN transitions
    // ------------------------------------------------------------------

    /// Mark a peer dead and notify. Takes the endpoint lock.
    pub(crate) async fn mark_dead(self: &Arc<Self>, addr: SocketAddr) {
        let _permit = self.store.lock_endpoint(addr).await;
        let Some(rec) = self.store.get(&addr).await else {
            return;
        };
        if !rec.alive {
            return;
        }
        let state = rec.state.clone();
        self.mark_dead_locked(addr).await;
        tracing::warn!(peer = %addr, "gossip: endpoint is now DOWN");
        self.notifier.on_dead(addr, &state).await;
    }

    /// DOWN bookkeeping: clear the alive bit, move the peer from the live to
    /// the unreachable set, fan out. Caller holds the endpoint lock and owns
    /// notification.
    pub(crate) async fn mark_dead_locked(self: &Arc<Self>, addr: SocketAddr) {
        let Some(mut rec) = self.store.get(&addr).await else {
            return;
        };
        rec.alive = false;
        self.store.put(addr, rec).await;
        self.store.remove_live(&addr).await;
        self.store.mark_unreachable(addr).await;
        self.store.replicate_liveness().await;
    }
}
