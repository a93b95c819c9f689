//! The gossiper -- coordinator-side engine tying the store, the anti-entropy
//! rounds, the failure detector and the membership pipeline together.
//!
//! Lifecycle: DISABLED -> SHADOW_ROUND -> RUNNING -> STOPPING -> STOPPED.
//! One instance per node, shared behind an Arc between the transport, the
//! admin surface and the background loops.

use murmur_protocol::messages::{GossipDigestSyn, Message, ShutdownAnnounce};
use murmur_protocol::params::PARAMS;
use murmur_protocol::state::{AppStateKey, Digest, EndpointState, Generation, Status};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::config::GossipConfig;
use crate::exchange::Backlog;
use crate::listeners::{EndpointEventListener, Notifier};
use crate::net::NetHandle;
use crate::pinger::DirectPinger;
use crate::shard::EndpointRecord;
use crate::store::StateStore;
use crate::version::{GenerationSource, VersionGenerator};
use crate::GossipError;

// ============================================================================
// Ring view -- external token-metadata collaborator
// ============================================================================

/// Minimal view of the token ring, provided by the storage layer. A peer that
/// gossips but is not a ring member is a fat client and is reaped after a
/// silence timeout.
pub trait RingView: Send + Sync {
    fn is_ring_member(&self, addr: &SocketAddr) -> bool;
}

/// Default ring view: every peer is a member, so nothing is ever treated as
/// a fat client.
pub struct AllMembersRing;

impl RingView for AllMembersRing {
    fn is_ring_member(&self, _addr: &SocketAddr) -> bool {
        true
    }
}

// ============================================================================
// Lifecycle + stats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipStatus {
    Disabled,
    ShadowRound,
    Running,
    Stopping,
    Stopped,
}

/// Round and exchange counters, exposed through the admin surface.
#[derive(Default)]
pub struct GossipStats {
    pub rounds: AtomicU64,
    pub syns_sent: AtomicU64,
    pub acks_sent: AtomicU64,
    pub ack2s_sent: AtomicU64,
    pub deltas_applied: AtomicU64,
    pub echoes_served: AtomicU64,
    pub convictions: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub rounds: u64,
    pub syns_sent: u64,
    pub acks_sent: u64,
    pub ack2s_sent: u64,
    pub deltas_applied: u64,
    pub echoes_served: u64,
    pub convictions: u64,
}

impl GossipStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rounds: self.rounds.load(Ordering::Relaxed),
            syns_sent: self.syns_sent.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            ack2s_sent: self.ack2s_sent.load(Ordering::Relaxed),
            deltas_applied: self.deltas_applied.load(Ordering::Relaxed),
            echoes_served: self.echoes_served.load(Ordering::Relaxed),
            convictions: self.convictions.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Gossiper
// ============================================================================

pub struct Gossiper {
    pub(crate) cfg: GossipConfig,
    pub(crate) local_addr: SocketAddr,
    pub(crate) versions: VersionGenerator,
    pub(crate) generation: GenerationSource,
    /// Our generation at process start; basis of the corrupt-generation bound.
    pub(crate) start_generation: AtomicI32,
    pub(crate) store: StateStore,
    pub(crate) notifier: Notifier,
    pub(crate) net: NetHandle,
    pub(crate) ring: Arc<dyn RingView>,
    pub(crate) pinger: Arc<DirectPinger>,
    pub(crate) stats: GossipStats,

    status: std::sync::RwLock<GossipStatus>,
    pub(crate) advertise: AtomicBool,
    pub(crate) seeds: RwLock<BTreeSet<SocketAddr>>,

    /// FIFO of address chunks still to be contacted this fan-out cycle.
    pub(crate) talk_queue: Mutex<VecDeque<Vec<SocketAddr>>>,
    pub(crate) pending_mark_alive: Mutex<HashSet<SocketAddr>>,
    pub(crate) syn_backlog: Mutex<HashMap<SocketAddr, Backlog<GossipDigestSyn>>>,
    pub(crate) ack_backlog:
        Mutex<HashMap<SocketAddr, Backlog<murmur_protocol::messages::GossipDigestAck>>>,
    /// Bounds concurrent bulk state application.
    pub(crate) apply_sem: Arc<Semaphore>,
    /// Held while a round callback executes; stop() waits on it.
    pub(crate) round_sem: Arc<Semaphore>,
    /// Gate for background verb handlers and mark-alive handshakes.
    pub(crate) tracker: TaskTracker,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    /// Significant exchanges currently being applied (settle bookkeeping).
    pub(crate) in_flight_significant: AtomicI64,
    /// Shadow-round success flag.
    pub(crate) shadow_got_response: AtomicBool,

    /// Previous round's live/unreachable view, for change detection.
    liveness_shadow: Mutex<(Vec<SocketAddr>, Vec<SocketAddr>)>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Gossiper {
    pub fn new(
        cfg: GossipConfig,
        local_addr: SocketAddr,
        net: NetHandle,
        ring: Arc<dyn RingView>,
    ) -> Arc<Self> {
        let shards = cfg.shards.max(1);
        let (shutdown_tx, _) = broadcast::channel(4);
        let pinger = DirectPinger::new(net.clone(), shards, cfg.echo_grace());
        Arc::new(Self {
            store: StateStore::new(shards),
            versions: VersionGenerator::new(),
            generation: GenerationSource::new(0),
            start_generation: AtomicI32::new(0),
            notifier: Notifier::new(),
            ring,
            pinger,
            stats: GossipStats::default(),
            status: std::sync::RwLock::new(GossipStatus::Disabled),
            advertise: AtomicBool::new(cfg.advertise_myself),
            seeds: RwLock::new(BTreeSet::new()),
            talk_queue: Mutex::new(VecDeque::new()),
            pending_mark_alive: Mutex::new(HashSet::new()),
            syn_backlog: Mutex::new(HashMap::new()),
            ack_backlog: Mutex::new(HashMap::new()),
            apply_sem: Arc::new(Semaphore::new(1)),
            round_sem: Arc::new(Semaphore::new(1)),
            tracker: TaskTracker::new(),
            shutdown_tx,
            in_flight_significant: AtomicI64::new(0),
            shadow_got_response: AtomicBool::new(false),
            liveness_shadow: Mutex::new((Vec::new(), Vec::new())),
            loop_handles: Mutex::new(Vec::new()),
            cfg,
            local_addr,
            net,
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> GossipStatus {
        *self.status.read().expect("status lock")
    }

    pub(crate) fn set_status(&self, status: GossipStatus) {
        *self.status.write().expect("status lock") = status;
    }

    pub fn is_running(&self) -> bool {
        self.status() == GossipStatus::Running
    }

    pub fn is_shadow_round(&self) -> bool {
        self.status() == GossipStatus::ShadowRound
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn pinger(&self) -> &Arc<DirectPinger> {
        &self.pinger
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn seeds(&self) -> BTreeSet<SocketAddr> {
        self.seeds.read().await.clone()
    }

    pub async fn register(&self, listener: Arc<dyn EndpointEventListener>) {
        self.notifier.register(listener).await;
    }

    /// Operational toggle: when off, Echo probes are rejected and no peer
    /// will mark this node UP.
    pub fn set_advertise(&self, advertise: bool) {
        self.advertise.store(advertise, Ordering::SeqCst);
    }

    pub(crate) fn shutdown_rx(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Inbound dispatch gate
    // ------------------------------------------------------------------

    /// Submit a one-way verb for background handling. Admitted only while
    /// the gate is open; handler failures are logged by verb name.
    pub fn dispatch(self: &Arc<Self>, msg: Message) {
        let admitted = match (&msg, self.status()) {
            (Message::Syn(_), GossipStatus::Running) => true,
            (Message::Ack(_) | Message::Ack2(_), GossipStatus::Running | GossipStatus::ShadowRound) => {
                true
            }
            (Message::Shutdown(_), GossipStatus::Running) => true,
            _ => false,
        };
        if !admitted || self.tracker.is_closed() {
            tracing::trace!(verb = msg.variant(), status = ?self.status(), "gossip: dropping verb (gate closed)");
            return;
        }

        let this = self.clone();
        self.tracker.spawn(async move {
            let verb = msg.variant();
            let result = match msg {
                Message::Syn(syn) => this.handle_syn(syn).await,
                Message::Ack(ack) => this.handle_ack(ack).await,
                Message::Ack2(ack2) => this.handle_ack2(ack2).await,
                Message::Shutdown(ann) => this.handle_shutdown_announce(ann).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(verb, "gossip: verb handler failed: {e:#}");
            }
        });
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Enable gossip: install the local state, arm the periodic round and
    /// the active failure detector.
    pub async fn start_gossiping(
        self: &Arc<Self>,
        generation: Generation,
        preload: Vec<(AppStateKey, String)>,
        advertise: bool,
    ) -> Result<(), GossipError> {
        match self.status() {
            GossipStatus::Disabled => {}
            other => {
                return Err(GossipError::Administrative(format!(
                    "cannot start gossiping from state {other:?}"
                )))
            }
        }

        self.generation
            .force_to(generation);
        self.start_generation.store(generation, Ordering::SeqCst);
        self.advertise
            .store(self.cfg.advertise_myself && advertise, Ordering::SeqCst);
        self.pinger.set_generation(generation);

        // Seeds never include ourselves.
        {
            let mut seeds = self.seeds.write().await;
            seeds.extend(self.cfg.seeds.iter().copied().filter(|a| *a != self.local_addr));
            tracing::info!(seeds = ?seeds, "gossip: seed list");
        }

        // Install the local endpoint state.
        let mut state = EndpointState::new(generation);
        state.heartbeat.version = self.versions.next();
        for (key, value) in preload {
            let version = self.versions.next();
            state
                .application_states
                .insert(key, murmur_protocol::state::VersionedValue::new(value, version));
        }
        {
            let _permit = self.store.lock_endpoint(self.local_addr).await;
            let mut rec = EndpointRecord::new(state);
            rec.alive = true;
            self.store.put(self.local_addr, rec).await;
        }
        self.store.replicate_liveness().await;

        self.set_status(GossipStatus::Running);
        tracing::info!(
            local = %self.local_addr,
            generation,
            cluster = %self.cfg.cluster_name,
            "gossip: started"
        );

        let mut handles = self.loop_handles.lock().await;
        handles.push(tokio::spawn(self.clone().run_round_loop()));
        handles.push(tokio::spawn(self.clone().run_failure_detector_loop()));
        Ok(())
    }

    /// Graceful stop: announce SHUTDOWN, disable scheduling, drain.
    pub async fn stop_gossiping(self: &Arc<Self>) {
        match self.status() {
            GossipStatus::Running => {}
            GossipStatus::Stopped | GossipStatus::Stopping => return,
            _ => {
                self.set_status(GossipStatus::Stopped);
                return;
            }
        }
        self.set_status(GossipStatus::Stopping);
        tracing::info!("gossip: announcing shutdown to live peers");

        // The shutdown notice must outrank anything we ever gossiped.
        self.versions.force_highest_possible_version_unsafe();
        if let Err(e) = self
            .add_local_application_state(AppStateKey::Status, Status::Shutdown.as_str().into())
            .await
        {
            tracing::warn!("gossip: failed to publish shutdown status: {e}");
        }

        let announce = ShutdownAnnounce {
            from: self.local_addr,
            generation: Some(self.generation.current()),
        };
        for peer in self.store.live_snapshot().await {
            let _ = self.net.send_shutdown(peer, announce.clone()).await;
        }
        tokio::time::sleep(self.cfg.shutdown_announce).await;

        // Stop the loops, wait for the in-flight round, drain the gate.
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = self.loop_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        let _round_permit = self
            .round_sem
            .acquire()
            .await
            .expect("round semaphore never closed");
        self.tracker.close();
        self.tracker.wait().await;

        self.set_status(GossipStatus::Stopped);
        tracing::info!("gossip: stopped");
    }

    // ------------------------------------------------------------------
    // Periodic round
    // ------------------------------------------------------------------

    async fn run_round_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.round_interval) => {}
                _ = shutdown.recv() => {
                    tracing::debug!("gossip: round loop stopping");
                    return;
                }
            }
            let _permit = self
                .round_sem
                .acquire()
                .await
                .expect("round semaphore never closed");
            if !self.is_running() {
                return;
            }
            self.run_round().await;
        }
    }

    /// One anti-entropy round.
    pub(crate) async fn run_round(self: &Arc<Self>) {
        self.stats.rounds.fetch_add(1, Ordering::Relaxed);

        // 1. Bump our own heartbeat so every round is observable.
        {
            let _permit = self.store.lock_endpoint(self.local_addr).await;
            if let Some(mut rec) = self.store.get(&self.local_addr).await {
                rec.state.heartbeat.version = self.versions.next();
                rec.update_ts = std::time::Instant::now();
                self.store.put(self.local_addr, rec).await;
            }
        }
        self.pinger.set_generation(self.generation.current());

        // 2. Random digests over everything we know.
        let digests = self.build_random_digests().await;
        let syn = GossipDigestSyn {
            from: self.local_addr,
            cluster_name: self.cfg.cluster_name.clone(),
            partitioner: self.cfg.partitioner.clone(),
            digests,
        };

        // 3. Round-robin chunk of live peers (seeds when nobody is live).
        let targets = self.next_round_targets().await;
        for target in &targets {
            self.stats.syns_sent.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(to = %target, "gossip: sending SYN");
            let _ = self.net.send_syn(*target, syn.clone()).await;
        }

        // 4. Probabilistic probe of the unreachable set.
        self.maybe_gossip_to_unreachable(&syn).await;

        // 5. Reap fat clients, expired dead peers, stale quarantine entries.
        self.do_status_check().await;

        // 6. Mirror liveness to the shards when it changed this round.
        self.sync_liveness_to_shards().await;
    }

    async fn build_random_digests(&self) -> Vec<Digest> {
        let snapshot = self.store.snapshot().await;
        let mut digests: Vec<Digest> = snapshot
            .iter()
            .map(|(addr, rec)| {
                Digest::new(*addr, rec.state.generation(), rec.state.max_version())
            })
            .collect();
        digests.shuffle(&mut rand::thread_rng());
        digests
    }

    /// Pop the next chunk of peers to SYN. Refills with ceil(live/10)-sized
    /// chunks of a freshly shuffled live set, or one all-seeds chunk when no
    /// peer is live.
    async fn next_round_targets(&self) -> Vec<SocketAddr> {
        let mut live = self.store.live_snapshot().await;
        live.shuffle(&mut rand::thread_rng());
        let seeds: Vec<SocketAddr> = self.seeds.read().await.iter().copied().collect();

        let mut queue = self.talk_queue.lock().await;
        if queue.is_empty() && !live.is_empty() {
            let chunk = live.len().div_ceil(PARAMS.fanout_rounds);
            for part in live.chunks(chunk.max(1)) {
                queue.push_back(part.to_vec());
            }
        }
        if queue.is_empty() && !seeds.is_empty() {
            queue.push_back(seeds);
        }
        queue.pop_front().unwrap_or_default()
    }

    /// With probability unreachable/(live+1), SYN one random non-LEFT
    /// unreachable peer so partitions heal.
    async fn maybe_gossip_to_unreachable(&self, syn: &GossipDigestSyn) {
        let live_count = self.store.live_snapshot().await.len();
        let unreachable = self.store.unreachable_snapshot().await;
        if unreachable.is_empty() {
            return;
        }

        let prob = unreachable.len() as f64 / (live_count as f64 + 1.0);
        if rand::thread_rng().gen::<f64>() >= prob {
            return;
        }

        let mut candidates = Vec::new();
        for (addr, _) in unreachable {
            if let Some(rec) = self.store.get(&addr).await {
                if rec.state.status() != Some(Status::Left) {
                    candidates.push(addr);
                }
            }
        }
        let target = {
            let mut rng = rand::thread_rng();
            candidates.choose(&mut rng).copied()
        };
        if let Some(target) = target {
            tracing::trace!(to = %target, "gossip: probing unreachable peer");
            let _ = self.net.send_syn(target, syn.clone()).await;
        }
    }

    /// Status check: fat clients, expired dead entries, quarantine hygiene.
    pub(crate) async fn do_status_check(self: &Arc<Self>) {
        let fat_client_timeout = self.cfg.fat_client_timeout();
        let quarantine_delay = self.cfg.quarantine_delay();
        let snapshot = self.store.snapshot().await;
        let now_wall = chrono::Utc::now();

        for (addr, rec) in snapshot {
            if addr == self.local_addr {
                continue;
            }

            let dead_status = rec.state.status().map(|s| s.is_dead()).unwrap_or(false);
            let gossip_only = !dead_status && !self.ring.is_ring_member(&addr);
            if gossip_only
                && !self.store.is_quarantined(&addr).await
                && rec.update_ts.elapsed() > fat_client_timeout
            {
                tracing::info!(peer = %addr, "gossip: removing silent fat client");
                self.evict_from_membership(addr).await;
                continue;
            }

            if !rec.alive {
                if let Some(expire) = self.store.expire_time(&addr).await {
                    if now_wall > expire && !self.ring.is_ring_member(&addr) {
                        tracing::info!(peer = %addr, "gossip: evicting expired dead endpoint");
                        self.evict_from_membership(addr).await;
                    }
                }
            }
        }

        for released in self.store.release_quarantined(quarantine_delay).await {
            tracing::debug!(peer = %released, "gossip: quarantine expired");
        }
    }

    /// Fan the live/unreachable sets out to the shards when they changed
    /// since the previous round.
    async fn sync_liveness_to_shards(&self) {
        let live = self.store.live_snapshot().await;
        let mut unreachable: Vec<SocketAddr> = self
            .store
            .unreachable_snapshot()
            .await
            .into_iter()
            .map(|(a, _)| a)
            .collect();
        unreachable.sort();

        let mut shadow = self.liveness_shadow.lock().await;
        if shadow.0 != live || shadow.1 != unreachable {
            *shadow = (live.clone(), unreachable.clone());
            drop(shadow);
            self.store.replicate_liveness().await;
            tracing::debug!(
                live = live.len(),
                unreachable = unreachable.len(),
                "gossip: liveness view replicated"
            );
        }
    }

    // ------------------------------------------------------------------
    // Settling
    // ------------------------------------------------------------------

    /// Block until membership stops churning: the endpoint count must be
    /// stable and no significant exchange in flight for three consecutive
    /// polls. `skip_wait_for_gossip_to_settle` = 0 bypasses, > 0 caps the
    /// number of polls.
    pub async fn wait_for_gossip_to_settle(&self) {
        let force_after = self.cfg.skip_wait_for_gossip_to_settle;
        if force_after == 0 {
            tracing::info!("gossip: settle wait disabled");
            return;
        }

        let required = PARAMS.settle_required_polls;
        let mut shutdown = self.shutdown_rx();
        let mut total: i32 = 0;
        let mut stable: u32 = 0;
        let mut last: Option<usize> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.round_interval) => {}
                _ = shutdown.recv() => return,
            }
            total += 1;

            let count = self.store.endpoint_count().await;
            let in_flight = self.in_flight_significant.load(Ordering::SeqCst);
            if in_flight == 0 && last == Some(count) {
                stable += 1;
            } else {
                stable = 0;
            }
            last = Some(count);

            if stable >= required {
                tracing::info!(endpoints = count, polls = total, "gossip: settled");
                return;
            }
            if force_after > 0 && total >= force_after {
                tracing::warn!(polls = total, "gossip: forcing settle after poll cap");
                return;
            }
            tracing::debug!(endpoints = count, in_flight, stable, "gossip: waiting to settle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_talk_queue_covers_every_live_peer_within_fanout_rounds() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;

        let peers: Vec<SocketAddr> = (7001..7026).map(addr).collect();
        for p in &peers {
            g.store.add_live(*p).await;
        }

        // 25 live peers, chunk = ceil(25/10) = 3: the whole set must be
        // contacted within the fan-out budget of 10 rounds.
        let mut contacted: HashSet<SocketAddr> = HashSet::new();
        for _ in 0..PARAMS.fanout_rounds {
            for target in g.next_round_targets().await {
                contacted.insert(target);
            }
        }
        for p in &peers {
            assert!(contacted.contains(p), "peer {p} was never contacted");
        }
    }

    #[tokio::test]
    async fn test_talk_queue_chunks_never_repeat_within_cycle() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;
        for p in (7001..7013).map(addr) {
            g.store.add_live(p).await;
        }

        // 12 live, chunk = 2: one cycle is 6 pops, each peer exactly once.
        let mut seen: Vec<SocketAddr> = Vec::new();
        for _ in 0..6 {
            seen.extend(g.next_round_targets().await);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test]
    async fn test_talk_queue_falls_back_to_seeds() {
        let mut cfg = test_config();
        cfg.seeds = vec![addr(7100), addr(7101)];
        let (g, _rx) = gossiper(cfg);
        install_running(&g, GEN).await;
        g.seeds.write().await.extend([addr(7100), addr(7101)]);

        let targets = g.next_round_targets().await;
        assert_eq!(
            targets.iter().copied().collect::<BTreeSet<_>>(),
            [addr(7100), addr(7101)].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test]
    async fn test_run_round_bumps_heartbeat_and_sends_syn() {
        let mut cfg = test_config();
        cfg.seeds = vec![addr(7100)];
        let (g, mut rx) = gossiper(cfg);
        install_running(&g, GEN).await;
        g.seeds.write().await.insert(addr(7100));

        let hb_before = g
            .store
            .get(&local_addr())
            .await
            .unwrap()
            .state
            .heartbeat
            .version;
        g.run_round().await;
        let hb_after = g
            .store
            .get(&local_addr())
            .await
            .unwrap()
            .state
            .heartbeat
            .version;
        assert!(hb_after > hb_before, "every round must bump the heartbeat");

        match rx.recv().await.unwrap() {
            crate::net::NetRequest::Syn { to, msg } => {
                assert_eq!(to, addr(7100));
                assert_eq!(msg.cluster_name, "test-cluster");
                assert_eq!(msg.digests.len(), 1);
                assert_eq!(msg.digests[0].endpoint, local_addr());
            }
            other => panic!("expected SYN to the seed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_settle_wait_bypass_and_poll_cap() {
        let mut cfg = test_config();
        cfg.skip_wait_for_gossip_to_settle = 0;
        let (g, _rx) = gossiper(cfg);
        install_running(&g, GEN).await;
        // Bypass returns immediately.
        tokio::time::timeout(Duration::from_millis(50), g.wait_for_gossip_to_settle())
            .await
            .expect("bypass must not block");

        let mut cfg = test_config();
        cfg.skip_wait_for_gossip_to_settle = 2;
        let (g, _rx) = gossiper(cfg);
        install_running(&g, GEN).await;
        // Poll cap: two polls at 20 ms each, forced exit well under a second.
        tokio::time::timeout(Duration::from_secs(1), g.wait_for_gossip_to_settle())
            .await
            .expect("poll cap must bound the wait");
    }

    #[tokio::test]
    async fn test_settle_requires_three_stable_polls() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;

        let started = tokio::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(2), g.wait_for_gossip_to_settle())
            .await
            .expect("stable view must settle");
        // At least required+1 polls at 20 ms each.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    struct EmptyRing;
    impl RingView for EmptyRing {
        fn is_ring_member(&self, _addr: &SocketAddr) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_status_check_reaps_silent_fat_client() {
        let (net, _rx) = crate::net::NetHandle::channel(64);
        let g = Gossiper::new(test_config(), local_addr(), net, Arc::new(EmptyRing));
        install_running(&g, GEN).await;
        let listener = RecordingListener::new();
        g.register(listener.clone()).await;

        let b = addr(7001);
        let state = remote_state(500, 1, &[(AppStateKey::Status, "NORMAL", 1)]);
        {
            let _permit = g.store.lock_endpoint(b).await;
            let mut rec = EndpointRecord::new(state);
            // Silent for longer than the fat-client timeout.
            let Some(stale) = std::time::Instant::now()
                .checked_sub(g.cfg.fat_client_timeout() + Duration::from_secs(5))
            else {
                return; // monotonic clock too young to backdate; nothing to test
            };
            rec.update_ts = stale;
            g.store.put(b, rec).await;
        }

        g.do_status_check().await;

        assert!(g.store.get(&b).await.is_none(), "fat client must be reaped");
        assert!(g.store.is_quarantined(&b).await);
        assert!(listener.events().contains(&"remove:7001".to_string()));
    }

    #[tokio::test]
    async fn test_status_check_keeps_fresh_fat_client() {
        let (net, _rx) = crate::net::NetHandle::channel(64);
        let g = Gossiper::new(test_config(), local_addr(), net, Arc::new(EmptyRing));
        install_running(&g, GEN).await;

        let b = addr(7001);
        let state = remote_state(500, 1, &[(AppStateKey::Status, "NORMAL", 1)]);
        {
            let _permit = g.store.lock_endpoint(b).await;
            g.store.put(b, EndpointRecord::new(state)).await;
        }

        g.do_status_check().await;
        assert!(g.store.get(&b).await.is_some());
    }

    #[tokio::test]
    async fn test_status_check_evicts_expired_dead_endpoint() {
        let (net, _rx) = crate::net::NetHandle::channel(64);
        let g = Gossiper::new(test_config(), local_addr(), net, Arc::new(EmptyRing));
        install_running(&g, GEN).await;

        let b = addr(7001);
        // LEFT is a dead status, so the fat-client path does not apply.
        let state = remote_state(500, 1, &[(AppStateKey::Status, "LEFT", 1)]);
        {
            let _permit = g.store.lock_endpoint(b).await;
            g.store.put(b, EndpointRecord::new(state)).await;
        }
        g.store
            .set_expire_time(b, chrono::Utc::now() - chrono::Duration::seconds(10))
            .await;

        g.do_status_check().await;
        assert!(g.store.get(&b).await.is_none());
        assert!(g.store.is_quarantined(&b).await);
    }

    #[tokio::test]
    async fn test_dispatch_gate_drops_when_disabled() {
        let (g, mut rx) = gossiper(test_config());
        // Still disabled: a SYN must not produce an ACK.
        g.dispatch(Message::Syn(GossipDigestSyn {
            from: addr(8000),
            cluster_name: "test-cluster".into(),
            partitioner: String::new(),
            digests: vec![],
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let mut cfg = test_config();
        cfg.seeds = vec![addr(7100)];
        let (g, rx) = gossiper(cfg);
        let responder = spawn_echo_responder(rx, true);

        assert_eq!(g.status(), GossipStatus::Disabled);
        g.start_gossiping(
            GEN,
            vec![
                (AppStateKey::Status, "NORMAL".into()),
                (AppStateKey::HostId, "host-a".into()),
            ],
            true,
        )
        .await
        .unwrap();
        assert_eq!(g.status(), GossipStatus::Running);

        let rec = g.store.get(&local_addr()).await.unwrap();
        assert!(rec.alive);
        assert_eq!(rec.state.status(), Some(Status::Normal));
        assert_eq!(rec.state.generation(), GEN);

        g.stop_gossiping().await;
        assert_eq!(g.status(), GossipStatus::Stopped);

        // The shutdown notice carries the forced-highest version.
        let rec = g.store.get(&local_addr()).await.unwrap();
        assert_eq!(rec.state.status(), Some(Status::Shutdown));
        assert_eq!(rec.state.get(AppStateKey::Status).unwrap().version, i32::MAX);
        responder.abort();
    }

    #[tokio::test]
    async fn test_stop_announces_shutdown_to_live_peers() {
        let (g, mut rx) = gossiper(test_config());
        install_running(&g, GEN).await;
        let b = addr(7001);
        {
            let _permit = g.store.lock_endpoint(b).await;
            let mut rec = EndpointRecord::new(remote_state(500, 1, &[]));
            rec.alive = true;
            g.store.put(b, rec).await;
        }
        g.store.add_live(b).await;

        g.stop_gossiping().await;

        let mut saw_shutdown = false;
        while let Ok(req) = rx.try_recv() {
            if let crate::net::NetRequest::Shutdown { to, msg } = req {
                assert_eq!(to, b);
                assert_eq!(msg.from, local_addr());
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown, "live peers must receive the shutdown verb");
    }
}
