//! Test harness for in-process murmur-node integration tests.
//!
//! Each TestNode runs a real gossiper wired to a real QUIC transport on an
//! ephemeral loopback port, with timers shortened so convergence happens in
//! hundreds of milliseconds.

use async_trait::async_trait;
use murmur_gossip::{
    AllMembersRing, EndpointEventListener, GossipConfig, Gossiper, NetHandle,
};
use murmur_node::transport::GossipTransport;
use murmur_protocol::state::{AppStateKey, EndpointState, VersionedValue};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Base generation used by the test cluster.
pub const BASE_GENERATION: i32 = 1_000_000;

/// Timer profile for in-process clusters.
pub fn fast_config(cluster: &str, seeds: Vec<SocketAddr>) -> GossipConfig {
    GossipConfig {
        cluster_name: cluster.into(),
        partitioner: String::new(),
        seeds,
        ring_delay: Duration::from_millis(100),
        failure_detector_timeout: Duration::from_millis(400),
        shadow_round_timeout: Duration::from_secs(10),
        shadow_retry: Duration::from_millis(50),
        shutdown_announce: Duration::from_millis(50),
        skip_wait_for_gossip_to_settle: -1,
        force_gossip_generation: 0,
        advertise_myself: true,
        shards: 2,
        round_interval: Duration::from_millis(100),
        echo_interval: Duration::from_millis(100),
    }
}

/// Records membership events for assertions.
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn push(&self, ev: String) {
        self.events.lock().unwrap().push(ev);
    }
}

#[async_trait]
impl EndpointEventListener for EventLog {
    async fn on_join(&self, ep: SocketAddr, _: EndpointState) -> anyhow::Result<()> {
        self.push(format!("join:{ep}"));
        Ok(())
    }
    async fn on_alive(&self, ep: SocketAddr, _: EndpointState) -> anyhow::Result<()> {
        self.push(format!("alive:{ep}"));
        Ok(())
    }
    async fn on_dead(&self, ep: SocketAddr, _: EndpointState) -> anyhow::Result<()> {
        self.push(format!("dead:{ep}"));
        Ok(())
    }
    async fn on_restart(&self, ep: SocketAddr, _: EndpointState) -> anyhow::Result<()> {
        self.push(format!("restart:{ep}"));
        Ok(())
    }
    async fn on_change(
        &self,
        ep: SocketAddr,
        key: AppStateKey,
        value: VersionedValue,
    ) -> anyhow::Result<()> {
        self.push(format!("change:{ep}:{key:?}={}", value.value));
        Ok(())
    }
    async fn on_remove(&self, ep: SocketAddr) -> anyhow::Result<()> {
        self.push(format!("remove:{ep}"));
        Ok(())
    }
}

/// One in-process node: gossiper + QUIC transport.
pub struct TestNode {
    pub gossiper: Arc<Gossiper>,
    pub addr: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    pub events: Arc<EventLog>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TestNode {
    /// Bind the transport and wire the gossiper; gossip is not started yet.
    pub async fn build(cluster: &str, seeds: Vec<SocketAddr>) -> anyhow::Result<TestNode> {
        Self::build_with(cluster, seeds, |_| {}).await
    }

    /// Like [`build`], with a hook to adjust the config before wiring.
    pub async fn build_with(
        cluster: &str,
        seeds: Vec<SocketAddr>,
        tweak: impl FnOnce(&mut GossipConfig),
    ) -> anyhow::Result<TestNode> {
        let transport = GossipTransport::new("127.0.0.1:0".parse().unwrap())
            .map_err(|e| anyhow::anyhow!("transport bind failed: {e}"))?;
        let addr = transport.local_addr()?;

        let mut cfg = fast_config(cluster, seeds.clone());
        tweak(&mut cfg);
        let (net, net_rx) = NetHandle::channel(256);
        let gossiper = Gossiper::new(cfg, addr, net, Arc::new(AllMembersRing));

        let events = EventLog::new();
        gossiper.register(events.clone()).await;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        tokio::spawn(
            transport
                .clone()
                .run_outbound(net_rx, shutdown_tx.subscribe()),
        );
        tokio::spawn(
            transport
                .clone()
                .run_accept(gossiper.clone(), shutdown_tx.subscribe()),
        );

        Ok(TestNode {
            gossiper,
            addr,
            seeds,
            events,
            shutdown_tx,
        })
    }

    /// Shadow-round against the seeds (when any), then start gossiping with
    /// a NORMAL status.
    pub async fn join(&self, generation: i32) -> anyhow::Result<()> {
        let contacts: Vec<SocketAddr> = self
            .seeds
            .iter()
            .copied()
            .filter(|a| *a != self.addr)
            .collect();
        if !contacts.is_empty() {
            self.gossiper
                .do_shadow_round(contacts)
                .await
                .map_err(|e| anyhow::anyhow!("shadow round failed: {e}"))?;
        }
        self.gossiper
            .start_gossiping(
                generation,
                vec![
                    (AppStateKey::Status, "NORMAL".into()),
                    (AppStateKey::HostId, format!("host-{}", self.addr.port())),
                ],
                true,
            )
            .await
            .map_err(|e| anyhow::anyhow!("start failed: {e}"))?;
        Ok(())
    }

    /// Live peers as seen by this node.
    pub async fn live(&self) -> Vec<SocketAddr> {
        self.gossiper.store().live_snapshot().await
    }

    /// Poll until this node sees exactly `peers` live, or fail.
    pub async fn wait_live(&self, peers: &[SocketAddr], timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut live = self.live().await;
            live.sort();
            let mut expected = peers.to_vec();
            expected.sort();
            if live == expected {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "node {} timed out waiting for live={expected:?}, have {live:?}",
                    self.addr
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until `f` holds, or fail.
    pub async fn wait_for<F, Fut>(&self, what: &str, timeout: Duration, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if f().await {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("node {} timed out waiting for {what}", self.addr);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop gossip and tear the transport down.
    pub async fn stop(&self) {
        self.gossiper.stop_gossiping().await;
        let _ = self.shutdown_tx.send(());
    }
}
