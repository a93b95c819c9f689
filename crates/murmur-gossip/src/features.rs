//! Feature negotiation listener.
//!
//! Tracks each peer's SUPPORTED_FEATURES value, persists it through the
//! system store, and computes the cluster-common feature set at settle time.
//! A feature is enabled cluster-wide only when every live peer and every
//! saved peer advertises it.

use async_trait::async_trait;
use murmur_protocol::state::{AppStateKey, VersionedValue};
use murmur_storage::SystemStore;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::listeners::EndpointEventListener;

/// Parse a comma-separated feature string.
pub fn parse_features(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Intersection of feature sets across peers. Empty input yields the empty
/// set (no peers means nothing negotiated, not everything).
pub fn common_features<'a>(
    sets: impl IntoIterator<Item = &'a BTreeSet<String>>,
) -> BTreeSet<String> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    iter.fold(first.clone(), |acc, s| {
        acc.intersection(s).cloned().collect()
    })
}

/// Listener persisting per-peer features and maintaining an in-memory view.
pub struct FeatureListener {
    store: Arc<dyn SystemStore>,
    known: RwLock<HashMap<SocketAddr, BTreeSet<String>>>,
}

impl FeatureListener {
    pub fn new(store: Arc<dyn SystemStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            known: RwLock::new(HashMap::new()),
        })
    }

    /// Seed the in-memory view from the persisted rows.
    pub async fn load_saved(&self) -> anyhow::Result<Vec<(SocketAddr, String)>> {
        let saved = self.store.load_peer_features()?;
        let mut known = self.known.write().await;
        for (peer, features) in &saved {
            known.insert(*peer, parse_features(features));
        }
        Ok(saved)
    }

    /// Cluster-common features across every peer seen so far.
    pub async fn cluster_features(&self) -> BTreeSet<String> {
        let known = self.known.read().await;
        common_features(known.values())
    }
}

#[async_trait]
impl EndpointEventListener for FeatureListener {
    async fn on_change(
        &self,
        endpoint: SocketAddr,
        key: AppStateKey,
        value: VersionedValue,
    ) -> anyhow::Result<()> {
        if key != AppStateKey::SupportedFeatures {
            return Ok(());
        }
        self.store.save_peer_features(endpoint, &value.value)?;
        self.known
            .write()
            .await
            .insert(endpoint, parse_features(&value.value));
        tracing::debug!(peer = %endpoint, features = %value.value, "gossip: peer features updated");
        Ok(())
    }

    async fn on_remove(&self, endpoint: SocketAddr) -> anyhow::Result<()> {
        self.store.forget_peer(endpoint)?;
        self.known.write().await.remove(&endpoint);
        Ok(())
    }
}
