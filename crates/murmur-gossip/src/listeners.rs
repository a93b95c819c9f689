//! Subscriber notifier -- fans membership and state events out to local
//! subsystems.
//!
//! Listeners are appended once at wiring time and notified sequentially, in
//! registration order. Replication to the shard replicas always happens
//! before any listener runs, so a listener never observes a state the
//! replicas don't already have. Listener failures are logged and swallowed.

use async_trait::async_trait;
use murmur_protocol::state::{AppStateKey, EndpointState, VersionedValue};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Capability set of a membership subscriber. Every method has a no-op
/// default; implementors override what they care about.
#[async_trait]
pub trait EndpointEventListener: Send + Sync {
    /// A previously unknown endpoint joined.
    async fn on_join(&self, _endpoint: SocketAddr, _state: EndpointState) -> anyhow::Result<()> {
        Ok(())
    }

    /// `key` on `endpoint` is about to change; `old` is the pre-change value.
    async fn before_change(
        &self,
        _endpoint: SocketAddr,
        _key: AppStateKey,
        _old: Option<VersionedValue>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// `key` on `endpoint` changed to `value`.
    async fn on_change(
        &self,
        _endpoint: SocketAddr,
        _key: AppStateKey,
        _value: VersionedValue,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_alive(&self, _endpoint: SocketAddr, _state: EndpointState) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_dead(&self, _endpoint: SocketAddr, _state: EndpointState) -> anyhow::Result<()> {
        Ok(())
    }

    /// The endpoint restarted (new generation). `old_state` is the state
    /// from before the restart; later events carry the new one.
    async fn on_restart(
        &self,
        _endpoint: SocketAddr,
        _old_state: EndpointState,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The endpoint was evicted from membership.
    async fn on_remove(&self, _endpoint: SocketAddr) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered, append-only listener registry.
pub struct Notifier {
    listeners: RwLock<Vec<Arc<dyn EndpointEventListener>>>,
}

macro_rules! notify_each {
    ($self:expr, $event:literal, $call:expr) => {{
        let listeners = $self.listeners.read().await.clone();
        for listener in listeners {
            #[allow(clippy::redundant_closure_call)]
            if let Err(e) = ($call)(listener).await {
                tracing::warn!(event = $event, "gossip: listener failed: {e:#}");
            }
        }
    }};
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, listener: Arc<dyn EndpointEventListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn on_join(&self, endpoint: SocketAddr, state: &EndpointState) {
        notify_each!(self, "on_join", |l: Arc<dyn EndpointEventListener>| async move {
            l.on_join(endpoint, state.clone()).await
        });
    }

    pub async fn before_change(
        &self,
        endpoint: SocketAddr,
        key: AppStateKey,
        old: Option<&VersionedValue>,
    ) {
        notify_each!(self, "before_change", |l: Arc<dyn EndpointEventListener>| async move {
            l.before_change(endpoint, key, old.cloned()).await
        });
    }

    pub async fn on_change(&self, endpoint: SocketAddr, key: AppStateKey, value: &VersionedValue) {
        notify_each!(self, "on_change", |l: Arc<dyn EndpointEventListener>| async move {
            l.on_change(endpoint, key, value.clone()).await
        });
    }

    pub async fn on_alive(&self, endpoint: SocketAddr, state: &EndpointState) {
        notify_each!(self, "on_alive", |l: Arc<dyn EndpointEventListener>| async move {
            l.on_alive(endpoint, state.clone()).await
        });
    }

    pub async fn on_dead(&self, endpoint: SocketAddr, state: &EndpointState) {
        notify_each!(self, "on_dead", |l: Arc<dyn EndpointEventListener>| async move {
            l.on_dead(endpoint, state.clone()).await
        });
    }

    pub async fn on_restart(&self, endpoint: SocketAddr, old_state: &EndpointState) {
        notify_each!(self, "on_restart", |l: Arc<dyn EndpointEventListener>| async move {
            l.on_restart(endpoint, old_state.clone()).await
        });
    }

    pub async fn on_remove(&self, endpoint: SocketAddr) {
        notify_each!(self, "on_remove", |l: Arc<dyn EndpointEventListener>| async move {
            l.on_remove(endpoint).await
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
