//! Membership pipeline: eviction, quarantine, administrative removal and the
//! shadow-round bootstrap.

use chrono::Utc;
use murmur_protocol::messages::{EndpointStateRequest, GossipDigestSyn};
use murmur_protocol::params::PARAMS;
use murmur_protocol::state::{AppStateKey, EndpointState, VersionedValue};
use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::gossiper::{GossipStatus, Gossiper};
use crate::net::NetError;
use crate::shard::EndpointRecord;
use crate::GossipError;

/// Keys pulled during the shadow round: enough to make join decisions
/// without waiting for full anti-entropy.
fn shadow_round_keys() -> BTreeSet<AppStateKey> {
    [
        AppStateKey::Status,
        AppStateKey::HostId,
        AppStateKey::Tokens,
        AppStateKey::SupportedFeatures,
        AppStateKey::SnitchName,
    ]
    .into_iter()
    .collect()
}

impl Gossiper {
    // ------------------------------------------------------------------
    // Saved peers
    // ------------------------------------------------------------------

    /// Seed the state map from a persisted peer before gossip starts.
    /// The entry carries generation 0, so any live incarnation wins.
    pub async fn add_saved_endpoint(
        self: &Arc<Self>,
        addr: SocketAddr,
        features: Option<String>,
    ) {
        if addr == self.local_addr {
            return;
        }
        if self.store.get(&addr).await.is_some() {
            return;
        }

        let mut state = EndpointState::new(0);
        if let Some(features) = features {
            state
                .application_states
                .insert(AppStateKey::SupportedFeatures, VersionedValue::new(features, 0));
        }

        let _permit = self.store.lock_endpoint(addr).await;
        self.store.put(addr, EndpointRecord::new(state)).await;
        self.store.mark_unreachable(addr).await;
        tracing::debug!(peer = %addr, "gossip: seeded saved endpoint");
    }

    /// A gossip-only member participates in gossip without being part of the
    /// token ring (a fat client).
    pub async fn is_gossip_only_member(&self, addr: SocketAddr) -> bool {
        let Some(rec) = self.store.get(&addr).await else {
            return false;
        };
        let dead = rec.state.status().map(|s| s.is_dead()).unwrap_or(false);
        !dead && !self.ring.is_ring_member(&addr)
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Remove an endpoint from membership on every shard and quarantine it
    /// so it cannot be re-gossiped straight back in.
    pub async fn evict_from_membership(self: &Arc<Self>, addr: SocketAddr) {
        self.store.evict(&addr).await;
        self.store.quarantine(addr).await;
        self.store.replicate_liveness().await;
        tracing::info!(peer = %addr, "gossip: evicted from membership");
        self.notifier.on_remove(addr).await;
    }

    // ------------------------------------------------------------------
    // Administrative removal
    // ------------------------------------------------------------------

    /// Assassinate: verify the target stays silent for ring_delay, then
    /// force it out with a synthesized LEFT state.
    pub async fn assassinate_endpoint(self: &Arc<Self>, addr: SocketAddr) -> Result<(), GossipError> {
        self.force_remove(addr, true).await
    }

    /// Force-remove without the verification wait.
    pub async fn force_remove_endpoint(self: &Arc<Self>, addr: SocketAddr) -> Result<(), GossipError> {
        self.force_remove(addr, false).await
    }

    async fn force_remove(
        self: &Arc<Self>,
        addr: SocketAddr,
        verify_unchanged: bool,
    ) -> Result<(), GossipError> {
        if addr == self.local_addr {
            return Err(GossipError::Administrative(
                "refusing to remove the local endpoint".into(),
            ));
        }

        let before = self
            .store
            .get(&addr)
            .await
            .map(|r| (r.state.generation(), r.state.heartbeat.version));

        if verify_unchanged && before.is_some() {
            tracing::info!(
                peer = %addr,
                wait_ms = self.cfg.ring_delay.as_millis() as u64,
                "gossip: assassinate waiting for ring delay"
            );
            let mut shutdown = self.shutdown_rx();
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.ring_delay) => {}
                _ = shutdown.recv() => return Err(GossipError::Aborted),
            }

            let after = self
                .store
                .get(&addr)
                .await
                .map(|r| (r.state.generation(), r.state.heartbeat.version));
            match (before, after) {
                (Some(b), Some(a)) if a != b => {
                    return Err(GossipError::EndpointStateChanged);
                }
                (Some(_), None) => {
                    // Target vanished during the wait; continue with the
                    // synthesized state.
                    tracing::warn!(peer = %addr, "gossip: target disappeared during assassinate wait");
                }
                _ => {}
            }
        }

        let old = self.store.get(&addr).await;
        let generation = old
            .as_ref()
            .map(|r| r.state.generation())
            .unwrap_or(0)
            .saturating_add(1);
        let expiry = Utc::now() + chrono::Duration::milliseconds(PARAMS.very_long_time_ms as i64);

        let mut left = EndpointState::new(generation);
        left.heartbeat.version = self.versions.next();
        left.application_states.insert(
            AppStateKey::Status,
            VersionedValue::new(
                format!("LEFT,{}", expiry.timestamp_millis()),
                self.versions.next(),
            ),
        );
        self.store.set_expire_time(addr, expiry).await;

        {
            let _permit = self.store.lock_endpoint(addr).await;
            self.handle_major_state_change(addr, left, old, true).await;
        }
        tracing::info!(peer = %addr, generation, "gossip: synthesized LEFT state installed");

        // Let the LEFT state propagate before the entry disappears.
        let mut shutdown = self.shutdown_rx();
        tokio::select! {
            _ = tokio::time::sleep(4 * self.cfg.round_interval) => {}
            _ = shutdown.recv() => return Err(GossipError::Aborted),
        }

        self.evict_from_membership(addr).await;
        Ok(())
    }

    /// First phase of coordinated removal: STATUS=REMOVING plus the
    /// coordinator's host id, under a bumped generation.
    pub async fn advertise_removing(self: &Arc<Self>, addr: SocketAddr) -> Result<(), GossipError> {
        let old = self
            .store
            .get(&addr)
            .await
            .ok_or(GossipError::UnknownEndpoint(addr))?;
        let coordinator = self.local_host_id().await.unwrap_or_default();

        let generation = old.state.generation().saturating_add(1);
        let mut state = EndpointState::new(generation);
        state.heartbeat.version = self.versions.next();
        state.application_states.insert(
            AppStateKey::Status,
            VersionedValue::new(format!("REMOVING,{coordinator}"), self.versions.next()),
        );
        state.application_states.insert(
            AppStateKey::RemovalCoordinator,
            VersionedValue::new(coordinator, self.versions.next()),
        );

        let _permit = self.store.lock_endpoint(addr).await;
        self.handle_major_state_change(addr, state, Some(old), true)
            .await;
        Ok(())
    }

    /// Second phase: STATUS=REMOVED with an expiry, generation bumped again.
    pub async fn advertise_token_removed(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<(), GossipError> {
        let old = self
            .store
            .get(&addr)
            .await
            .ok_or(GossipError::UnknownEndpoint(addr))?;

        let generation = old.state.generation().saturating_add(1);
        let expiry = Utc::now() + chrono::Duration::milliseconds(PARAMS.very_long_time_ms as i64);
        let mut state = EndpointState::new(generation);
        state.heartbeat.version = self.versions.next();
        state.application_states.insert(
            AppStateKey::Status,
            VersionedValue::new(
                format!("REMOVED,{}", expiry.timestamp_millis()),
                self.versions.next(),
            ),
        );
        self.store.set_expire_time(addr, expiry).await;

        let _permit = self.store.lock_endpoint(addr).await;
        self.handle_major_state_change(addr, state, Some(old), true)
            .await;
        Ok(())
    }

    async fn local_host_id(&self) -> Option<String> {
        self.store
            .get(&self.local_addr)
            .await
            .and_then(|r| r.state.get(AppStateKey::HostId).map(|v| v.value.clone()))
    }

    // ------------------------------------------------------------------
    // Shadow round
    // ------------------------------------------------------------------

    /// Bootstrap-time state pull: learn the cluster's view before joining,
    /// without firing listeners. Peers that lack the endpoint-states verb
    /// fall back to an empty-SYN probe (the ACK is applied by the normal
    /// exchange path, still listener-free in shadow mode).
    pub async fn do_shadow_round(
        self: &Arc<Self>,
        contacts: Vec<SocketAddr>,
    ) -> Result<(), GossipError> {
        if self.status() != GossipStatus::Disabled {
            return Err(GossipError::Administrative(
                "shadow round requires gossip to be disabled".into(),
            ));
        }
        let contacts: Vec<SocketAddr> = contacts
            .into_iter()
            .filter(|a| *a != self.local_addr)
            .collect();
        if contacts.is_empty() {
            return Err(GossipError::ShadowRoundFailed);
        }

        self.set_status(GossipStatus::ShadowRound);
        self.shadow_got_response.store(false, Ordering::SeqCst);
        tracing::info!(contacts = ?contacts, "gossip: starting shadow round");

        let request = EndpointStateRequest {
            wanted_keys: shadow_round_keys(),
        };
        let deadline = tokio::time::Instant::now() + self.cfg.shadow_round_timeout;
        let mut fallback: HashSet<SocketAddr> = HashSet::new();

        'round: while tokio::time::Instant::now() < deadline {
            for &contact in &contacts {
                if self.shadow_got_response.load(Ordering::SeqCst) {
                    break 'round;
                }

                if fallback.contains(&contact) {
                    // Legacy peer: a completely empty SYN makes it reply
                    // with full states for everything it knows.
                    let probe = GossipDigestSyn {
                        from: self.local_addr,
                        cluster_name: self.cfg.cluster_name.clone(),
                        partitioner: self.cfg.partitioner.clone(),
                        digests: vec![],
                    };
                    let _ = self.net.send_syn(contact, probe).await;
                    continue;
                }

                match self
                    .net
                    .get_endpoint_states(
                        contact,
                        request.clone(),
                        Duration::from_millis(PARAMS.shadow_rpc_timeout_ms),
                    )
                    .await
                {
                    Ok(reply) => {
                        tracing::info!(
                            from = %contact,
                            peers = reply.states.len(),
                            "gossip: shadow round reply"
                        );
                        self.apply_state_locally(reply.states, false).await;
                        self.shadow_got_response.store(true, Ordering::SeqCst);
                        break 'round;
                    }
                    Err(NetError::Unsupported) => {
                        tracing::warn!(
                            peer = %contact,
                            "gossip: peer lacks endpoint-states verb, falling back to empty SYN"
                        );
                        fallback.insert(contact);
                    }
                    Err(e) => {
                        tracing::debug!(peer = %contact, "gossip: shadow round attempt failed: {e}");
                    }
                }
            }

            if self.shadow_got_response.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(self.cfg.shadow_retry).await;
        }

        self.set_status(GossipStatus::Disabled);
        if self.shadow_got_response.load(Ordering::SeqCst) {
            tracing::info!(
                endpoints = self.store.endpoint_count().await,
                "gossip: shadow round complete"
            );
            Ok(())
        } else {
            Err(GossipError::ShadowRoundFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NetHandle, NetRequest};
    use crate::testutil::*;
    use murmur_protocol::messages::{EndpointStateReply, GossipDigestAck, StateMap};
    use murmur_protocol::state::Status;
    use std::time::Duration;

    async fn put_peer(g: &Arc<crate::Gossiper>, addr: SocketAddr, state: EndpointState, alive: bool) {
        let _permit = g.store.lock_endpoint(addr).await;
        let mut rec = EndpointRecord::new(state);
        rec.alive = alive;
        g.store.put(addr, rec).await;
        drop(_permit);
        if alive {
            g.store.add_live(addr).await;
        }
    }

    #[tokio::test]
    async fn test_add_saved_endpoint_seeds_state_map() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;

        let b = addr(7001);
        g.add_saved_endpoint(b, Some("a,b".into())).await;

        let rec = g.store.get(&b).await.unwrap();
        assert_eq!(rec.state.generation(), 0);
        assert!(!rec.alive);
        assert_eq!(
            rec.state.get(AppStateKey::SupportedFeatures).unwrap().value,
            "a,b"
        );
        assert_eq!(g.store.unreachable_snapshot().await.len(), 1);

        // Known endpoints are not overwritten.
        g.add_saved_endpoint(b, Some("c".into())).await;
        assert_eq!(
            g.store.get(&b).await.unwrap().state.get(AppStateKey::SupportedFeatures).unwrap().value,
            "a,b"
        );
    }

    #[tokio::test]
    async fn test_evict_from_membership_quarantines() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;
        let listener = RecordingListener::new();
        g.register(listener.clone()).await;

        let b = addr(7001);
        put_peer(&g, b, remote_state(500, 1, &[]), true).await;

        g.evict_from_membership(b).await;

        assert!(g.store.get(&b).await.is_none());
        assert!(!g.store.is_live(&b).await);
        assert!(g.store.is_quarantined(&b).await);
        assert!(listener.events().contains(&"remove:7001".to_string()));
        // Shards no longer know the peer.
        assert!(g.store.reader(0).get(&b).await.is_none());
    }

    #[tokio::test]
    async fn test_force_remove_synthesizes_left_and_evicts() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;
        let listener = RecordingListener::new();
        g.register(listener.clone()).await;

        let b = addr(7001);
        put_peer(&g, b, remote_state(500, 7, &[(AppStateKey::Status, "NORMAL", 1)]), true).await;

        g.force_remove_endpoint(b).await.unwrap();

        // Gone and quarantined.
        assert!(g.store.get(&b).await.is_none());
        assert!(g.store.is_quarantined(&b).await);

        let events = listener.events();
        // The synthesized LEFT entry produced a dead notification before the
        // eviction notification.
        let dead_idx = events.iter().position(|e| e == "dead:7001");
        let remove_idx = events.iter().position(|e| e == "remove:7001");
        assert!(dead_idx.is_some(), "expected on_dead, got {events:?}");
        assert!(remove_idx.is_some(), "expected on_remove, got {events:?}");
        assert!(dead_idx < remove_idx);
    }

    #[tokio::test]
    async fn test_assassinate_fails_when_state_changes_during_wait() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;

        let b = addr(7001);
        put_peer(&g, b, remote_state(500, 7, &[]), true).await;

        // Mutate the heartbeat while the assassinate wait (20 ms) runs.
        let g2 = g.clone();
        let mutator = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _permit = g2.store.lock_endpoint(b).await;
            let mut rec = g2.store.get(&b).await.unwrap();
            rec.state.heartbeat.version = 8;
            g2.store.put(b, rec).await;
        });

        let err = g.assassinate_endpoint(b).await.unwrap_err();
        assert!(matches!(err, GossipError::EndpointStateChanged));
        mutator.await.unwrap();

        // Local state untouched by the failed administrative action.
        assert!(g.store.get(&b).await.is_some());
        assert!(!g.store.is_quarantined(&b).await);
    }

    #[tokio::test]
    async fn test_assassinate_unknown_endpoint_proceeds() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;

        let b = addr(7001);
        g.assassinate_endpoint(b).await.unwrap();
        // The synthesized entry was installed and then evicted.
        assert!(g.store.get(&b).await.is_none());
        assert!(g.store.is_quarantined(&b).await);
    }

    #[tokio::test]
    async fn test_advertise_removal_bumps_generation() {
        let (g, _rx) = gossiper(test_config());
        install_running(&g, GEN).await;

        let b = addr(7001);
        put_peer(&g, b, remote_state(500, 7, &[(AppStateKey::Status, "NORMAL", 1)]), true).await;

        g.advertise_removing(b).await.unwrap();
        let rec = g.store.get(&b).await.unwrap();
        assert_eq!(rec.state.generation(), 501);
        assert_eq!(rec.state.status(), Some(Status::Removing));
        assert!(rec.state.get(AppStateKey::RemovalCoordinator).is_some());

        g.advertise_token_removed(b).await.unwrap();
        let rec = g.store.get(&b).await.unwrap();
        assert_eq!(rec.state.generation(), 502);
        assert_eq!(rec.state.status(), Some(Status::Removed));
        assert!(g.store.expire_time(&b).await.is_some());
        // Dead status keeps the peer out of the live set.
        assert!(!g.store.is_live(&b).await);
    }

    #[tokio::test]
    async fn test_shadow_round_applies_without_listeners() {
        let (g, mut rx) = gossiper(test_config());
        let listener = RecordingListener::new();
        g.register(listener.clone()).await;

        let a = addr(7001);
        let responder = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                if let NetRequest::GetEndpointStates { msg, reply, .. } = req {
                    assert!(msg.wanted_keys.contains(&AppStateKey::Status));
                    assert!(msg.wanted_keys.contains(&AppStateKey::SupportedFeatures));
                    let mut states = StateMap::new();
                    states.insert(
                        a,
                        remote_state(500, 2, &[(AppStateKey::Status, "NORMAL", 1)]),
                    );
                    let _ = reply.send(Ok(EndpointStateReply { states }));
                    break;
                }
            }
        });

        g.do_shadow_round(vec![a]).await.unwrap();
        responder.await.unwrap();

        assert_eq!(g.status(), GossipStatus::Disabled);
        let rec = g.store.get(&a).await.unwrap();
        assert_eq!(rec.state.generation(), 500);
        assert!(!rec.alive);
        assert!(
            listener.events().is_empty(),
            "shadow round must not fire listeners, got {:?}",
            listener.events()
        );
    }

    #[tokio::test]
    async fn test_shadow_round_falls_back_to_empty_syn() {
        let (g, mut rx) = gossiper(test_config());
        let a = addr(7001);

        // The peer lacks the endpoint-states verb; expect an empty SYN next.
        let g2 = g.clone();
        let responder = tokio::spawn(async move {
            let mut sent_probe = false;
            while let Some(req) = rx.recv().await {
                match req {
                    NetRequest::GetEndpointStates { reply, .. } => {
                        let _ = reply.send(Err(crate::net::NetError::Unsupported));
                    }
                    NetRequest::Syn { to, msg } => {
                        assert_eq!(to, a);
                        assert!(msg.digests.is_empty(), "fallback probe must be empty");
                        if !sent_probe {
                            sent_probe = true;
                            // Simulate the peer's ACK with full states.
                            let mut states = StateMap::new();
                            states.insert(a, remote_state(500, 2, &[]));
                            let g3 = g2.clone();
                            tokio::spawn(async move {
                                g3.handle_ack(GossipDigestAck {
                                    from: a,
                                    digests: vec![],
                                    states,
                                })
                                .await
                                .unwrap();
                            });
                        }
                    }
                    _ => {}
                }
            }
        });

        g.do_shadow_round(vec![a]).await.unwrap();
        responder.abort();

        assert!(g.store.get(&a).await.is_some());
        assert_eq!(g.status(), GossipStatus::Disabled);
    }

    #[tokio::test]
    async fn test_shadow_round_fails_when_nobody_replies() {
        let (g, mut rx) = gossiper(test_config());
        let a = addr(7001);

        let responder = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                if let NetRequest::GetEndpointStates { reply, .. } = req {
                    let _ = reply.send(Err(crate::net::NetError::Transport("refused".into())));
                }
            }
        });

        let err = g.do_shadow_round(vec![a]).await.unwrap_err();
        assert!(matches!(err, GossipError::ShadowRoundFailed));
        assert_eq!(g.status(), GossipStatus::Disabled);
        responder.abort();
    }

    #[tokio::test]
    async fn test_shadow_round_requires_contacts() {
        let (g, _rx) = gossiper(test_config());
        let err = g.do_shadow_round(vec![]).await.unwrap_err();
        assert!(matches!(err, GossipError::ShadowRoundFailed));
    }

    #[tokio::test]
    async fn test_gossip_only_member_classification() {
        struct EmptyRing;
        impl crate::RingView for EmptyRing {
            fn is_ring_member(&self, _addr: &SocketAddr) -> bool {
                false
            }
        }
        let (net, _rx) = NetHandle::channel(8);
        let g = crate::Gossiper::new(test_config(), local_addr(), net, Arc::new(EmptyRing));
        install_running(&g, GEN).await;

        let b = addr(7001);
        put_peer(&g, b, remote_state(500, 1, &[(AppStateKey::Status, "NORMAL", 1)]), false).await;
        assert!(g.is_gossip_only_member(b).await);

        // Dead statuses are not fat clients.
        let c = addr(7002);
        put_peer(&g, c, remote_state(500, 1, &[(AppStateKey::Status, "LEFT", 1)]), false).await;
        assert!(!g.is_gossip_only_member(c).await);

        // Unknown endpoints are not members of anything.
        assert!(!g.is_gossip_only_member(addr(7003)).await);
    }
}
