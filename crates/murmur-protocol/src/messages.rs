//! Wire messages for the six gossip verbs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use crate::state::{AppStateKey, Digest, EndpointState, Generation};

/// Map of endpoint address to its gossiped state, as carried in ACK/ACK2 and
/// endpoint-state replies. BTreeMap keeps wire encoding deterministic.
pub type StateMap = BTreeMap<SocketAddr, EndpointState>;

// ============================================================================
// Envelope -- wraps all verbs for stream demuxing
// ============================================================================

/// Top-level message envelope sent on QUIC streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // Anti-entropy exchange (one-way; replies arrive as separate verbs)
    Syn(GossipDigestSyn),
    Ack(GossipDigestAck),
    Ack2(GossipDigestAck2),

    // Liveness probe (request/response)
    Echo(EchoRequest),
    EchoReply(EchoReply),

    // Shutdown announcement (no-wait)
    Shutdown(ShutdownAnnounce),

    // Bootstrap state pull (request/response)
    StateRequest(EndpointStateRequest),
    StateReply(EndpointStateReply),
}

// ============================================================================
// SYN / ACK / ACK2
// ============================================================================

/// First phase: the sender's digest of every endpoint it knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipDigestSyn {
    /// Canonical gossip address of the sender (not the transport source).
    pub from: SocketAddr,
    pub cluster_name: String,
    /// Empty string means "don't check".
    #[serde(default)]
    pub partitioner: String,
    pub digests: Vec<Digest>,
}

/// Second phase: request-digests for what the replier lacks, plus state
/// deltas for what the original sender lacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipDigestAck {
    pub from: SocketAddr,
    pub digests: Vec<Digest>,
    #[serde(default)]
    pub states: StateMap,
}

/// Third phase: the deltas the ACK asked for. No reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipDigestAck2 {
    pub from: SocketAddr,
    pub states: StateMap,
}

// ============================================================================
// Echo
// ============================================================================

/// One-shot liveness probe. The generation lets the receiver log which
/// incarnation is probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoRequest {
    #[serde(default)]
    pub generation: Option<Generation>,
}

/// Echo outcome. `accepted = false` when the receiver declines to advertise
/// itself (operator has turned `advertise_myself` off).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ============================================================================
// Shutdown
// ============================================================================

/// Announces that `from` is leaving gracefully. Fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownAnnounce {
    pub from: SocketAddr,
    #[serde(default)]
    pub generation: Option<Generation>,
}

// ============================================================================
// Endpoint states (shadow round)
// ============================================================================

/// Bootstrap-time state pull: the caller asks for a filtered view of every
/// endpoint the receiver knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStateRequest {
    pub wanted_keys: BTreeSet<AppStateKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStateReply {
    pub states: StateMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VersionedValue;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_syn_roundtrip() {
        let msg = Message::Syn(GossipDigestSyn {
            from: addr(7000),
            cluster_name: "test-cluster".into(),
            partitioner: String::new(),
            digests: vec![
                Digest::new(addr(7000), 1_700_000_000, 12),
                Digest::new(addr(7001), 1_700_000_050, 3),
            ],
        });

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::Syn(syn) => {
                assert_eq!(syn.cluster_name, "test-cluster");
                assert_eq!(syn.digests.len(), 2);
                assert_eq!(syn.digests[1].max_version, 3);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_ack_carries_states_keyed_by_address() {
        let mut st = EndpointState::new(1_700_000_000);
        st.application_states
            .insert(AppStateKey::Status, VersionedValue::new("NORMAL", 4));

        let mut states = StateMap::new();
        states.insert(addr(7001), st);

        let msg = Message::Ack(GossipDigestAck {
            from: addr(7000),
            digests: vec![Digest::new(addr(7002), 10, 0)],
            states,
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("127.0.0.1:7001"));

        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::Ack(ack) => {
                let st = ack.states.get(&addr(7001)).unwrap();
                assert_eq!(st.status(), Some(crate::state::Status::Normal));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_all_verbs_serialize() {
        let messages = vec![
            Message::Ack2(GossipDigestAck2 {
                from: addr(1),
                states: StateMap::new(),
            }),
            Message::Echo(EchoRequest {
                generation: Some(1_700_000_000),
            }),
            Message::EchoReply(EchoReply {
                accepted: true,
                reason: None,
            }),
            Message::Shutdown(ShutdownAnnounce {
                from: addr(2),
                generation: None,
            }),
            Message::StateRequest(EndpointStateRequest {
                wanted_keys: [AppStateKey::Status, AppStateKey::HostId]
                    .into_iter()
                    .collect(),
            }),
            Message::StateReply(EndpointStateReply {
                states: StateMap::new(),
            }),
        ];

        for msg in &messages {
            let json = serde_json::to_string(msg).unwrap();
            let _: Message = serde_json::from_str(&json).unwrap();
        }
    }

    #[test]
    fn test_echo_reply_reason_omitted_when_none() {
        let json = serde_json::to_string(&EchoReply {
            accepted: true,
            reason: None,
        })
        .unwrap();
        assert!(!json.contains("reason"));
    }
}
