//! Murmur Protocol -- wire verbs, digest types, message codec.
//!
//! QUIC between peers, one bidirectional stream per exchange, verb selected
//! by a protocol byte. 4-byte big-endian length prefix + serde JSON.

pub mod codec;
pub mod messages;
pub mod params;
pub mod state;
pub mod tls;

pub use codec::MessageCodec;
pub use messages::*;
pub use params::{ProtocolParams, PARAMS};
pub use state::{
    AppStateKey, Digest, EndpointState, Generation, HeartbeatState, Status, Version,
    VersionedValue,
};

/// Verb identifiers: the protocol byte opening each QUIC stream.
pub mod verbs {
    pub const GOSSIP_DIGEST_SYN: u8 = 0x01;
    pub const GOSSIP_DIGEST_ACK: u8 = 0x02;
    pub const GOSSIP_DIGEST_ACK2: u8 = 0x03;
    pub const GOSSIP_ECHO: u8 = 0x04;
    pub const GOSSIP_SHUTDOWN: u8 = 0x05;
    pub const GOSSIP_GET_ENDPOINT_STATES: u8 = 0x06;

    pub fn name(verb: u8) -> &'static str {
        match verb {
            GOSSIP_DIGEST_SYN => "GOSSIP_DIGEST_SYN",
            GOSSIP_DIGEST_ACK => "GOSSIP_DIGEST_ACK",
            GOSSIP_DIGEST_ACK2 => "GOSSIP_DIGEST_ACK2",
            GOSSIP_ECHO => "GOSSIP_ECHO",
            GOSSIP_SHUTDOWN => "GOSSIP_SHUTDOWN",
            GOSSIP_GET_ENDPOINT_STATES => "GOSSIP_GET_ENDPOINT_STATES",
            _ => "UNKNOWN",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Message {
    /// Variant name, for error reporting.
    pub fn variant(&self) -> &'static str {
        match self {
            Message::Syn(_) => "Syn",
            Message::Ack(_) => "Ack",
            Message::Ack2(_) => "Ack2",
            Message::Echo(_) => "Echo",
            Message::EchoReply(_) => "EchoReply",
            Message::Shutdown(_) => "Shutdown",
            Message::StateRequest(_) => "StateRequest",
            Message::StateReply(_) => "StateReply",
        }
    }
}
