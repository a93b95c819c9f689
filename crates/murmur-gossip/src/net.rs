//! Outbound network seam -- the gossip core talks to the transport through
//! a command channel (requests with optional oneshot reply slots).
//!
//! One-way verbs (SYN/ACK/ACK2/SHUTDOWN) are fire-and-forget: enqueue
//! failures surface here, transport failures are trace-logged by the
//! transport task and never come back. Echo and GetEndpointStates carry a
//! reply slot; the caller owns the deadline.

use murmur_protocol::messages::{
    EchoReply, EchoRequest, EndpointStateReply, EndpointStateRequest, GossipDigestAck,
    GossipDigestAck2, GossipDigestSyn, ShutdownAnnounce,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Errors surfaced to the gossip core by the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetError {
    #[error("request timed out")]
    Timeout,
    #[error("peer closed the stream without replying (verb unsupported?)")]
    Unsupported,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transport shut down")]
    Shutdown,
}

/// A single outbound request for the transport task.
#[derive(Debug)]
pub enum NetRequest {
    Syn {
        to: SocketAddr,
        msg: GossipDigestSyn,
    },
    Ack {
        to: SocketAddr,
        msg: GossipDigestAck,
    },
    Ack2 {
        to: SocketAddr,
        msg: GossipDigestAck2,
    },
    Shutdown {
        to: SocketAddr,
        msg: ShutdownAnnounce,
    },
    Echo {
        to: SocketAddr,
        msg: EchoRequest,
        reply: oneshot::Sender<Result<EchoReply, NetError>>,
    },
    GetEndpointStates {
        to: SocketAddr,
        msg: EndpointStateRequest,
        reply: oneshot::Sender<Result<EndpointStateReply, NetError>>,
    },
}

impl NetRequest {
    /// Destination address, for logging.
    pub fn to(&self) -> SocketAddr {
        match self {
            NetRequest::Syn { to, .. }
            | NetRequest::Ack { to, .. }
            | NetRequest::Ack2 { to, .. }
            | NetRequest::Shutdown { to, .. }
            | NetRequest::Echo { to, .. }
            | NetRequest::GetEndpointStates { to, .. } => *to,
        }
    }
}

/// Cloneable handle the engine uses to reach the transport.
#[derive(Clone)]
pub struct NetHandle {
    tx: mpsc::Sender<NetRequest>,
}

impl NetHandle {
    pub fn new(tx: mpsc::Sender<NetRequest>) -> Self {
        Self { tx }
    }

    /// Channel pair for wiring a transport (or a test double).
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NetRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    async fn enqueue(&self, req: NetRequest) -> Result<(), NetError> {
        self.tx.send(req).await.map_err(|_| NetError::Shutdown)
    }

    pub async fn send_syn(&self, to: SocketAddr, msg: GossipDigestSyn) -> Result<(), NetError> {
        self.enqueue(NetRequest::Syn { to, msg }).await
    }

    pub async fn send_ack(&self, to: SocketAddr, msg: GossipDigestAck) -> Result<(), NetError> {
        self.enqueue(NetRequest::Ack { to, msg }).await
    }

    pub async fn send_ack2(&self, to: SocketAddr, msg: GossipDigestAck2) -> Result<(), NetError> {
        self.enqueue(NetRequest::Ack2 { to, msg }).await
    }

    pub async fn send_shutdown(
        &self,
        to: SocketAddr,
        msg: ShutdownAnnounce,
    ) -> Result<(), NetError> {
        self.enqueue(NetRequest::Shutdown { to, msg }).await
    }

    /// Echo probe with a caller-owned deadline.
    pub async fn echo(
        &self,
        to: SocketAddr,
        msg: EchoRequest,
        deadline: Duration,
    ) -> Result<EchoReply, NetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(NetRequest::Echo {
            to,
            msg,
            reply: reply_tx,
        })
        .await?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetError::Shutdown),
            Err(_) => Err(NetError::Timeout),
        }
    }

    /// Shadow-round state pull with a caller-owned deadline.
    pub async fn get_endpoint_states(
        &self,
        to: SocketAddr,
        msg: EndpointStateRequest,
        deadline: Duration,
    ) -> Result<EndpointStateReply, NetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(NetRequest::GetEndpointStates {
            to,
            msg,
            reply: reply_tx,
        })
        .await?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetError::Shutdown),
            Err(_) => Err(NetError::Timeout),
        }
    }
}
