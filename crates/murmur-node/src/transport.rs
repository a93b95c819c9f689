//! QUIC transport -- the wire surface for the six gossip verbs.
//!
//! Each verb is one bidirectional stream: a protocol byte, then a
//! length-prefixed JSON message. SYN/ACK/ACK2/SHUTDOWN are one-way (the
//! stream is finished after the write); ECHO and GET_ENDPOINT_STATES read a
//! reply on the same stream. Outbound connections are cached per peer and
//! re-dialled on failure.

use bytes::BytesMut;
use murmur_gossip::{Gossiper, NetError, NetRequest};
use murmur_protocol::{verbs, Message, MessageCodec, ProtocolError, PARAMS};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::codec::Encoder;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ============================================================================
// Codec helpers -- read/write a single Message on a QUIC stream
// ============================================================================

async fn read_message(recv: &mut quinn::RecvStream) -> Result<Message, BoxError> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > PARAMS.max_message_bytes {
        return Err(Box::new(ProtocolError::MessageTooLarge {
            size: len,
            max: PARAMS.max_message_bytes,
        }));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await?;

    let msg: Message = serde_json::from_slice(&buf)?;
    Ok(msg)
}

async fn write_message(send: &mut quinn::SendStream, msg: &Message) -> Result<(), BoxError> {
    let mut codec = MessageCodec;
    let mut buf = BytesMut::new();
    codec.encode(msg.clone(), &mut buf)?;
    send.write_all(&buf).await?;
    Ok(())
}

fn verb_for(msg: &Message) -> u8 {
    match msg {
        Message::Syn(_) => verbs::GOSSIP_DIGEST_SYN,
        Message::Ack(_) => verbs::GOSSIP_DIGEST_ACK,
        Message::Ack2(_) => verbs::GOSSIP_DIGEST_ACK2,
        Message::Echo(_) | Message::EchoReply(_) => verbs::GOSSIP_ECHO,
        Message::Shutdown(_) => verbs::GOSSIP_SHUTDOWN,
        Message::StateRequest(_) | Message::StateReply(_) => verbs::GOSSIP_GET_ENDPOINT_STATES,
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct GossipTransport {
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    connections: Mutex<HashMap<SocketAddr, quinn::Connection>>,
}

impl GossipTransport {
    /// Bind a QUIC endpoint configured for both accept and dial.
    pub fn new(listen_addr: SocketAddr) -> Result<Arc<Self>, BoxError> {
        let (cert_der, key_der) = murmur_protocol::tls::generate_self_signed_cert()?;
        let server_config = murmur_protocol::tls::build_server_config(cert_der, key_der)?;
        let client_config = murmur_protocol::tls::build_client_config()?;

        let endpoint = quinn::Endpoint::server(server_config, listen_addr)?;
        Ok(Arc::new(Self {
            endpoint,
            client_config,
            connections: Mutex::new(HashMap::new()),
        }))
    }

    /// The actually bound address (relevant for port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Cached connection to a peer, dialling if needed.
    async fn connect(&self, addr: SocketAddr) -> Result<quinn::Connection, NetError> {
        {
            let cache = self.connections.lock().await;
            if let Some(conn) = cache.get(&addr) {
                if conn.close_reason().is_none() {
                    return Ok(conn.clone());
                }
            }
        }

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, "murmur-node.local")
            .map_err(|e| NetError::Transport(e.to_string()))?;
        let conn = connecting.await.map_err(map_connection_error)?;

        self.connections.lock().await.insert(addr, conn.clone());
        Ok(conn)
    }

    /// Drive outbound requests from the gossip core until shutdown.
    pub async fn run_outbound(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<NetRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let req = tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
                _ = shutdown.recv() => break,
            };

            // One task per request so a slow peer cannot stall the queue.
            let this = self.clone();
            tokio::spawn(async move {
                this.send_request(req).await;
            });
        }
        tracing::info!("net: outbound loop stopped");
    }

    async fn send_request(&self, req: NetRequest) {
        let to = req.to();
        match req {
            NetRequest::Syn { to, msg } => {
                self.send_one_way(to, Message::Syn(msg)).await;
            }
            NetRequest::Ack { to, msg } => {
                self.send_one_way(to, Message::Ack(msg)).await;
            }
            NetRequest::Ack2 { to, msg } => {
                self.send_one_way(to, Message::Ack2(msg)).await;
            }
            NetRequest::Shutdown { to, msg } => {
                self.send_one_way(to, Message::Shutdown(msg)).await;
            }
            NetRequest::Echo { to, msg, reply } => {
                let result = self.request_reply(to, Message::Echo(msg)).await;
                let _ = reply.send(result.and_then(|m| match m {
                    Message::EchoReply(r) => Ok(r),
                    other => Err(NetError::Transport(format!(
                        "unexpected reply: {}",
                        other.variant()
                    ))),
                }));
            }
            NetRequest::GetEndpointStates { to, msg, reply } => {
                let result = self.request_reply(to, Message::StateRequest(msg)).await;
                let _ = reply.send(result.and_then(|m| match m {
                    Message::StateReply(r) => Ok(r),
                    other => Err(NetError::Transport(format!(
                        "unexpected reply: {}",
                        other.variant()
                    ))),
                }));
            }
        }
        tracing::trace!(%to, "net: request handled");
    }

    /// Fire-and-forget verb; transport failures are expected when the peer
    /// is down and only traced.
    async fn send_one_way(&self, to: SocketAddr, msg: Message) {
        if let Err(e) = self.try_send_one_way(to, &msg).await {
            tracing::trace!(%to, verb = msg.variant(), "net: send failed: {e}");
        }
    }

    async fn try_send_one_way(&self, to: SocketAddr, msg: &Message) -> Result<(), NetError> {
        let conn = self.connect(to).await?;
        let (mut send, _recv) = conn
            .open_bi()
            .await
            .map_err(map_connection_error)?;
        send.write_all(&[verb_for(msg)])
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        write_message(&mut send, msg)
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        send.finish().ok();
        Ok(())
    }

    /// Request/response verb on one stream. A stream closed before any
    /// reply byte is reported as `Unsupported` (the peer lacks the verb).
    async fn request_reply(&self, to: SocketAddr, msg: Message) -> Result<Message, NetError> {
        let conn = self.connect(to).await?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(map_connection_error)?;
        send.write_all(&[verb_for(&msg)])
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        write_message(&mut send, &msg)
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        send.finish().ok();

        match read_message(&mut recv).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if let Some(read_err) = e.downcast_ref::<quinn::ReadExactError>() {
                    return Err(match read_err {
                        quinn::ReadExactError::FinishedEarly(_) => NetError::Unsupported,
                        quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(_)) => {
                            NetError::ConnectionClosed
                        }
                        quinn::ReadExactError::ReadError(_) => NetError::Unsupported,
                    });
                }
                Err(NetError::Transport(e.to_string()))
            }
        }
    }

    /// Accept inbound connections and serve verbs until shutdown.
    pub async fn run_accept(
        self: Arc<Self>,
        gossiper: Arc<Gossiper>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        tracing::info!("net: endpoint closed, stopping accept loop");
                        break;
                    };
                    let gossiper = gossiper.clone();
                    tokio::spawn(async move {
                        match incoming.await {
                            Ok(conn) => {
                                tracing::debug!(
                                    remote = %conn.remote_address(),
                                    "net: accepted inbound connection"
                                );
                                run_connection(conn, gossiper).await;
                            }
                            Err(e) => {
                                tracing::debug!("net: failed to accept connection: {e}");
                            }
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("net: shutdown signal, stopping accept loop");
                    break;
                }
            }
        }
        self.endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
    }
}

fn map_connection_error(e: quinn::ConnectionError) -> NetError {
    match e {
        quinn::ConnectionError::ApplicationClosed(_)
        | quinn::ConnectionError::ConnectionClosed(_)
        | quinn::ConnectionError::LocallyClosed => NetError::ConnectionClosed,
        quinn::ConnectionError::TimedOut => NetError::Timeout,
        other => NetError::Transport(other.to_string()),
    }
}

/// Serve all streams of one inbound connection.
async fn run_connection(conn: quinn::Connection, gossiper: Arc<Gossiper>) {
    let remote = conn.remote_address();
    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let gossiper = gossiper.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(send, recv, &gossiper).await {
                        tracing::debug!("net: stream error: {e}");
                    }
                });
            }
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                tracing::debug!(%remote, "net: connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::debug!(%remote, "net: connection error: {e}");
                break;
            }
        }
    }
}

/// Read the verb byte and message, dispatch, and reply where the verb calls
/// for one.
async fn serve_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    gossiper: &Arc<Gossiper>,
) -> Result<(), BoxError> {
    let mut verb_buf = [0u8; 1];
    recv.read_exact(&mut verb_buf).await?;
    let verb = verb_buf[0];

    let msg = read_message(&mut recv).await?;
    tracing::trace!(verb = verbs::name(verb), from = %msg_source(&msg), "net: inbound verb");

    match verb {
        verbs::GOSSIP_DIGEST_SYN
        | verbs::GOSSIP_DIGEST_ACK
        | verbs::GOSSIP_DIGEST_ACK2
        | verbs::GOSSIP_SHUTDOWN => {
            gossiper.dispatch(msg);
        }
        verbs::GOSSIP_ECHO => {
            if let Message::Echo(req) = msg {
                let reply = gossiper.handle_echo(&req);
                write_message(&mut send, &Message::EchoReply(reply)).await?;
                send.finish().ok();
            }
        }
        verbs::GOSSIP_GET_ENDPOINT_STATES => {
            if let Message::StateRequest(req) = msg {
                let reply = gossiper.handle_state_request(&req).await;
                write_message(&mut send, &Message::StateReply(reply)).await?;
                send.finish().ok();
            }
        }
        other => {
            tracing::warn!(verb = other, "net: unknown protocol byte");
        }
    }
    Ok(())
}

/// Best-effort source address of a message, for tracing.
fn msg_source(msg: &Message) -> String {
    match msg {
        Message::Syn(m) => m.from.to_string(),
        Message::Ack(m) => m.from.to_string(),
        Message::Ack2(m) => m.from.to_string(),
        Message::Shutdown(m) => m.from.to_string(),
        _ => "-".into(),
    }
}
