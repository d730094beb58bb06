//! # Peer Host
//!
//! A [`PeerHost`] is a node's presence on the network: its Ed25519 identity,
//! one QUIC endpoint that both listens and dials, an address book of known
//! peers, and a table of stream handlers keyed by protocol id.
//!
//! ```text
//!            ┌──────────────────────────────┐
//!  inbound ─►│ accept loop ─► negotiation ──┼─► StreamHandler::handle
//!            │                              │
//!  open_stream ─► address book ─► pool ─────┼─► PeerStream
//!            └──────────────────────────────┘
//! ```
//!
//! Each inbound connection and each inbound stream runs on its own task.
//! Peer identity on inbound connections comes from the verified client
//! certificate, never from anything the peer sends.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quinn::{Endpoint, Incoming};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::address::PeerAddr;
use crate::config::{HostConfig, StreamLimits};
use crate::crypto::{TlsConfigs, connection_identity};
use crate::error::{Result, TnsError};
use crate::identity::{Identity, Keypair};
use crate::protocols::StreamHandler;
use crate::transport::{ConnectionPool, PeerStream};

type HandlerTable = Arc<RwLock<HashMap<String, Arc<dyn StreamHandler>>>>;

pub struct PeerHost {
    keypair: Keypair,
    endpoint: Endpoint,
    config: HostConfig,
    peers: RwLock<HashMap<Identity, Vec<PeerAddr>>>,
    handlers: HandlerTable,
    pool: ConnectionPool,
    listener: tokio::task::JoinHandle<()>,
    closed: AtomicBool,
}

impl PeerHost {
    /// Bind a QUIC endpoint on `config.listen_addr` and start accepting.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(keypair: Keypair, config: HostConfig) -> Result<Self> {
        let TlsConfigs { server, client } =
            TlsConfigs::new(&keypair).map_err(|e| TnsError::Bind(format!("{:#}", e)))?;

        let endpoint = Endpoint::server(server, config.listen_addr)
            .map_err(|e| TnsError::Bind(format!("{}: {}", config.listen_addr, e)))?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TnsError::Bind(e.to_string()))?;

        let handlers: HandlerTable = Arc::new(RwLock::new(HashMap::new()));
        let pool = ConnectionPool::spawn(endpoint.clone(), client);

        let listener = {
            let endpoint = endpoint.clone();
            let handlers = handlers.clone();
            let limits = config.stream_limits();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    let handlers = handlers.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(incoming, handlers, limits).await {
                            debug!(error = %e, "connection ended with error");
                        }
                    });
                }
            })
        };

        info!("Host {}/{}", local_addr, keypair.identity());

        Ok(Self {
            keypair,
            endpoint,
            config,
            peers: RwLock::new(HashMap::new()),
            handlers,
            pool,
            listener,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().map_err(TnsError::transport)
    }

    /// Dialable addresses for this host, each ending in its own `/p2p/` id.
    ///
    /// A host bound to a specific IP reports that address. A host bound to
    /// `0.0.0.0` or `::` reports the outbound interface address (if any)
    /// followed by loopback.
    pub fn listen_addrs(&self) -> Vec<PeerAddr> {
        let Ok(local) = self.endpoint.local_addr() else {
            return Vec::new();
        };
        let me = self.peer_id();

        let ips = if local.ip().is_unspecified() {
            let mut ips = Vec::new();
            if let Some(ip) = outbound_interface_ip(local.is_ipv4()) {
                ips.push(ip);
            }
            ips.push(if local.is_ipv4() {
                IpAddr::from([127, 0, 0, 1])
            } else {
                IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])
            });
            ips
        } else {
            vec![local.ip()]
        };

        ips.into_iter()
            .map(|ip| PeerAddr::from_socket_addr(SocketAddr::new(ip, local.port()), Some(me)))
            .collect()
    }

    /// Parse `address` and record it in the address book.
    ///
    /// The address must carry a `/p2p/<peer-id>` component. Entries never
    /// expire; use [`remove_peer`](Self::remove_peer) to evict.
    pub async fn add_peer(&self, address: &str) -> Result<Identity> {
        let addr: PeerAddr = address.parse()?;
        let Some(peer) = addr.peer_id() else {
            return Err(TnsError::Address(format!("{address:?} has no /p2p/ component")));
        };

        let mut peers = self.peers.write().await;
        let known = peers.entry(peer).or_default();
        if !known.contains(&addr) {
            known.push(addr);
        }
        debug!(peer = %peer.short(), addrs = known.len(), "added peer address");
        Ok(peer)
    }

    /// Forget every address of `peer`. Returns whether it was known.
    pub async fn remove_peer(&self, peer: &Identity) -> bool {
        let removed = self.peers.write().await.remove(peer).is_some();
        if removed {
            self.pool.invalidate(*peer).await;
        }
        removed
    }

    /// Every peer in the address book, sorted. The host's own id appears
    /// only if an address for it was added.
    pub async fn list_peers(&self) -> Vec<Identity> {
        let mut peers: Vec<Identity> = self.peers.read().await.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Route inbound streams for `protocol_id` to `handler`, replacing any
    /// handler already bound.
    pub async fn set_stream_handler(&self, protocol_id: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers
            .write()
            .await
            .insert(protocol_id.to_string(), handler);
        debug!(protocol = protocol_id, "bound stream handler");
    }

    pub async fn remove_stream_handler(&self, protocol_id: &str) -> bool {
        self.handlers.write().await.remove(protocol_id).is_some()
    }

    /// Open a stream to `peer` and negotiate `protocol_id`.
    ///
    /// Tries each known dialable address in insertion order.
    pub async fn open_stream(&self, peer: &Identity, protocol_id: &str) -> Result<PeerStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TnsError::Transport("host is closed".to_string()));
        }

        let addrs: Vec<SocketAddr> = {
            let peers = self.peers.read().await;
            let Some(known) = peers.get(peer) else {
                return Err(TnsError::Transport(format!("unknown peer {}", peer)));
            };
            known.iter().filter_map(PeerAddr::socket_addr).collect()
        };
        if addrs.is_empty() {
            return Err(TnsError::Transport(format!(
                "no dialable address for peer {}",
                peer
            )));
        }

        let mut last_error = None;
        for addr in addrs {
            let conn = match self.pool.get_or_connect(*peer, addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    let msg = format!("{:#}", e);
                    debug!(peer = %peer.short(), addr = %addr, error = %msg, "dial failed");
                    last_error = Some(TnsError::Transport(msg));
                    continue;
                }
            };

            match PeerStream::open(&conn, *peer, protocol_id, self.config.stream_limits()).await {
                Ok(stream) => {
                    trace!(peer = %peer.short(), protocol = protocol_id, "opened stream");
                    return Ok(stream);
                }
                Err(e) => {
                    if conn.close_reason().is_some() {
                        self.pool.invalidate(*peer).await;
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TnsError::Transport(format!("peer {} unreachable", peer))))
    }

    /// Stop accepting, close the endpoint and fail in-flight streams.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.abort();
        self.endpoint.close(0u32.into(), b"shutdown");
        self.pool.quit().await;
        info!(peer = %self.peer_id().short(), "host closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for PeerHost {
    fn drop(&mut self) {
        self.listener.abort();
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.endpoint.close(0u32.into(), b"dropped");
        }
    }
}

/// Probe the interface the OS would route public traffic through. No
/// packets are sent; `connect` on UDP only selects a route.
fn outbound_interface_ip(ipv4: bool) -> Option<IpAddr> {
    let (bind, target) = if ipv4 {
        ("0.0.0.0:0", "8.8.8.8:53")
    } else {
        ("[::]:0", "[2001:4860:4860::8888]:53")
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

async fn handle_connection(incoming: Incoming, handlers: HandlerTable, limits: StreamLimits) -> Result<()> {
    let connection = incoming.await.map_err(TnsError::transport)?;
    let remote = connection.remote_address();

    let Some(peer) = connection_identity(&connection) else {
        warn!(remote = %remote, "rejecting connection: could not verify peer identity");
        connection.close(1u32.into(), b"unverified identity");
        return Err(TnsError::Transport("could not verify peer identity".to_string()));
    };

    debug!(peer = %peer.short(), addr = %remote, "peer connected");

    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(remote = %remote, "connection closed");
                return Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                return Ok(());
            }
            Err(e) => return Err(TnsError::transport(e)),
        };

        let handlers = handlers.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(peer, send, recv, handlers, limits).await {
                debug!(peer = %peer.short(), error = %e, "inbound stream failed");
            }
        });
    }
}

async fn handle_stream(
    peer: Identity,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    handlers: HandlerTable,
    limits: StreamLimits,
) -> Result<()> {
    let mut stream = PeerStream::accept(peer, send, recv, limits).await?;

    let handler = handlers.read().await.get(stream.protocol()).cloned();
    match handler {
        Some(handler) => {
            stream.confirm_protocol().await?;
            trace!(peer = %peer.short(), protocol = stream.protocol(), "dispatching stream");
            handler.handle(stream).await;
        }
        None => {
            debug!(peer = %peer.short(), protocol = stream.protocol(), "no handler for protocol");
            stream.refuse_protocol().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind() -> PeerHost {
        PeerHost::bind(Keypair::generate(), HostConfig::default())
            .await
            .expect("bind loopback host")
    }

    #[tokio::test]
    async fn peer_id_tracks_keypair() {
        let keypair = Keypair::generate();
        let host = PeerHost::bind(keypair.clone(), HostConfig::default()).await.unwrap();
        assert_eq!(host.peer_id(), keypair.identity());
        host.close().await;
    }

    #[tokio::test]
    async fn add_peer_requires_p2p_component() {
        let host = bind().await;
        let err = host.add_peer("/ip4/127.0.0.1/udp/4001").await.unwrap_err();
        assert!(matches!(err, TnsError::Address(_)));

        let err = host.add_peer("not an address").await.unwrap_err();
        assert!(matches!(err, TnsError::Address(_)));
        assert!(host.list_peers().await.is_empty());
        host.close().await;
    }

    #[tokio::test]
    async fn list_peers_is_sorted_and_includes_every_added_id() {
        let host = bind().await;
        assert!(host.list_peers().await.is_empty());

        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = Keypair::generate().identity();
            host.add_peer(&format!("/ip4/127.0.0.1/udp/1/p2p/{}", id)).await.unwrap();
            ids.push(id);
        }
        let me = host
            .add_peer(&format!("/ip4/127.0.0.1/udp/1/p2p/{}", host.peer_id()))
            .await
            .unwrap();
        assert_eq!(me, host.peer_id());
        ids.push(me);

        ids.sort();
        assert_eq!(host.list_peers().await, ids);

        assert!(host.remove_peer(&ids[0]).await);
        assert!(!host.remove_peer(&ids[0]).await);
        assert_eq!(host.list_peers().await.len(), 4);
        host.close().await;
    }

    #[tokio::test]
    async fn listen_addrs_carry_own_id() {
        let host = bind().await;
        let addrs = host.listen_addrs();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].peer_id(), Some(host.peer_id()));
        assert_eq!(addrs[0].socket_addr(), Some(host.local_addr().unwrap()));
        host.close().await;
    }

    #[tokio::test]
    async fn open_stream_to_unknown_peer_fails() {
        let host = bind().await;
        let stranger = Keypair::generate().identity();
        let err = host.open_stream(&stranger, "/echo/0.0.1").await.unwrap_err();
        assert!(matches!(err, TnsError::Transport(_)));
        host.close().await;
    }

    #[tokio::test]
    async fn peer_without_transport_part_is_not_dialable() {
        let host = bind().await;
        let id = Keypair::generate().identity();
        host.add_peer(&format!("/p2p/{}", id)).await.unwrap();
        let err = host.open_stream(&id, "/echo/0.0.1").await.unwrap_err();
        assert!(matches!(err, TnsError::Transport(ref m) if m.contains("no dialable address")));
        host.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let host = bind().await;
        host.close().await;
        host.close().await;
        assert!(host.is_closed());

        let err = host.open_stream(&host.peer_id(), "/echo/0.0.1").await.unwrap_err();
        assert!(matches!(err, TnsError::Transport(ref m) if m.contains("closed")));
    }
}
