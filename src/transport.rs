//! # Connections and Streams
//!
//! Two pieces sit between the QUIC endpoint and the host:
//!
//! - `ConnectionPool`: an actor owning an LRU cache of outbound
//!   connections keyed by peer identity. Callers talk to it over a bounded
//!   command channel, so the cache itself needs no lock.
//! - [`PeerStream`]: one bidirectional stream bound to a negotiated protocol
//!   id. Every read and write runs under the host's stream deadline, and
//!   reads are bounded by the host's size limits.
//!
//! ## Negotiation
//!
//! ```text
//! opener                         acceptor
//!   |---- "<protocol-id>\n" ------->|
//!   |<--- "<protocol-id>\n" --------|   handler bound
//!   |<--- "na\n" + FIN -------------|   no handler
//! ```
//!
//! ## Reset Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 1 | Internal failure |
//! | 2 | Command not implemented |
//! | 3 | Malformed request |

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint, ReadError, ReadToEndError, VarInt, WriteError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::config::StreamLimits;
use crate::crypto::identity_to_sni;
use crate::error::{Result, TnsError};
use crate::identity::Identity;

pub const RESET_INTERNAL: u32 = 1;
pub const RESET_NOT_IMPLEMENTED: u32 = 2;
pub const RESET_MALFORMED: u32 = 3;

/// Reply sent instead of the protocol id when no handler is bound.
const NOT_AVAILABLE: &str = "na";

/// Protocol ids are short path-like tokens.
const MAX_PROTOCOL_ID_LEN: usize = 256;

const READ_CHUNK_SIZE: usize = 4096;

/// Maximum number of cached QUIC connections.
const MAX_CACHED_CONNECTIONS: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(n) => n,
    None => unreachable!(),
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const POOL_COMMAND_CHANNEL_SIZE: usize = 256;

/// Interval for dropping connections the remote has closed.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Stream reset code a handler failure is reported with.
pub fn reset_code_for(err: &TnsError) -> u32 {
    match err {
        TnsError::NotImplemented => RESET_NOT_IMPLEMENTED,
        TnsError::Serialization(_) => RESET_MALFORMED,
        _ => RESET_INTERNAL,
    }
}

fn reset_error(code: VarInt) -> TnsError {
    if code == VarInt::from_u32(RESET_NOT_IMPLEMENTED) {
        TnsError::NotImplemented
    } else {
        TnsError::Transport(format!("stream reset by peer (code {})", code.into_inner()))
    }
}

fn read_error(err: ReadError) -> TnsError {
    match err {
        ReadError::Reset(code) => reset_error(code),
        other => TnsError::transport(other),
    }
}

fn write_error(err: WriteError) -> TnsError {
    match err {
        WriteError::Stopped(code) => reset_error(code),
        other => TnsError::transport(other),
    }
}

// ============================================================================
// Connection pool actor
// ============================================================================

enum PoolCommand {
    GetOrConnect {
        peer: Identity,
        addr: SocketAddr,
        reply: oneshot::Sender<AnyResult<Connection>>,
    },
    Invalidate {
        peer: Identity,
    },
    Quit,
}

struct ConnectionPoolActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    connections: LruCache<Identity, Connection>,
}

impl ConnectionPoolActor {
    fn new(endpoint: Endpoint, client_config: ClientConfig) -> Self {
        Self {
            endpoint,
            client_config,
            connections: LruCache::new(MAX_CACHED_CONNECTIONS),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PoolCommand>) {
        let mut cleanup_interval = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(PoolCommand::GetOrConnect { peer, addr, reply }) => {
                            let result = self.get_or_connect(peer, addr).await;
                            let _ = reply.send(result);
                        }
                        Some(PoolCommand::Invalidate { peer }) => {
                            if self.connections.pop(&peer).is_some() {
                                debug!(peer = %peer.short(), "invalidated cached connection");
                            }
                        }
                        Some(PoolCommand::Quit) | None => {
                            debug!("connection pool shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_closed();
                }
            }
        }

        for (_, conn) in self.connections.iter() {
            conn.close(0u32.into(), b"shutdown");
        }
    }

    fn cleanup_closed(&mut self) {
        let closed: Vec<Identity> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.close_reason().is_some())
            .map(|(id, _)| *id)
            .collect();

        for peer in closed {
            self.connections.pop(&peer);
            trace!(peer = %peer.short(), "cleaned up closed connection");
        }
    }

    async fn get_or_connect(&mut self, peer: Identity, addr: SocketAddr) -> AnyResult<Connection> {
        if let Some(conn) = self.connections.get(&peer) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            trace!(peer = %peer.short(), "cached connection is closed, removing");
            self.connections.pop(&peer);
        }

        let sni = identity_to_sni(&peer);
        debug!(peer = %peer.short(), addr = %addr, "initiating connection");
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &sni)
            .with_context(|| format!("failed to initiate connection to {}", addr))?;

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| anyhow::anyhow!("connection to {} timed out", addr))?
            .with_context(|| format!("failed to establish connection to {}", addr))?;

        debug!(peer = %peer.short(), addr = %addr, "connection established");
        self.connections.put(peer, conn.clone());
        Ok(conn)
    }
}

/// Handle to the connection pool actor.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    cmd_tx: mpsc::Sender<PoolCommand>,
}

impl ConnectionPool {
    pub(crate) fn spawn(endpoint: Endpoint, client_config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(POOL_COMMAND_CHANNEL_SIZE);
        let actor = ConnectionPoolActor::new(endpoint, client_config);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    pub(crate) async fn get_or_connect(&self, peer: Identity, addr: SocketAddr) -> AnyResult<Connection> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::GetOrConnect {
                peer,
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("connection pool closed"))?;

        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("connection pool closed"))?
    }

    pub(crate) async fn invalidate(&self, peer: Identity) {
        let _ = self.cmd_tx.send(PoolCommand::Invalidate { peer }).await;
    }

    pub(crate) async fn quit(&self) {
        let _ = self.cmd_tx.send(PoolCommand::Quit).await;
    }
}

// ============================================================================
// PeerStream
// ============================================================================

/// A bidirectional byte stream to one peer, bound to one protocol id.
///
/// Dropping a stream without [`close`](Self::close) or
/// [`reset`](Self::reset) finishes the write side implicitly.
pub struct PeerStream {
    peer: Identity,
    protocol: String,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    /// Bytes read past the last returned line.
    pending: Vec<u8>,
    limits: StreamLimits,
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl PeerStream {
    fn new(peer: Identity, send: quinn::SendStream, recv: quinn::RecvStream, limits: StreamLimits) -> Self {
        Self {
            peer,
            protocol: String::new(),
            send,
            recv,
            pending: Vec::new(),
            limits,
        }
    }

    /// Identity of the remote end, verified during the TLS handshake.
    pub fn peer(&self) -> Identity {
        self.peer
    }

    /// Negotiated protocol id.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Read one `\n`-terminated line, terminator included.
    pub async fn read_line(&mut self) -> Result<String> {
        let timeout = self.limits.timeout;
        let max = self.limits.max_line;
        let bytes = tokio::time::timeout(timeout, self.read_line_bytes(max))
            .await
            .map_err(|_| TnsError::timed_out("stream read", timeout))??;
        String::from_utf8(bytes).map_err(|_| TnsError::Transport("request line is not valid utf-8".to_string()))
    }

    async fn read_line_bytes(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.pending[scanned..].iter().position(|b| *b == b'\n') {
                let end = scanned + pos + 1;
                let rest = self.pending.split_off(end);
                return Ok(std::mem::replace(&mut self.pending, rest));
            }
            scanned = self.pending.len();
            if scanned > max {
                return Err(TnsError::Transport(format!(
                    "line exceeds {} bytes without a newline",
                    max
                )));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.recv.read(&mut chunk).await.map_err(read_error)? {
                Some(n) => self.pending.extend_from_slice(&chunk[..n]),
                None => {
                    return Err(TnsError::Transport(
                        "stream finished before end of line".to_string(),
                    ));
                }
            }
        }
    }

    /// Write the whole buffer.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let timeout = self.limits.timeout;
        tokio::time::timeout(timeout, self.send.write_all(buf))
            .await
            .map_err(|_| TnsError::timed_out("stream write", timeout))?
            .map_err(write_error)
    }

    /// Read until the remote finishes its write side.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let timeout = self.limits.timeout;
        let max = self.limits.max_body;
        let budget = max.saturating_sub(self.pending.len());

        let rest = tokio::time::timeout(timeout, self.recv.read_to_end(budget))
            .await
            .map_err(|_| TnsError::timed_out("stream read", timeout))?
            .map_err(|e| match e {
                ReadToEndError::Read(err) => read_error(err),
                ReadToEndError::TooLong => {
                    TnsError::Transport(format!("response exceeds {} bytes", max))
                }
            })?;

        let mut body = std::mem::take(&mut self.pending);
        body.extend_from_slice(&rest);
        Ok(body)
    }

    /// Finish the write side; buffered data is still delivered.
    pub fn close(&mut self) -> Result<()> {
        self.send.finish().map_err(TnsError::transport)
    }

    /// Abort both directions with an application error code.
    pub fn reset(&mut self, code: u32) {
        let code = VarInt::from_u32(code);
        let _ = self.send.reset(code);
        let _ = self.recv.stop(code);
    }

    /// Opener side: open a stream on `conn` and negotiate `protocol`.
    pub(crate) async fn open(
        conn: &Connection,
        peer: Identity,
        protocol: &str,
        limits: StreamLimits,
    ) -> Result<Self> {
        let deadline = limits.negotiation_timeout;
        tokio::time::timeout(deadline, async {
            let (send, recv) = conn.open_bi().await.map_err(TnsError::transport)?;
            let mut stream = PeerStream::new(peer, send, recv, limits);

            let mut line = Vec::with_capacity(protocol.len() + 1);
            line.extend_from_slice(protocol.as_bytes());
            line.push(b'\n');
            stream.send.write_all(&line).await.map_err(write_error)?;

            let reply = stream.read_line_bytes(MAX_PROTOCOL_ID_LEN).await?;
            let reply = trim_line(&reply);
            if reply == NOT_AVAILABLE.as_bytes() {
                return Err(TnsError::Transport(format!("protocol not supported: {}", protocol)));
            }
            if reply != protocol.as_bytes() {
                return Err(TnsError::Transport(format!(
                    "protocol negotiation failed: expected {}, got {:?}",
                    protocol,
                    String::from_utf8_lossy(reply)
                )));
            }

            stream.protocol = protocol.to_string();
            Ok(stream)
        })
        .await
        .map_err(|_| TnsError::timed_out("protocol negotiation", deadline))?
    }

    /// Acceptor side: wrap an inbound stream and read the requested protocol id.
    pub(crate) async fn accept(
        peer: Identity,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        limits: StreamLimits,
    ) -> Result<Self> {
        let deadline = limits.negotiation_timeout;
        let mut stream = PeerStream::new(peer, send, recv, limits);
        let line = tokio::time::timeout(deadline, stream.read_line_bytes(MAX_PROTOCOL_ID_LEN))
            .await
            .map_err(|_| TnsError::timed_out("protocol negotiation", deadline))??;

        let protocol = std::str::from_utf8(trim_line(&line))
            .map_err(|_| TnsError::Transport("protocol id is not valid utf-8".to_string()))?;
        stream.protocol = protocol.to_string();
        Ok(stream)
    }

    /// Confirm the requested protocol to the opener.
    pub(crate) async fn confirm_protocol(&mut self) -> Result<()> {
        let mut line = self.protocol.clone().into_bytes();
        line.push(b'\n');
        self.write_all(&line).await
    }

    /// Tell the opener no handler is bound and finish the stream.
    pub(crate) async fn refuse_protocol(&mut self) -> Result<()> {
        let line = format!("{}\n", NOT_AVAILABLE);
        self.write_all(line.as_bytes()).await?;
        self.close()
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_codes_follow_error_kind() {
        assert_eq!(reset_code_for(&TnsError::NotImplemented), RESET_NOT_IMPLEMENTED);

        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(reset_code_for(&TnsError::Serialization(bad_json)), RESET_MALFORMED);

        assert_eq!(
            reset_code_for(&TnsError::ContentStore("down".into())),
            RESET_INTERNAL
        );
    }

    #[test]
    fn reset_code_two_maps_back_to_not_implemented() {
        assert!(matches!(
            reset_error(VarInt::from_u32(RESET_NOT_IMPLEMENTED)),
            TnsError::NotImplemented
        ));
        assert!(matches!(
            reset_error(VarInt::from_u32(RESET_INTERNAL)),
            TnsError::Transport(ref m) if m.contains("code 1")
        ));
    }

    #[test]
    fn trim_line_strips_terminators() {
        assert_eq!(trim_line(b"/echo/0.0.1\n"), b"/echo/0.0.1");
        assert_eq!(trim_line(b"na\r\n"), b"na");
        assert_eq!(trim_line(b"bare"), b"bare");
    }
}
