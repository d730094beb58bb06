//! # TNS Client
//!
//! A [`Client`] runs its own [`PeerHost`] and issues one request per stream:
//!
//! 1. open a stream on the command's protocol id,
//! 2. write the JSON request and `\n`, then finish the write side,
//! 3. read the response until the daemon finishes its side.
//!
//! Zone responses are content hashes. [`Client::query`] dereferences them
//! once against the client's [`ContentStore`]; [`Client::query_raw`] returns
//! the bytes untouched.

use std::sync::Arc;

use tracing::debug;

use crate::config::HostConfig;
use crate::discovery::{DnsAddrResolver, NameResolver};
use crate::error::{Result, TnsError};
use crate::host::PeerHost;
use crate::identity::{Identity, Keypair};
use crate::messages::{NOT_MANAGED, Record, Request, Zone};
use crate::protocols::Command;
use crate::stores::ContentStore;

pub struct ClientOptions {
    /// Identity to use; a fresh one is generated when `None`.
    pub keypair: Option<Keypair>,
    pub host: HostConfig,
    /// Store zone hashes are dereferenced against.
    pub content: Arc<dyn ContentStore>,
    pub resolver: Arc<dyn NameResolver>,
}

impl ClientOptions {
    /// Fresh identity, default host settings and the live DNS resolver.
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self {
            keypair: None,
            host: HostConfig::default(),
            content,
            resolver: Arc::new(DnsAddrResolver::default()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Decoded answer to a query.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResponse {
    Echo(String),
    Zone { hash: String, zone: Zone },
    Record { hash: String, record: Record },
    /// The daemon does not manage the requested zone.
    NotManaged,
}

pub struct Client {
    host: PeerHost,
    content: Arc<dyn ContentStore>,
    resolver: Arc<dyn NameResolver>,
}

impl Client {
    pub async fn new(opts: ClientOptions) -> Result<Self> {
        let keypair = opts.keypair.unwrap_or_else(Keypair::generate);
        let host = PeerHost::bind(keypair, opts.host).await?;
        Ok(Self {
            host,
            content: opts.content,
            resolver: opts.resolver,
        })
    }

    pub fn peer_id(&self) -> Identity {
        self.host.peer_id()
    }

    pub fn host(&self) -> &PeerHost {
        &self.host
    }

    pub async fn add_peer(&self, address: &str) -> Result<Identity> {
        self.host.add_peer(address).await
    }

    /// Query by client command name (`echo`, `zone-request`,
    /// `record-request`). `None` args fall back to the built-in defaults.
    pub async fn query_tns(
        &self,
        peer: &Identity,
        command: &str,
        args: Option<serde_json::Value>,
    ) -> Result<QueryResponse> {
        let Some(command) = Command::from_name(command) else {
            return Err(TnsError::UnsupportedCommand(command.to_string()));
        };
        let request = Request::from_args(command, args)?;
        self.query(peer, request).await
    }

    pub async fn query(&self, peer: &Identity, request: Request) -> Result<QueryResponse> {
        let command = request.command();
        let bytes = self.query_raw(peer, &request).await?;

        if command == Command::Echo {
            return Ok(QueryResponse::Echo(String::from_utf8_lossy(&bytes).into_owned()));
        }

        let text = String::from_utf8(bytes)
            .map_err(|_| TnsError::Transport("response is not valid utf-8".to_string()))?;
        let hash = text.trim();
        if hash == NOT_MANAGED {
            return Ok(QueryResponse::NotManaged);
        }
        if hash.is_empty() {
            return Err(TnsError::Transport("empty response".to_string()));
        }

        let document = self
            .content
            .get(hash)
            .await
            .map_err(|e| TnsError::ContentStore(format!("{:#}", e)))?;
        debug!(hash = %hash, bytes = document.len(), "dereferenced response");

        match command {
            Command::RecordRequest => Ok(QueryResponse::Record {
                hash: hash.to_string(),
                record: serde_json::from_slice(&document)?,
            }),
            _ => Ok(QueryResponse::Zone {
                hash: hash.to_string(),
                zone: serde_json::from_slice(&document)?,
            }),
        }
    }

    /// Send `request` and return the response bytes without interpretation.
    pub async fn query_raw(&self, peer: &Identity, request: &Request) -> Result<Vec<u8>> {
        let command = request.command();
        let line = request.to_line()?;
        let mut stream = self.host.open_stream(peer, command.protocol_id()).await?;

        let written = match stream.write_all(&line).await {
            Ok(()) => stream.close(),
            Err(e) => Err(e),
        };
        // A rejected request shows up as a reset on the read side; report that
        // rather than the write failure it may have caused.
        let response = stream.read_to_end().await;

        match (written, response) {
            (_, Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), Ok(bytes)) => {
                debug!(peer = %peer.short(), command = command.name(), bytes = bytes.len(), "query answered");
                Ok(bytes)
            }
        }
    }

    /// Resolve `domain` and register the first address it yields.
    pub async fn find_peer(&self, domain: &str) -> Result<Identity> {
        let addrs = self
            .resolver
            .resolve(domain)
            .await
            .map_err(|e| TnsError::Resolution(format!("{:#}", e)))?;

        let Some(first) = addrs.first() else {
            return Err(TnsError::Resolution(format!("no addresses found for {}", domain)));
        };
        debug!(domain = domain, addr = %first, candidates = addrs.len(), "resolved peer");
        self.host.add_peer(first).await
    }

    pub async fn close(&self) {
        self.host.close().await;
    }
}
