//! # Peer Addresses
//!
//! Peers are addressed by self-describing, slash-separated segment lists:
//!
//! ```text
//! /ip4/127.0.0.1/udp/4001/quic-v1/p2p/<64 hex chars>
//! /ip6/::1/udp/4001/quic-v1/p2p/<64 hex chars>
//! /dnsaddr/example.com
//! ```
//!
//! | Segment | Value | Meaning |
//! |---------|-------|---------|
//! | `ip4` / `ip6` | IP literal | Transport host |
//! | `udp` | port | Transport port |
//! | `quic-v1` | none | Transport marker (optional on input) |
//! | `p2p` | hex identity | Embedded peer id |
//! | `dnsaddr` | domain | Name to resolve through a [`NameResolver`](crate::discovery::NameResolver) |
//!
//! Parsing is strict: unknown segments, missing values and duplicate
//! segments are rejected.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::TnsError;
use crate::identity::Identity;

/// Upper bound on address length accepted from peers and resolvers.
const MAX_ADDR_LEN: usize = 512;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct PeerAddr {
    ip: Option<IpAddr>,
    port: Option<u16>,
    peer: Option<Identity>,
    dnsaddr: Option<String>,
}

impl PeerAddr {
    pub fn from_socket_addr(addr: SocketAddr, peer: Option<Identity>) -> Self {
        Self {
            ip: Some(addr.ip()),
            port: Some(addr.port()),
            peer,
            dnsaddr: None,
        }
    }

    /// The embedded peer id, if the address carries a `/p2p/` segment.
    pub fn peer_id(&self) -> Option<Identity> {
        self.peer
    }

    /// The dialable transport address, if both host and port are present.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.ip?, self.port?))
    }

    pub fn dnsaddr(&self) -> Option<&str> {
        self.dnsaddr.as_deref()
    }

    pub fn with_peer(mut self, peer: Identity) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl FromStr for PeerAddr {
    type Err = TnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TnsError::Address("empty address".to_string()));
        }
        if s.len() > MAX_ADDR_LEN {
            return Err(TnsError::Address(format!(
                "address too long: {} bytes (max {})",
                s.len(),
                MAX_ADDR_LEN
            )));
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(TnsError::Address(format!("{s:?} must start with '/'")));
        };

        let mut addr = PeerAddr::default();
        let mut quic = false;
        let mut segments = rest.split('/');

        while let Some(proto) = segments.next() {
            if proto == "quic-v1" {
                if quic {
                    return Err(duplicate(proto));
                }
                quic = true;
                continue;
            }

            let value = match segments.next() {
                Some(v) if !v.is_empty() => v,
                _ => return Err(TnsError::Address(format!("segment {proto:?} is missing a value"))),
            };

            match proto {
                "ip4" | "ip6" => {
                    if addr.ip.is_some() {
                        return Err(duplicate(proto));
                    }
                    let ip: IpAddr = value
                        .parse()
                        .map_err(|_| TnsError::Address(format!("invalid {proto} address {value:?}")))?;
                    if (proto == "ip4") != ip.is_ipv4() {
                        return Err(TnsError::Address(format!("{value:?} is not an {proto} address")));
                    }
                    addr.ip = Some(ip);
                }
                "udp" => {
                    if addr.port.is_some() {
                        return Err(duplicate(proto));
                    }
                    let port = value
                        .parse()
                        .map_err(|_| TnsError::Address(format!("invalid port {value:?}")))?;
                    addr.port = Some(port);
                }
                "p2p" => {
                    if addr.peer.is_some() {
                        return Err(duplicate(proto));
                    }
                    let id = Identity::from_hex(value)
                        .map_err(|e| TnsError::Address(format!("invalid peer id {value:?}: {e}")))?;
                    addr.peer = Some(id);
                }
                "dnsaddr" => {
                    if addr.dnsaddr.is_some() {
                        return Err(duplicate(proto));
                    }
                    addr.dnsaddr = Some(value.to_string());
                }
                other => {
                    return Err(TnsError::Address(format!("unsupported segment {other:?}")));
                }
            }
        }

        if addr.ip.is_some() != addr.port.is_some() {
            return Err(TnsError::Address(format!(
                "{s:?} must carry both a host and a udp port"
            )));
        }

        Ok(addr)
    }
}

fn duplicate(proto: &str) -> TnsError {
    TnsError::Address(format!("duplicate segment {proto:?}"))
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(domain) = &self.dnsaddr {
            write!(f, "/dnsaddr/{}", domain)?;
        }
        if let (Some(ip), Some(port)) = (self.ip, self.port) {
            let proto = if ip.is_ipv4() { "ip4" } else { "ip6" };
            write!(f, "/{}/{}/udp/{}/quic-v1", proto, ip, port)?;
        }
        if let Some(peer) = self.peer {
            write!(f, "/p2p/{}", peer)?;
        }
        Ok(())
    }
}
