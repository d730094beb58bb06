//! # TNS - Temporal Name Server
//!
//! A peer-to-peer name service. Daemons publish *zones* (namespaces of named
//! records, each owned by its own Ed25519 identity) as content-addressed
//! documents; clients resolve zone names by querying daemons over QUIC.
//!
//! ## Architecture
//!
//! ```text
//! Client ──open_stream──► PeerHost ══QUIC══► PeerHost ──► Daemon handler
//!                                                         │
//!                                         zone registry ◄─┤
//!                              KeyStore / ContentStore  ◄─┘
//! ```
//!
//! - Identity = Ed25519 public key; the peer id is its lowercase hex form
//! - One bidirectional stream per request, routed by protocol id
//! - Zone responses are content hashes the client dereferences itself
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Keypairs and identities |
//! | `address` | Peer address parsing and formatting |
//! | `crypto` | TLS certificate generation and verification |
//! | `transport` | Connection pool actor and deadline-bounded streams |
//! | `host` | Peer host: endpoint, address book, stream handler routing |
//! | `protocols` | Command set and protocol ids |
//! | `messages` | JSON request and document types |
//! | `stores` | Key escrow, content and metadata store traits |
//! | `daemon` | Zone manager daemon |
//! | `client` | Query client |
//! | `discovery` | `_dnsaddr` peer discovery |
//! | `config` | Host settings and config file |

mod address;
mod client;
mod config;
mod crypto;
mod daemon;
mod discovery;
mod error;
mod host;
mod identity;
mod messages;
mod protocols;
mod stores;
mod transport;

pub use address::PeerAddr;
pub use client::{Client, ClientOptions, QueryResponse};
pub use config::{HostConfig, TnsConfig, ZoneSpec};
pub use daemon::{CreatedZone, Daemon, DaemonStores, Persistence};
pub use discovery::{DnsAddrResolver, NameResolver, StaticResolver};
pub use error::{Result, TnsError};
pub use host::PeerHost;
pub use identity::{Identity, Keypair};
pub use messages::{
    NOT_MANAGED, Record, RecordCreation, RecordRequest, Request, Zone, ZoneCreation, ZoneManager,
    ZoneRequest, echo_response,
};
pub use protocols::{Command, StreamHandler, TNS_PROTOCOL};
pub use stores::{
    Codec, ContentStore, KeyStore, MemoryContentStore, MemoryKeyStore, MemoryRecordStore,
    MemoryZoneStore, RecordRow, RecordStore, ZoneRow, ZoneStore, content_hash,
};
pub use transport::{PeerStream, RESET_INTERNAL, RESET_MALFORMED, RESET_NOT_IMPLEMENTED};
