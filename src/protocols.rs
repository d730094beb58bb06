//! Protocol identifiers and the stream handler seam.
//!
//! Each TNS command is a variant of the closed [`Command`] enum carrying its
//! stable, versioned wire token. The same token routes an inbound stream to
//! its handler on a [`PeerHost`](crate::host::PeerHost) and lets a client pick
//! which handler it targets.
//!
//! | Command | Token | Client name |
//! |---------|-------|-------------|
//! | RecordRequest | `/record/request/0.0.1` | `record-request` |
//! | ZoneRequest | `/zone/request/0.0.1` | `zone-request` |
//! | Echo | `/echo/0.0.1` | `echo` |
//!
//! Tokens are append-only. A change in request/response shape gets a new
//! version token; editing an existing token in place breaks every peer still
//! speaking the old one.

use async_trait::async_trait;

use crate::transport::PeerStream;

/// Protocol family identifier for the name server as a whole.
pub const TNS_PROTOCOL: &str = "/tns/0.0.1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Resolve a record within a zone (ie web.example.com).
    RecordRequest,
    /// Request the latest document of a zone (ie example.com).
    ZoneRequest,
    /// Connectivity test; the daemon repeats what it was sent.
    Echo,
}

impl Command {
    pub const ALL: [Command; 3] = [Command::RecordRequest, Command::ZoneRequest, Command::Echo];

    /// Versioned wire token used for stream routing.
    pub const fn protocol_id(self) -> &'static str {
        match self {
            Command::RecordRequest => "/record/request/0.0.1",
            Command::ZoneRequest => "/zone/request/0.0.1",
            Command::Echo => "/echo/0.0.1",
        }
    }

    /// Name accepted by [`Client::query_tns`](crate::client::Client::query_tns).
    pub const fn name(self) -> &'static str {
        match self {
            Command::RecordRequest => "record-request",
            Command::ZoneRequest => "zone-request",
            Command::Echo => "echo",
        }
    }

    /// Stable numeric code of the command. Codes are never reassigned.
    pub const fn code(self) -> i32 {
        match self {
            Command::RecordRequest => 0,
            Command::ZoneRequest => 1,
            Command::Echo => 2,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn from_protocol_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.protocol_id() == id)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.protocol_id())
    }
}

/// Services one inbound stream for a bound protocol id.
///
/// The host spawns one task per inbound stream, so implementations run
/// concurrently with each other and must synchronize any shared state.
/// The handler owns the stream and decides whether it ends with
/// [`PeerStream::close`] or [`PeerStream::reset`].
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, stream: PeerStream);
}
