//! # Wire Messages and Documents
//!
//! Requests travel as one JSON document followed by a single `\n`.
//! Responses are raw bytes read until the remote finishes the stream.
//!
//! | Command | Request | Response |
//! |---------|---------|----------|
//! | Echo | JSON string | [`echo_response`] text |
//! | ZoneRequest | [`ZoneRequest`] | content hash, or [`NOT_MANAGED`] |
//! | RecordRequest | [`RecordRequest`] | stream reset (unimplemented) |
//!
//! [`ZoneCreation`] and [`RecordCreation`] are local calls and never cross
//! the wire. [`Zone`] is the document published to the content store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TnsError;
use crate::protocols::Command;

/// Response written when a zone is unknown to the queried daemon.
pub const NOT_MANAGED: &str = "daemon is not a manager for this zone";

pub(crate) const DEFAULT_ZONE_NAME: &str = "myzone";
pub(crate) const DEFAULT_ZONE_MANAGER_KEY_NAME: &str = "postables-3072";
pub(crate) const DEFAULT_USER_NAME: &str = "postables";
pub(crate) const DEFAULT_RECORD_NAME: &str = "myrecord";
pub(crate) const DEFAULT_ECHO_TEXT: &str = "hello from tns client";

/// Format the daemon's echo reply around the line it received.
pub fn echo_response(received: &str) -> String {
    format!("echo test...\nyou sent: {}\n", received)
}

/// Request for the latest document of a zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRequest {
    pub user_name: String,
    pub zone_name: String,
    pub zone_manager_key_name: String,
}

impl Default for ZoneRequest {
    fn default() -> Self {
        Self {
            user_name: DEFAULT_USER_NAME.to_string(),
            zone_name: DEFAULT_ZONE_NAME.to_string(),
            zone_manager_key_name: DEFAULT_ZONE_MANAGER_KEY_NAME.to_string(),
        }
    }
}

/// Request for a single record; the response would be a [`Record`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRequest {
    pub record_name: String,
    pub user_name: String,
}

impl Default for RecordRequest {
    fn default() -> Self {
        Self {
            record_name: DEFAULT_RECORD_NAME.to_string(),
            user_name: DEFAULT_USER_NAME.to_string(),
        }
    }
}

/// Local request to create a zone on a daemon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneCreation {
    pub name: String,
    pub manager_key_name: String,
    pub zone_key_name: String,
}

/// Local request to create a record within a zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordCreation {
    pub zone_name: String,
    pub record_name: String,
    pub record_key_name: String,
    #[serde(default)]
    pub meta_data: serde_json::Map<String, serde_json::Value>,
}

/// The authorized manager of a zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneManager {
    pub public_key: String,
}

/// A named entry managed by a zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub public_key: String,
    pub name: String,
    #[serde(default)]
    pub meta_data: serde_json::Map<String, serde_json::Value>,
}

/// A mapping of human readable names to public keys, published as an
/// immutable content-addressed document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(rename = "zone_manager")]
    pub manager: ZoneManager,
    #[serde(rename = "zone_public_key")]
    pub public_key: String,
    pub name: String,
    #[serde(default)]
    pub records: BTreeMap<String, Record>,
    #[serde(default)]
    pub record_names_to_public_keys: BTreeMap<String, String>,
}

impl Zone {
    /// A freshly created zone holds no records.
    pub fn new(name: impl Into<String>, zone_public_key: String, manager_public_key: String) -> Self {
        Self {
            manager: ZoneManager {
                public_key: manager_public_key,
            },
            public_key: zone_public_key,
            name: name.into(),
            records: BTreeMap::new(),
            record_names_to_public_keys: BTreeMap::new(),
        }
    }
}

/// A typed request ready to be written to a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Echo(String),
    Zone(ZoneRequest),
    Record(RecordRequest),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Echo(_) => Command::Echo,
            Request::Zone(_) => Command::ZoneRequest,
            Request::Record(_) => Command::RecordRequest,
        }
    }

    /// Build the request for `command`, substituting defaults when `args` is `None`.
    pub fn from_args(command: Command, args: Option<serde_json::Value>) -> Result<Self, TnsError> {
        let request = match (command, args) {
            (Command::Echo, None) => Request::Echo(DEFAULT_ECHO_TEXT.to_string()),
            (Command::Echo, Some(v)) => Request::Echo(serde_json::from_value(v)?),
            (Command::ZoneRequest, None) => Request::Zone(ZoneRequest::default()),
            (Command::ZoneRequest, Some(v)) => Request::Zone(serde_json::from_value(v)?),
            (Command::RecordRequest, None) => Request::Record(RecordRequest::default()),
            (Command::RecordRequest, Some(v)) => Request::Record(serde_json::from_value(v)?),
        };
        Ok(request)
    }

    /// JSON body plus the `\n` terminator.
    pub fn to_line(&self) -> Result<Vec<u8>, TnsError> {
        let mut bytes = match self {
            Request::Echo(text) => serde_json::to_vec(text)?,
            Request::Zone(req) => serde_json::to_vec(req)?,
            Request::Record(req) => serde_json::to_vec(req)?,
        };
        bytes.push(b'\n');
        Ok(bytes)
    }
}
