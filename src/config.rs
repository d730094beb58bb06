//! Host settings and the `tns` binary's configuration file.

use std::net::SocketAddr;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default deadline for a single stream read or write.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for the protocol-id exchange at stream open.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum size of one request line (64 KiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Maximum size of a response body (1 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Settings for a [`PeerHost`](crate::host::PeerHost).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// UDP address the QUIC endpoint binds. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    pub stream_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub max_request_size: usize,
    pub max_response_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }
}

impl HostConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub(crate) fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            timeout: self.stream_timeout,
            negotiation_timeout: self.negotiation_timeout,
            max_line: self.max_request_size,
            max_body: self.max_response_size,
        }
    }
}

/// Per-stream deadlines and size bounds, copied into every `PeerStream`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamLimits {
    pub timeout: Duration,
    pub negotiation_timeout: Duration,
    pub max_line: usize,
    pub max_body: usize,
}

/// A zone the daemon creates at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSpec {
    pub name: String,
    /// Escrow name for the zone's private key.
    pub key_name: String,
}

impl std::str::FromStr for ZoneSpec {
    type Err = String;

    /// Parses `NAME:KEY`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, key)) if !name.is_empty() && !key.is_empty() => Ok(Self {
                name: name.to_string(),
                key_name: key.to_string(),
            }),
            _ => Err(format!("expected NAME:KEY, got {s:?}")),
        }
    }
}

/// On-disk configuration for `tns daemon`. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TnsConfig {
    pub listen_addr: Option<SocketAddr>,
    pub manager_key_name: Option<String>,
    pub zones: Vec<ZoneSpec>,
    pub stream_timeout_secs: Option<u64>,
    pub log_filter: Option<String>,
    /// Append logs here instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl TnsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Host settings with the file's overrides applied over the defaults.
    pub fn host_config(&self) -> HostConfig {
        let mut config = HostConfig::default();
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(secs) = self.stream_timeout_secs {
            config.stream_timeout = Duration::from_secs(secs);
        }
        config
    }

    /// Open `log_file` for appending, creating it if needed.
    pub fn open_log_file(&self) -> Result<Option<File>> {
        let Some(path) = &self.log_file else {
            return Ok(None);
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Some(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_limits() {
        let config = HostConfig::default();
        assert_eq!(config.stream_timeout, Duration::from_secs(30));
        assert_eq!(config.negotiation_timeout, Duration::from_secs(5));
        assert_eq!(config.max_request_size, 64 * 1024);
        assert_eq!(config.max_response_size, 1024 * 1024);
        assert_eq!(config.listen_addr.port(), 0);
    }

    #[test]
    fn zone_spec_parsing() {
        let spec: ZoneSpec = "example:example-key".parse().unwrap();
        assert_eq!(spec.name, "example");
        assert_eq!(spec.key_name, "example-key");

        assert!("example".parse::<ZoneSpec>().is_err());
        assert!(":key".parse::<ZoneSpec>().is_err());
        assert!("name:".parse::<ZoneSpec>().is_err());
    }

    #[test]
    fn load_applies_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "listen_addr": "0.0.0.0:4005",
                "manager_key_name": "manager",
                "zones": [{{"name": "example", "key_name": "example-key"}}],
                "stream_timeout_secs": 7
            }}"#
        )
        .unwrap();

        let config = TnsConfig::load(file.path()).unwrap();
        assert_eq!(config.manager_key_name.as_deref(), Some("manager"));
        assert_eq!(config.zones.len(), 1);

        let host = config.host_config();
        assert_eq!(host.listen_addr, "0.0.0.0:4005".parse().unwrap());
        assert_eq!(host.stream_timeout, Duration::from_secs(7));
        assert_eq!(host.negotiation_timeout, DEFAULT_NEGOTIATION_TIMEOUT);
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"listen": "0.0.0.0:1"}}"#).unwrap();
        assert!(TnsConfig::load(file.path()).is_err());
    }

    #[test]
    fn empty_file_object_is_all_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();
        let config = TnsConfig::load(file.path()).unwrap();
        assert_eq!(config, TnsConfig::default());
        assert_eq!(config.host_config(), HostConfig::default());
    }

    #[test]
    fn log_file_is_opened_for_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tns.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"log_file": {}}}"#, serde_json::to_string(&path).unwrap()).unwrap();
        let config = TnsConfig::load(file.path()).unwrap();
        assert_eq!(config.log_file.as_deref(), Some(path.as_path()));

        let mut log = config.open_log_file().unwrap().unwrap();
        log.write_all(b"later\n").unwrap();
        drop(log);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "earlier\nlater\n");

        assert!(TnsConfig::default().open_log_file().unwrap().is_none());

        let missing = TnsConfig {
            log_file: Some(dir.path().join("no-such-dir").join("tns.log")),
            ..TnsConfig::default()
        };
        assert!(missing.open_log_file().is_err());
    }
}
