//! Error taxonomy shared by the host, daemon and client.
//!
//! Collaborator traits (key escrow, content store, zone store, resolvers)
//! return `anyhow::Result`; their failures are folded into the matching
//! variant here with the full context chain rendered via `{:#}`.

use std::time::Duration;

/// Errors surfaced by TNS operations.
#[derive(Debug, thiserror::Error)]
pub enum TnsError {
    /// Malformed or incomplete peer address.
    #[error("invalid peer address: {0}")]
    Address(String),

    /// Stream open/read/write failure, including remote resets.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed JSON payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unrecognized local command name passed to the client.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Zone name collision within one daemon's registry.
    #[error("zone {0:?} is already managed by this daemon")]
    AlreadyManaged(String),

    /// Record requests are not served.
    #[error("not yet implemented")]
    NotImplemented,

    /// The key escrow rejected the private key.
    #[error("key escrow failed: {0}")]
    Escrow(String),

    #[error("content store failure: {0}")]
    ContentStore(String),

    /// The QUIC endpoint could not be created on the listen address.
    #[error("failed to bind host: {0}")]
    Bind(String),

    /// A domain did not resolve to any usable peer address.
    #[error("name resolution failed: {0}")]
    Resolution(String),
}

impl TnsError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        TnsError::Transport(err.to_string())
    }

    pub(crate) fn timed_out(what: &str, after: Duration) -> Self {
        TnsError::Transport(format!("{} timed out after {:?}", what, after))
    }
}

pub type Result<T, E = TnsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_managed_names_the_zone() {
        let err = TnsError::AlreadyManaged("example".to_string());
        assert_eq!(
            err.to_string(),
            "zone \"example\" is already managed by this daemon"
        );
    }

    #[test]
    fn json_errors_convert_into_serialization() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: TnsError = bad.unwrap_err().into();
        assert!(matches!(err, TnsError::Serialization(_)));
    }

    #[test]
    fn timeout_is_reported_as_transport() {
        let err = TnsError::timed_out("stream read", Duration::from_secs(3));
        assert!(matches!(err, TnsError::Transport(ref m) if m.contains("stream read timed out")));
    }
}
