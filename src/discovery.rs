//! Peer discovery through DNS.
//!
//! A domain advertises its TNS daemons with TXT records on
//! `_dnsaddr.<domain>`, one address per record:
//!
//! ```text
//! _dnsaddr.example.com. TXT "dnsaddr=/ip4/203.0.113.7/udp/4001/quic-v1/p2p/<peer-id>"
//! ```
//!
//! A value may itself be a `/dnsaddr/<domain>` address, which is expanded
//! in turn up to [`MAX_DNSADDR_DEPTH`] levels.

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::Resolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::{debug, trace};

use crate::error::TnsError;

const DNSADDR_PREFIX: &str = "dnsaddr=";

/// Nested `/dnsaddr/` values beyond this depth are dropped.
pub const MAX_DNSADDR_DEPTH: usize = 3;

/// Resolves a domain into peer address strings.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<Vec<String>>;
}

/// Accept either a bare domain or a `/dnsaddr/<domain>` address.
pub fn domain_of(input: &str) -> Result<&str, TnsError> {
    let domain = match input.strip_prefix("/dnsaddr/") {
        Some(rest) => rest,
        None if input.starts_with('/') => {
            return Err(TnsError::Address(format!("{input:?} is not a /dnsaddr/ address")));
        }
        None => input,
    };
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() || domain.contains('/') {
        return Err(TnsError::Address(format!("invalid domain {input:?}")));
    }
    Ok(domain)
}

/// Values of every `dnsaddr=` TXT entry, in record order.
pub fn parse_dnsaddr_values<I, S>(records: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    records
        .into_iter()
        .filter_map(|txt| {
            txt.as_ref()
                .trim()
                .strip_prefix(DNSADDR_PREFIX)
                .map(|value| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
        .collect()
}

/// Resolver backed by live DNS TXT lookups.
pub struct DnsAddrResolver {
    resolver: Resolver<TokioConnectionProvider>,
}

impl DnsAddrResolver {
    /// Use the given upstream configuration.
    pub fn with_config(config: ResolverConfig) -> Self {
        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default()).build();
        Self { resolver }
    }

    /// Use the host's resolver configuration (`/etc/resolv.conf` on Unix).
    pub fn from_system() -> Result<Self> {
        let resolver = Resolver::builder_tokio()
            .context("failed to read system resolver configuration")?
            .build();
        Ok(Self { resolver })
    }

    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>> {
        let name = format!("_dnsaddr.{}.", domain);
        let lookup = self
            .resolver
            .txt_lookup(name.as_str())
            .await
            .with_context(|| format!("TXT lookup for {} failed", name))?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect::<String>()
            })
            .collect())
    }
}

impl Default for DnsAddrResolver {
    fn default() -> Self {
        Self::with_config(ResolverConfig::default())
    }
}

#[async_trait]
impl NameResolver for DnsAddrResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<String>> {
        let root = domain_of(domain)?.to_string();
        let mut pending = VecDeque::from([(root, 0usize)]);
        let mut addrs = Vec::new();

        while let Some((domain, depth)) = pending.pop_front() {
            let values = parse_dnsaddr_values(self.lookup_txt(&domain).await?);
            trace!(domain = %domain, count = values.len(), "dnsaddr records");

            for value in values {
                match value.strip_prefix("/dnsaddr/") {
                    Some(nested) if depth < MAX_DNSADDR_DEPTH => {
                        pending.push_back((nested.to_string(), depth + 1));
                    }
                    Some(_) => debug!(value = %value, "dnsaddr nesting too deep, skipping"),
                    None => addrs.push(value),
                }
            }
        }

        Ok(addrs)
    }
}

/// Fixed domain to address table.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, domain: &str, addrs: Vec<String>) -> Self {
        self.insert(domain, addrs);
        self
    }

    pub fn insert(&mut self, domain: &str, addrs: Vec<String>) {
        self.entries
            .insert(domain.trim_end_matches('.').to_string(), addrs);
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<String>> {
        let domain = domain_of(domain)?;
        Ok(self.entries.get(domain).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_forms() {
        assert_eq!(domain_of("example.com").unwrap(), "example.com");
        assert_eq!(domain_of("/dnsaddr/example.com").unwrap(), "example.com");
        assert_eq!(domain_of("example.com.").unwrap(), "example.com");

        assert!(domain_of("").is_err());
        assert!(domain_of("/dnsaddr/").is_err());
        assert!(domain_of("/ip4/127.0.0.1/udp/1").is_err());
    }

    #[test]
    fn only_dnsaddr_entries_are_kept() {
        let values = parse_dnsaddr_values([
            "v=spf1 -all",
            "dnsaddr=/ip4/203.0.113.7/udp/4001/quic-v1/p2p/abc",
            "dnsaddr=",
            " dnsaddr=/dnsaddr/nested.example.com ",
        ]);
        assert_eq!(
            values,
            vec![
                "/ip4/203.0.113.7/udp/4001/quic-v1/p2p/abc".to_string(),
                "/dnsaddr/nested.example.com".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn static_resolver_accepts_both_forms() {
        let resolver = StaticResolver::new().with_entry("example.com", vec!["/ip4/127.0.0.1/udp/1".into()]);

        assert_eq!(resolver.resolve("example.com").await.unwrap().len(), 1);
        assert_eq!(resolver.resolve("/dnsaddr/example.com").await.unwrap().len(), 1);
        assert!(resolver.resolve("other.com").await.unwrap().is_empty());
    }
}
