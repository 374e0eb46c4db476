//! DNS resolution capability.
//!
//! The engine consumes the [`Resolver`] trait; [`DnsResolver`] is the
//! production implementation, a thin wrapper over hickory's tokio resolver
//! configured to chase A and AAAA records together with retries and a
//! per-query timeout.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;

/// DNS lookup attempts per query before giving up.
const LOOKUP_ATTEMPTS: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("empty hostname")]
    EmptyHostname,

    #[error("no records found for {domain}")]
    NoRecords { domain: String },

    #[error("dns lookup for {domain} failed: {source}")]
    Lookup {
        domain: String,
        #[source]
        source: ResolveError,
    },
}

/// Hostname → address-set resolution.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves a hostname to its IPv4 and IPv6 addresses.
    ///
    /// # Errors
    ///
    /// [`ResolverError::EmptyHostname`] for blank input,
    /// [`ResolverError::NoRecords`] when the name exists but has no
    /// addresses, and [`ResolverError::Lookup`] for transport or server
    /// failures.
    async fn lookup_host(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolverError>;
}

/// hickory-backed resolver.
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    /// Builds a resolver with the given per-query timeout. Uses the
    /// Cloudflare upstreams and asks for A and AAAA in parallel.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = LOOKUP_ATTEMPTS;
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

        Self {
            inner: TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts),
        }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn lookup_host(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolverError> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(ResolverError::EmptyHostname);
        }

        // An address literal passes through unresolved.
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let lookup = self.inner.lookup_ip(hostname).await.map_err(|err| {
            if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                ResolverError::NoRecords {
                    domain: hostname.to_string(),
                }
            } else {
                ResolverError::Lookup {
                    domain: hostname.to_string(),
                    source: err,
                }
            }
        })?;

        let mut ips: Vec<IpAddr> = Vec::new();
        for ip in lookup.iter() {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        if ips.is_empty() {
            return Err(ResolverError::NoRecords {
                domain: hostname.to_string(),
            });
        }
        Ok(ips)
    }
}
