//! DNS resolution with address filtering.
//!
//! Wraps a delegate resolver and drops addresses the crawl policy forbids
//! (loopback, private ranges, link-local, CGNAT, multicast). A host whose
//! every address is filtered out resolves to nothing and the task fails
//! with `InvalidHost`.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("DNS lookup failed for {host}: {message}")]
    Lookup { host: String, message: String },
}

/// Delegate resolver seam. The system implementation goes through the
/// runtime's lookup; tests substitute fixed address lists.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Resolver backed by `tokio::net::lookup_host`
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, ResolveError> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| ResolveError::Lookup {
                host: host.to_string(),
                message: e.to_string(),
            })?
            .map(|sa: SocketAddr| sa.ip())
            .collect();
        Ok(addrs)
    }
}

/// Address filtering policy, taken from the crawl configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvePolicy {
    pub loopback_allowed: bool,
    pub private_networks_allowed: bool,
}

/// Resolver that applies [`ResolvePolicy`] to the delegate's results.
/// Address ordering is preserved.
pub struct FilteringResolver {
    delegate: Box<dyn Resolve>,
    policy: ResolvePolicy,
}

impl FilteringResolver {
    pub fn new(delegate: Box<dyn Resolve>, policy: ResolvePolicy) -> Self {
        Self { delegate, policy }
    }

    pub fn system(policy: ResolvePolicy) -> Self {
        Self::new(Box::new(SystemResolver), policy)
    }

    /// Resolve a host to a non-empty, policy-filtered address list.
    /// Literal IPs go through the same policy without a lookup.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, ResolveError> {
        let candidates = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self.delegate.lookup(host, port).await?,
        };

        let filtered: Vec<IpAddr> = candidates
            .into_iter()
            .filter(|ip| self.permits(ip))
            .collect();

        if filtered.is_empty() {
            return Err(ResolveError::InvalidHost(host.to_string()));
        }
        Ok(filtered)
    }

    fn permits(&self, ip: &IpAddr) -> bool {
        if ip.is_loopback() {
            return self.policy.loopback_allowed;
        }
        if is_non_public(ip) {
            return self.policy.private_networks_allowed;
        }
        true
    }
}

/// Addresses that never belong to the public internet: RFC1918, link-local,
/// ULA, CGNAT, multicast, and the 0.0.0.0/8 block.
fn is_non_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || octets[0] == 0
                // CGNAT 100.64.0.0/10
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_multicast()
                || v6.is_unspecified()
                // ULA fc00::/7
                || (segments[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}
