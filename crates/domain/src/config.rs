use crate::errors::DomainError;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DNS_PORT: u16 = 53;

/// A DNS suffix routed to its own set of upstream servers instead of the
/// global nameserver list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubZone {
    /// Lowercased FQDN suffix, with trailing dot.
    pub domain: String,
    pub nameservers: Vec<SocketAddr>,
}

/// Runtime options. Built once at startup and shared read-only behind an
/// `Arc` for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    /// `ip:port` the UDP and TCP listeners bind to.
    pub dns_addr: SocketAddr,
    /// Rewrite /etc/resolv.conf to make this process the default resolver.
    pub default_resolver: bool,
    /// Ordered upstream recursive resolvers.
    pub nameservers: Vec<SocketAddr>,
    /// Suffix-routed upstreams, taking precedence over `nameservers`.
    pub stub_zones: Vec<StubZone>,
    /// Ordered suffixes for libc-style qualification of short names.
    /// Lowercased FQDNs with trailing dot.
    pub search_domains: Vec<String>,
    /// Enable search-path resolution.
    pub enable_search: bool,
    /// Hosts file or directory of hosts files.
    pub hostsfile: Option<PathBuf>,
    /// Hosts poll interval in seconds; 0 disables polling.
    pub poll_interval: u64,
    /// Shuffle A/AAAA answer records before returning.
    pub round_robin: bool,
    /// Refuse all forwarding.
    pub no_rec: bool,
    /// Base socket timeout; upstream exchanges get twice this as deadline.
    pub read_timeout: Duration,
    /// Minimum label count before an initial absolute query is attempted.
    pub ndots: u32,
    /// Minimum label count before forwarding is attempted at all.
    pub fwd_ndots: u32,
    /// Response cache capacity in messages; 0 disables the cache.
    pub rcache_capacity: usize,
    /// Response cache entry TTL in seconds.
    pub rcache_ttl: u64,
    /// TTL for synthesised records other than hosts answers.
    pub ttl: u32,
    /// TTL for records synthesised from hosts entries.
    pub hosts_ttl: u32,
    /// Adopt sockets passed by systemd instead of binding `dns_addr`.
    pub systemd: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_addr: SocketAddr::from(([127, 0, 0, 1], DNS_PORT)),
            default_resolver: false,
            nameservers: Vec::new(),
            stub_zones: Vec::new(),
            search_domains: Vec::new(),
            enable_search: false,
            hostsfile: None,
            poll_interval: 0,
            round_robin: false,
            no_rec: false,
            read_timeout: Duration::from_secs(2),
            ndots: 1,
            fwd_ndots: 1,
            rcache_capacity: 0,
            rcache_ttl: 60,
            ttl: 360,
            hosts_ttl: 10,
            systemd: false,
        }
    }
}

impl Config {
    /// Startup sanity checks. Recursion without upstreams and search without
    /// suffixes are configuration errors, not runtime conditions.
    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.no_rec && self.nameservers.is_empty() && self.stub_zones.is_empty() {
            return Err(DomainError::ConfigError(
                "no nameservers configured and recursion is enabled".into(),
            ));
        }
        if self.enable_search && self.search_domains.is_empty() {
            return Err(DomainError::ConfigError(
                "search is enabled but no search domains are configured".into(),
            ));
        }
        for zone in &self.stub_zones {
            if zone.nameservers.is_empty() {
                return Err(DomainError::ConfigError(format!(
                    "stub zone {} has no nameservers",
                    zone.domain
                )));
            }
        }
        Ok(())
    }
}

/// Parses `host[:port]`, defaulting the port. IPv6 hosts must be bracketed
/// when a port is given; a bare address of either family is accepted.
pub fn parse_host_port(s: &str, default_port: u16) -> Result<SocketAddr, DomainError> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let host = s
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(s);
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| DomainError::InvalidAddress(s.to_string()))
}

/// Number of labels in a dotted name, ignoring the root label.
pub fn label_count(name: &str) -> usize {
    name.split('.').filter(|label| !label.is_empty()).count()
}

/// Normalises a search or stub suffix: lowercase, leading dot stripped,
/// trailing dot ensured. Single-label suffixes are rejected — qualifying
/// with them would never produce a resolvable FQDN.
pub fn normalize_domain(s: &str) -> Result<String, DomainError> {
    let mut domain = s.trim().trim_start_matches('.').to_ascii_lowercase();
    if !domain.ends_with('.') {
        domain.push('.');
    }
    if label_count(&domain) < 2 {
        return Err(DomainError::ConfigError(format!(
            "domain is not a FQDN: {s}"
        )));
    }
    Ok(domain)
}
