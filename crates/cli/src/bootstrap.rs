//! Startup plumbing: logging, option parsing and resolv.conf discovery.

use crate::Cli;
use dnsmasq_rs_domain::config::{normalize_domain, parse_host_port, DNS_PORT};
use dnsmasq_rs_domain::{Config, DomainError, StubZone};
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub(crate) fn init_logging(verbose: bool, syslog: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if syslog {
        builder.without_time().with_ansi(false).init();
    } else {
        builder.init();
    }
}

pub(crate) fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config {
        dns_addr: parse_host_port(&cli.listen, DNS_PORT)?,
        default_resolver: cli.default_resolver,
        enable_search: cli.enable_search,
        hostsfile: cli.hostsfile.clone(),
        poll_interval: cli.hostsfile_poll,
        round_robin: cli.round_robin,
        no_rec: cli.no_rec,
        ndots: cli.ndots,
        fwd_ndots: cli.fwd_ndots,
        rcache_capacity: cli.rcache,
        rcache_ttl: cli.rcache_ttl,
        systemd: cli.systemd,
        ..Config::default()
    };

    if let Some(list) = &cli.nameservers {
        config.nameservers = parse_nameservers(list)?;
    }
    if let Some(list) = &cli.search_domains {
        config.search_domains = parse_search_domains(list)?;
    }
    config.stub_zones = parse_stub_zones(&cli.stubzones)?;

    if config.nameservers.is_empty() && !config.no_rec {
        config.nameservers = system_nameservers(config.dns_addr);
        if !config.nameservers.is_empty() {
            info!(nameservers = ?config.nameservers, "using nameservers from resolv.conf");
        }
    }
    if config.enable_search && config.search_domains.is_empty() {
        config.search_domains = system_search_domains();
        if !config.search_domains.is_empty() {
            info!(search = ?config.search_domains, "using search domains from resolv.conf");
        }
    }

    config.validate()?;
    Ok(config)
}

pub(crate) fn parse_nameservers(list: &str) -> Result<Vec<SocketAddr>, DomainError> {
    list.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| parse_host_port(part, DNS_PORT))
        .collect()
}

pub(crate) fn parse_search_domains(list: &str) -> Result<Vec<String>, DomainError> {
    list.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(normalize_domain)
        .collect()
}

/// Each argument maps one or more domains to one or more servers:
/// `corp.example,branch.example/10.0.0.1,10.0.0.2:5353`.
pub(crate) fn parse_stub_zones(args: &[String]) -> Result<Vec<StubZone>, DomainError> {
    let mut zones = Vec::new();
    for arg in args {
        let (domains, servers) = arg.split_once('/').ok_or_else(|| {
            DomainError::ConfigError(format!(
                "stubzones argument must be `dom[,dom]/host[,host]`: {arg}"
            ))
        })?;
        if domains.is_empty() || servers.is_empty() {
            return Err(DomainError::ConfigError(format!(
                "stubzones argument must name domains and servers: {arg}"
            )));
        }
        let nameservers = servers
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| parse_host_port(part, DNS_PORT))
            .collect::<Result<Vec<_>, _>>()?;
        for domain in domains.split(',') {
            zones.push(StubZone {
                domain: normalize_domain(domain)?,
                nameservers: nameservers.clone(),
            });
        }
    }
    Ok(zones)
}

/// Upstreams from the system resolv.conf, keeping their order, minus our own
/// listen address — forwarding to ourselves would loop.
fn system_nameservers(listen: SocketAddr) -> Vec<SocketAddr> {
    let (resolver_config, _) = match hickory_resolver::system_conf::read_system_conf() {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "could not read system resolv.conf");
            return Vec::new();
        }
    };
    let mut servers = Vec::new();
    for name_server in resolver_config.name_servers() {
        let addr = name_server.socket_addr;
        if addr != listen && !servers.contains(&addr) {
            servers.push(addr);
        }
    }
    servers
}

fn system_search_domains() -> Vec<String> {
    let (resolver_config, _) = match hickory_resolver::system_conf::read_system_conf() {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "could not read system resolv.conf");
            return Vec::new();
        }
    };
    let mut domains = Vec::new();
    for name in resolver_config.search() {
        match normalize_domain(&name.to_utf8()) {
            Ok(domain) => {
                if !domains.contains(&domain) {
                    domains.push(domain);
                }
            }
            Err(_) => {
                warn!(domain = %name, "skipping single-label search domain from resolv.conf");
            }
        }
    }
    domains
}
