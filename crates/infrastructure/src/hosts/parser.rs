//! Hosts-file line parsing: POSIX /etc/hosts syntax extended with `*.name`
//! wildcard tokens.

use dnsmasq_rs_domain::HostEntry;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Parses a whole file. Duplicate (domain, ip) pairs within the input are
/// dropped with a warning.
pub fn parse(data: &str) -> Vec<HostEntry> {
    let mut entries = Vec::new();
    for line in data.lines() {
        for entry in parse_line(line) {
            push_unique(&mut entries, entry);
        }
    }
    entries
}

/// Parses one line, which may map a single IP to several host tokens:
///
/// ```text
/// 127.0.0.1 localhost mysite1 *.mysite2
/// ```
pub fn parse_line(line: &str) -> Vec<HostEntry> {
    if line.is_empty() || line.starts_with('#') {
        return Vec::new();
    }

    let line = line.split('#').next().unwrap_or("");
    let mut tokens = line.split_whitespace();

    let Some(address) = tokens.next() else {
        return Vec::new();
    };
    // Zone-scoped addresses (fe80::1%eth0) are meaningless as answers.
    if address.contains('%') {
        return Vec::new();
    }
    let Some(ip) = parse_address(address) else {
        return Vec::new();
    };

    tokens
        .map(|token| {
            let (domain, wildcard) = match token.strip_prefix("*.") {
                Some(rest) => (rest, true),
                None => (token, false),
            };
            HostEntry::new(domain.to_ascii_lowercase(), ip, wildcard)
        })
        .collect()
}

/// Formats entries back into hosts-file lines, one mapping per line. The
/// inverse of [`parse`] up to whitespace and comments.
pub fn format_entries(entries: &[HostEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let prefix = if entry.wildcard { "*." } else { "" };
        out.push_str(&format!("{} {}{}\n", entry.ip, prefix, entry.domain));
    }
    out
}

/// Appends `entry` unless an equal (domain, ip) pair is already present.
pub(crate) fn push_unique(entries: &mut Vec<HostEntry>, entry: HostEntry) {
    let duplicate = entries
        .iter()
        .any(|existing| existing.domain == entry.domain && existing.ip == entry.ip);
    if duplicate {
        warn!(domain = %entry.domain, ip = %entry.ip, "duplicate hosts entry dropped");
        return;
    }
    entries.push(entry);
}

/// Unicast addresses only, loopback included; multicast and the unspecified
/// address are rejected. IPv4-mapped IPv6 normalises to IPv4 so the address
/// family of the entry decides between A and AAAA synthesis.
fn parse_address(token: &str) -> Option<IpAddr> {
    let ip = match token.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            debug!(address = token, "invalid IP address in hosts file");
            return None;
        }
    };
    let ip = match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };
    if ip.is_multicast() || ip.is_unspecified() {
        return None;
    }
    Some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_hosts_per_line() {
        let entries = parse_line("192.168.0.1 broadcasthost test.domain.com domain.com");
        assert_eq!(entries.len(), 3);
        assert!(entries
            .iter()
            .all(|e| e.ip == "192.168.0.1".parse::<IpAddr>().unwrap() && !e.wildcard));
        assert_eq!(entries[1].domain, "test.domain.com");
    }

    #[test]
    fn lowercases_host_tokens() {
        let entries = parse_line("10.0.0.1 Mixed.Example.COM");
        assert_eq!(entries[0].domain, "mixed.example.com");
    }

    #[test]
    fn strips_comments_and_collapses_whitespace() {
        assert!(parse_line("# 10.0.0.1 commented.example").is_empty());
        let entries = parse_line("10.0.0.1\thost.example \t  other.example # trailing");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].domain, "other.example");
    }

    #[test]
    fn wildcard_token_is_marked_and_stripped() {
        let entries = parse_line("192.168.0.1 *.domain.com mail.domain.com serenity");
        assert_eq!(entries.len(), 3);
        assert!(entries[0].wildcard);
        assert_eq!(entries[0].domain, "domain.com");
        assert!(!entries[1].wildcard);
    }

    #[test]
    fn skips_zone_scoped_addresses() {
        assert!(parse_line("fe80::1%eth0 router.local").is_empty());
    }

    #[test]
    fn loopback_parses_but_multicast_and_unspecified_do_not() {
        assert_eq!(parse_line("127.0.0.1 localhost").len(), 1);
        assert_eq!(parse_line("::1 localhost").len(), 1);
        assert!(parse_line("224.0.0.1 mcast.example").is_empty());
        assert!(parse_line("0.0.0.0 nothing.example").is_empty());
        assert!(parse_line(":: nothing.example").is_empty());
    }

    #[test]
    fn ipv4_mapped_ipv6_normalises_to_ipv4() {
        let entries = parse_line("::ffff:192.0.2.7 mapped.example");
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].is_ipv6());
    }

    #[test]
    fn invalid_addresses_skip_the_line() {
        assert!(parse_line("not-an-ip host.example").is_empty());
    }

    #[test]
    fn duplicate_pairs_are_dropped() {
        let entries = parse("10.0.0.1 twice.example\n10.0.0.1 twice.example\n");
        assert_eq!(entries.len(), 1);
        // Same domain under a different IP is fine.
        let entries = parse("10.0.0.1 multi.example\n10.0.0.2 multi.example\n");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn format_then_parse_round_trips() {
        let original = parse(
            "192.168.0.1 *.domain.com mail.domain.com serenity\n\
             192.168.0.2 api.domain.com\n\
             ::1 localhost\n",
        );
        let reparsed = parse(&format_entries(&original));
        assert_eq!(original, reparsed);
    }
}
