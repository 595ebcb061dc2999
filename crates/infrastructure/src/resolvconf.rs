//! Takes over /etc/resolv.conf while running as the default resolver and
//! restores it on the way out.
//!
//! Marker strings are byte-compatible with go-dnsmasq so that deployments
//! mixing both binaries clean up each other's edits.

use dnsmasq_rs_domain::DomainError;
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

pub const RESOLVCONF_PATH: &str = "/etc/resolv.conf";

const ADDED_MARKER: &str = "# added by go-dnsmasq";
const DISABLED_MARKER: &str = "# disabled by go-dnsmasq # ";

/// Inserts `nameserver <address>` as the first line and disables every
/// pre-existing nameserver line with a reversible marker.
pub fn store_address(address: IpAddr, path: &Path) -> Result<(), DomainError> {
    debug!(resolvconf = %path.display(), %address, "registering as default resolver");
    let original = read_or_empty(path)?;
    let mut output = format!("nameserver {address} {ADDED_MARKER}\n");
    for line in original.lines() {
        if line.contains(ADDED_MARKER) {
            continue;
        }
        if line.starts_with(DISABLED_MARKER) {
            output.push_str(line);
        } else if line.trim_start().starts_with("nameserver") {
            output.push_str(DISABLED_MARKER);
            output.push_str(line);
        } else {
            output.push_str(line);
        }
        output.push('\n');
    }
    write_replacing(path, &output)
}

/// Inverts `store_address`: drops the inserted line and restores the
/// disabled ones.
pub fn clean(path: &Path) -> Result<(), DomainError> {
    debug!(resolvconf = %path.display(), "restoring original nameservers");
    let original = read_or_empty(path)?;
    let mut output = String::with_capacity(original.len());
    for line in original.lines() {
        if line.contains(ADDED_MARKER) {
            continue;
        }
        match line.strip_prefix(DISABLED_MARKER) {
            Some(restored) => output.push_str(restored),
            None => output.push_str(line),
        }
        output.push('\n');
    }
    write_replacing(path, &output)
}

fn read_or_empty(path: &Path) -> Result<String, DomainError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(DomainError::IoError(format!(
            "failed to read {}: {err}",
            path.display()
        ))),
    }
}

/// Replace-by-rename where the filesystem allows it. Container runtimes bind
/// mount resolv.conf, where rename fails with EXDEV or EBUSY; those fall
/// back to an in-place rewrite.
fn write_replacing(path: &Path, contents: &str) -> Result<(), DomainError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |err: std::io::Error| {
        DomainError::IoError(format!("failed to write {}: {err}", path.display()))
    };

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    temp.write_all(contents.as_bytes()).map_err(io_err)?;
    if let Err(err) = temp.persist(path) {
        warn!(
            resolvconf = %path.display(),
            error = %err.error,
            "atomic replace failed, rewriting in place"
        );
        fs::write(path, contents).map_err(io_err)?;
    }
    Ok(())
}
