//! In-memory name↔IP index built from one or more hosts files.
//!
//! The merged entry list lives behind a single reader/writer lock; reloads
//! assemble a replacement off-lock and swap it in. Per-file (mtime, size)
//! stats gate re-parsing, with an unconditional full rebuild every
//! [`FULL_RELOAD_TICKS`] polls to catch content-only edits.

pub mod parser;

use dnsmasq_rs_domain::{DomainError, HostEntry, Hostfile};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FULL_RELOAD_TICKS: u64 = 100;

struct FileState {
    mtime: SystemTime,
    size: u64,
    entries: Vec<HostEntry>,
}

pub struct HostsFile {
    path: PathBuf,
    /// Live merged list. Swapped wholesale under the write lock.
    entries: RwLock<Arc<Vec<HostEntry>>>,
    /// Watcher bookkeeping: stat and parsed entries per file.
    files: Mutex<HashMap<PathBuf, FileState>>,
}

impl HostsFile {
    /// Loads `path` (a file or a directory of files). The initial load is
    /// mandatory: any enumeration, stat or read failure here is fatal.
    pub fn new(path: impl Into<PathBuf>) -> Result<Arc<Self>, DomainError> {
        let hosts = Arc::new(Self {
            path: path.into(),
            entries: RwLock::new(Arc::new(Vec::new())),
            files: Mutex::new(HashMap::new()),
        });
        hosts.load_initial()?;
        info!(
            path = %hosts.path.display(),
            entries = hosts.len(),
            "hosts file loaded"
        );
        Ok(hosts)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("hosts lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the poll loop. Every tick re-stats the watched files and
    /// reloads the changed ones; every [`FULL_RELOAD_TICKS`]th tick rebuilds
    /// unconditionally.
    pub fn spawn_watcher(
        self: Arc<Self>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            // The first tick of a tokio interval fires immediately and we
            // just loaded; skip it.
            ticker.tick().await;
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("hosts watcher: shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        ticks += 1;
                        self.poll_once(ticks % FULL_RELOAD_TICKS == 0);
                    }
                }
            }
        })
    }

    /// One poll pass. With `force` every file is re-parsed regardless of its
    /// recorded stat. Errors are non-fatal: they are logged and the previous
    /// entries stay live.
    pub fn poll_once(&self, force: bool) {
        let files = match self.list_files() {
            Ok(files) => files,
            Err(err) => {
                // Discard incremental state so the next successful pass
                // rebuilds from scratch; the live list keeps serving.
                warn!(path = %self.path.display(), error = %err, "hosts enumeration failed");
                self.files.lock().expect("hosts lock poisoned").clear();
                return;
            }
        };

        let mut states = self.files.lock().expect("hosts lock poisoned");
        let mut changed = false;

        for file in &files {
            let (mtime, size) = match file_stat(file) {
                Ok(stat) => stat,
                Err(err) => {
                    debug!(file = %file.display(), error = %err, "stat failed, skipping");
                    continue;
                }
            };
            let unchanged = states
                .get(file)
                .is_some_and(|state| state.mtime == mtime && state.size == size);
            if unchanged && !force {
                continue;
            }
            match fs::read_to_string(file) {
                Ok(data) => {
                    debug!(file = %file.display(), "reloading hosts file");
                    let entries = parser::parse(&data);
                    states.insert(file.clone(), FileState { mtime, size, entries });
                    changed = true;
                }
                Err(err) => {
                    // Record the stat anyway so a persistently unreadable
                    // file does not trigger a reload on every tick.
                    warn!(file = %file.display(), error = %err, "failed to read hosts file");
                    match states.get_mut(file) {
                        Some(state) => {
                            state.mtime = mtime;
                            state.size = size;
                        }
                        None => {
                            states.insert(
                                file.clone(),
                                FileState { mtime, size, entries: Vec::new() },
                            );
                        }
                    }
                }
            }
        }

        let before = states.len();
        states.retain(|file, _| files.contains(file));
        changed |= states.len() != before;

        if changed || force {
            let merged = merge(&states, &files);
            drop(states);
            *self.entries.write().expect("hosts lock poisoned") = Arc::new(merged);
        }
    }

    fn load_initial(&self) -> Result<(), DomainError> {
        let files = self.list_files().map_err(|err| {
            DomainError::HostsFileError(format!("{}: {err}", self.path.display()))
        })?;
        let mut states = self.files.lock().expect("hosts lock poisoned");
        for file in &files {
            let (mtime, size) = file_stat(file).map_err(|err| {
                DomainError::HostsFileError(format!("{}: {err}", file.display()))
            })?;
            let data = fs::read_to_string(file).map_err(|err| {
                DomainError::HostsFileError(format!("{}: {err}", file.display()))
            })?;
            let entries = parser::parse(&data);
            states.insert(file.clone(), FileState { mtime, size, entries });
        }
        let merged = merge(&states, &files);
        drop(states);
        *self.entries.write().expect("hosts lock poisoned") = Arc::new(merged);
        Ok(())
    }

    fn list_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let metadata = fs::metadata(&self.path)?;
        if !metadata.is_dir() {
            return Ok(vec![self.path.clone()]);
        }
        let mut files = Vec::new();
        for dir_entry in fs::read_dir(&self.path)? {
            let path = dir_entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn snapshot(&self) -> Arc<Vec<HostEntry>> {
        self.entries.read().expect("hosts lock poisoned").clone()
    }
}

impl Hostfile for HostsFile {
    fn find_forward(&self, name: &str) -> Result<Vec<IpAddr>, DomainError> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let entries = self.snapshot();

        let exact: Vec<IpAddr> = entries
            .iter()
            .filter(|entry| !entry.wildcard && entry.domain == name)
            .map(|entry| entry.ip)
            .collect();
        if !exact.is_empty() {
            return Ok(exact);
        }

        Ok(entries
            .iter()
            .filter(|entry| entry.wildcard && wildcard_matches(&name, &entry.domain))
            .map(|entry| entry.ip)
            .collect())
    }

    fn find_reverse(&self, ptr_name: &str) -> Result<Option<String>, DomainError> {
        let ptr_name = ptr_name.to_ascii_lowercase();
        let entries = self.snapshot();
        Ok(entries
            .iter()
            .find(|entry| reverse_name(entry.ip) == ptr_name)
            .map(|entry| format!("{}.", entry.domain)))
    }
}

/// A hosts backend with nothing in it, for when no hosts file is configured.
#[derive(Debug, Default)]
pub struct EmptyHostfile;

impl Hostfile for EmptyHostfile {
    fn find_forward(&self, _name: &str) -> Result<Vec<IpAddr>, DomainError> {
        Ok(Vec::new())
    }

    fn find_reverse(&self, _ptr_name: &str) -> Result<Option<String>, DomainError> {
        Ok(None)
    }
}

/// A wildcard suffix matches exactly one extra label: `api.domain.com`
/// matches `domain.com`, `sub.api.domain.com` does not.
fn wildcard_matches(name: &str, suffix: &str) -> bool {
    let Some(prefix) = name
        .strip_suffix(suffix)
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return false;
    };
    !prefix.is_empty() && !prefix.contains('.')
}

/// The reverse-zone PTR name for an address, lowercase with trailing dot.
pub(crate) fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.in-addr.arpa.")
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
            }
            name.push_str("ip6.arpa.");
            name
        }
    }
}

fn merge(states: &HashMap<PathBuf, FileState>, order: &[PathBuf]) -> Vec<HostEntry> {
    let mut merged = Vec::new();
    for file in order {
        if let Some(state) = states.get(file) {
            for entry in &state.entries {
                parser::push_unique(&mut merged, entry.clone());
            }
        }
    }
    merged
}

fn file_stat(path: &Path) -> std::io::Result<(SystemTime, u64)> {
    let metadata = fs::metadata(path)?;
    Ok((metadata.modified()?, metadata.len()))
}
