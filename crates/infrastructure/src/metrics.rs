//! Process-wide request counters. Increment-only atomics; exporters are a
//! deployment concern and read these through whatever glue they bring.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    forwards: AtomicU64,
    stub_forwards: AtomicU64,
    dnssec_ok: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwards(&self) {
        self.forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stub_forwards(&self) {
        self.stub_forwards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dnssec_ok(&self) {
        self.dnssec_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn forwards(&self) -> u64 {
        self.forwards.load(Ordering::Relaxed)
    }

    pub fn stub_forwards(&self) -> u64 {
        self.stub_forwards.load(Ordering::Relaxed)
    }

    pub fn dnssec_ok(&self) -> u64 {
        self.dnssec_ok.load(Ordering::Relaxed)
    }
}
