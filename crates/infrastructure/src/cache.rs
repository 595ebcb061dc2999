//! Bounded response cache keyed by the question fingerprint.
//!
//! Entries are advisory: two concurrent misses for the same key may both
//! forward, and the later `put` wins. Readers share the lock via `peek`, so
//! a hit never bumps recency — at capacity the coldest insertion goes first.

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{DNSClass, RecordType};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Fingerprint of (lowercased name, qtype, qclass, DO bit, tcp flag).
/// Requests with identical fingerprints share a cache slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    qtype: RecordType,
    qclass: DNSClass,
    dnssec: bool,
    tcp: bool,
}

impl CacheKey {
    pub fn new(question: &Query, dnssec: bool, tcp: bool) -> Self {
        Self {
            name: question.name().to_lowercase().to_utf8(),
            qtype: question.query_type(),
            qclass: question.query_class(),
            dnssec,
            tcp,
        }
    }
}

struct CacheEntry {
    message: Message,
    expires: Instant,
}

pub struct ResponseCache {
    entries: RwLock<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
    enabled: bool,
}

impl ResponseCache {
    /// A capacity of 0 disables the cache: `get` always misses and `put` is
    /// a no-op.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let bound = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            entries: RwLock::new(LruCache::new(bound)),
            ttl,
            enabled: capacity > 0,
        }
    }

    /// Returns a value copy of the stored message with its ID rewritten to
    /// `request_id` and the TC bit cleared, plus whether the entry has
    /// expired. Expired entries are still returned; the caller decides
    /// whether to evict.
    pub fn get(&self, key: &CacheKey, request_id: u16) -> Option<(Message, bool)> {
        if !self.enabled {
            return None;
        }
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.peek(key)?;
        let mut message = entry.message.clone();
        message.set_id(request_id);
        message.set_truncated(false);
        Some((message, Instant::now() >= entry.expires))
    }

    /// Stores a message under `key`. Truncated messages are dropped — a
    /// cached reply must never carry the TC bit of some earlier transport.
    /// The entry TTL is the configured TTL floored by the smallest record
    /// TTL in the answer and authority sections.
    pub fn put(&self, key: &CacheKey, message: &Message) {
        if !self.enabled || message.truncated() {
            return;
        }
        let ttl = self.entry_ttl(message);
        let entry = CacheEntry {
            message: message.clone(),
            expires: Instant::now() + ttl,
        };
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.push(key.clone(), entry);
    }

    pub fn remove(&self, key: &CacheKey) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.pop(key);
    }

    pub fn len(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_ttl(&self, message: &Message) -> Duration {
        let record_min = message
            .answers()
            .iter()
            .chain(message.name_servers())
            .map(|record| u64::from(record.ttl()))
            .min();
        match record_min {
            Some(min) => self.ttl.min(Duration::from_secs(min)),
            None => self.ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};

    fn question(name: &str) -> Query {
        Query::query(Name::from_utf8(name).unwrap(), RecordType::A)
    }

    fn response(name: &str, id: u16) -> Message {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_recursion_available(true);
        message.add_query(question(name));
        message.add_answer(Record::from_rdata(
            Name::from_utf8(name).unwrap(),
            300,
            RData::A(A("192.0.2.1".parse().unwrap())),
        ));
        message
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(&question(name), false, false)
    }

    #[test]
    fn hit_rewrites_id_and_clears_tc() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let mut stored = response("example.com.", 7);
        stored.set_truncated(false);
        cache.put(&key("example.com."), &stored);

        // The stored copy keeps its own ID; the hit gets the caller's.
        let (hit, expired) = cache.get(&key("example.com."), 99).unwrap();
        assert_eq!(hit.id(), 99);
        assert!(!hit.truncated());
        assert!(!expired);
        assert_eq!(hit.answers().len(), 1);
    }

    #[test]
    fn key_is_case_insensitive() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        cache.put(&key("example.com."), &response("example.com.", 1));
        assert!(cache.get(&key("EXAMPLE.com."), 2).is_some());
    }

    #[test]
    fn key_separates_do_bit_and_transport() {
        let q = question("example.com.");
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        cache.put(&CacheKey::new(&q, false, false), &response("example.com.", 1));
        assert!(cache.get(&CacheKey::new(&q, true, false), 2).is_none());
        assert!(cache.get(&CacheKey::new(&q, false, true), 2).is_none());
    }

    #[test]
    fn truncated_messages_are_not_stored() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let mut truncated = response("example.com.", 1);
        truncated.set_truncated(true);
        cache.put(&key("example.com."), &truncated);
        assert!(cache.get(&key("example.com."), 2).is_none());
    }

    #[test]
    fn expired_entries_are_flagged_but_returned() {
        let cache = ResponseCache::new(10, Duration::ZERO);
        cache.put(&key("example.com."), &response("example.com.", 1));
        let (_, expired) = cache.get(&key("example.com."), 2).unwrap();
        assert!(expired);

        cache.remove(&key("example.com."));
        assert!(cache.get(&key("example.com."), 3).is_none());
    }

    #[test]
    fn record_ttl_floors_the_configured_ttl() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let mut short = response("example.com.", 1);
        short.answers_mut()[0].set_ttl(0);
        cache.put(&key("example.com."), &short);
        let (_, expired) = cache.get(&key("example.com."), 2).unwrap();
        assert!(expired);
    }

    #[test]
    fn negative_responses_use_the_configured_ttl() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let mut negative = Message::new();
        negative
            .set_id(1)
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NXDomain);
        negative.add_query(question("missing.example.com."));
        cache.put(&key("missing.example.com."), &negative);

        let (hit, expired) = cache.get(&key("missing.example.com."), 2).unwrap();
        assert_eq!(hit.response_code(), ResponseCode::NXDomain);
        assert!(!expired);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.put(&key("a.example."), &response("a.example.", 1));
        cache.put(&key("b.example."), &response("b.example.", 2));
        cache.put(&key("c.example."), &response("c.example.", 3));
        assert_eq!(cache.len(), 2);
        // The oldest entry was evicted.
        assert!(cache.get(&key("a.example."), 9).is_none());
        assert!(cache.get(&key("c.example."), 9).is_some());
    }

    #[test]
    fn zero_capacity_disables_the_cache() {
        let cache = ResponseCache::new(0, Duration::from_secs(60));
        cache.put(&key("example.com."), &response("example.com.", 1));
        assert!(cache.get(&key("example.com."), 2).is_none());
        assert_eq!(cache.len(), 0);
    }
}
