//! Per-request pipeline: classify the query and orchestrate cache, hosts,
//! CHAOS answers and the forwarder.

use crate::cache::{CacheKey, ResponseCache};
use crate::dns::forwarder::Forwarder;
use crate::dns::{fit, reply, MAX_MSG_SIZE};
use crate::metrics::Metrics;
use dnsmasq_rs_domain::{Config, Hostfile};
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, PTR, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fixed identifier answered for `hostname.bind.` / `id.server.` CHAOS
/// queries.
const HOST_IDENTIFIER: &str = "localhost";

const MIN_UDP_BUFSIZE: u16 = 512;

pub struct RequestHandler {
    config: Arc<Config>,
    cache: ResponseCache,
    hosts: Arc<dyn Hostfile>,
    forwarder: Forwarder,
    metrics: Arc<Metrics>,
    version: String,
}

impl RequestHandler {
    pub fn new(
        config: Arc<Config>,
        cache: ResponseCache,
        hosts: Arc<dyn Hostfile>,
        forwarder: Forwarder,
        metrics: Arc<Metrics>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            config,
            cache,
            hosts,
            forwarder,
            metrics,
            version: version.into(),
        }
    }

    /// Listener entry point: parse, dispatch, serialise. Returns `None` when
    /// nothing sensible can be written back.
    pub async fn handle_raw(&self, bytes: &[u8], tcp: bool) -> Option<Vec<u8>> {
        let request = match Message::from_vec(bytes) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "dropping malformed request");
                // The ID sits in the first two bytes; if those survived we
                // can still tell the client we failed.
                if bytes.len() < 2 {
                    return None;
                }
                let mut failure = Message::new();
                failure
                    .set_id(u16::from_be_bytes([bytes[0], bytes[1]]))
                    .set_message_type(hickory_proto::op::MessageType::Response)
                    .set_response_code(ResponseCode::ServFail);
                return failure.to_vec().ok();
            }
        };
        let response = self.handle(&request, tcp).await;
        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(error = %err, "failed to encode response");
                reply::with_rcode(&request, ResponseCode::ServFail).to_vec().ok()
            }
        }
    }

    pub async fn handle(&self, request: &Message, tcp: bool) -> Message {
        self.metrics.inc_requests();

        let Some(question) = request.query().cloned() else {
            return reply::with_rcode(request, ResponseCode::ServFail);
        };
        let name = question.name().to_lowercase().to_utf8();

        let (mut bufsize, dnssec) = match request.extensions() {
            Some(edns) => (edns.max_payload().max(MIN_UDP_BUFSIZE), edns.dnssec_ok()),
            None => (MIN_UDP_BUFSIZE, false),
        };
        if tcp {
            bufsize = (MAX_MSG_SIZE - 1) as u16;
        }
        if dnssec {
            self.metrics.inc_dnssec_ok();
        }

        debug!(
            name = %name,
            qtype = ?question.query_type(),
            qclass = ?question.query_class(),
            tcp,
            "received query"
        );

        let key = CacheKey::new(&question, dnssec, tcp);
        if let Some((cached, expired)) = self.cache.get(&key, request.id()) {
            if expired {
                self.cache.remove(&key);
            } else {
                self.metrics.inc_cache_hits();
                let mut response = cached;
                if self.config.round_robin {
                    round_robin(response.answers_mut());
                }
                return self.finalize_local(response, request, bufsize, tcp);
            }
        }
        self.metrics.inc_cache_misses();

        if matches!(
            question.query_type(),
            RecordType::A | RecordType::AAAA | RecordType::ANY
        ) {
            match self.hosts.find_forward(&name) {
                Ok(addresses) => {
                    // Gate on the type-filtered records, not the raw address
                    // list: an entry of the other family must fall through
                    // to forwarding, not answer an empty NOERROR.
                    let records = address_records(&question, &addresses, self.config.hosts_ttl);
                    if !records.is_empty() {
                        let mut response = reply::skeleton(request);
                        response.add_answers(records);
                        if self.config.round_robin {
                            round_robin(response.answers_mut());
                        }
                        return self.finalize_local(response, request, bufsize, tcp);
                    }
                }
                Err(err) => warn!(name = %name, error = %err, "hosts lookup failed"),
            }
        }

        if question.query_type() == RecordType::PTR
            && (name.ends_with(".in-addr.arpa.") || name.ends_with(".ip6.arpa."))
        {
            match self.hosts.find_reverse(&name) {
                Ok(Some(target)) => {
                    if let Ok(target) = Name::from_utf8(&target) {
                        let mut response = reply::skeleton(request);
                        response.add_answer(
                            Record::from_rdata(
                                question.name().clone(),
                                self.config.hosts_ttl,
                                RData::PTR(PTR(target)),
                            ),
                        );
                        return self.finalize_local(response, request, bufsize, tcp);
                    }
                    warn!(name = %name, target, "unusable reverse target");
                }
                Ok(None) => {}
                Err(err) => warn!(name = %name, error = %err, "reverse lookup failed"),
            }
            // Not ours; a recursor may know the reverse zone.
            return self.forward_and_cache(request, &key, tcp).await;
        }

        if question.query_class() == DNSClass::CH {
            return self.finalize_local(self.chaos(request, &question, &name), request, bufsize, tcp);
        }

        self.forward_and_cache(request, &key, tcp).await
    }

    /// CHAOS-class diagnostics: version and host identity for TXT, SERVFAIL
    /// for everything else.
    fn chaos(&self, request: &Message, question: &Query, name: &str) -> Message {
        if question.query_type() == RecordType::TXT {
            let text = match name {
                "version.bind." | "version.server." => Some(self.version.clone()),
                "hostname.bind." | "id.server." => Some(HOST_IDENTIFIER.to_string()),
                _ => None,
            };
            if let Some(text) = text {
                let mut response = reply::skeleton(request);
                response.set_authoritative(true);
                let mut record = Record::from_rdata(
                    question.name().clone(),
                    0,
                    RData::TXT(TXT::new(vec![text])),
                );
                record.set_dns_class(DNSClass::CH);
                response.add_answer(record);
                return response;
            }
        }
        reply::with_rcode(request, ResponseCode::ServFail)
    }

    async fn forward_and_cache(&self, request: &Message, key: &CacheKey, tcp: bool) -> Message {
        let response = self.forwarder.forward(request, tcp).await;
        self.cache.put(key, &response);
        response
    }

    /// Fits a locally-built reply to the transport. SERVFAIL passes as-is;
    /// a TCP reply that cannot be shrunk into the frame becomes SERVFAIL.
    fn finalize_local(
        &self,
        mut response: Message,
        request: &Message,
        bufsize: u16,
        tcp: bool,
    ) -> Message {
        if response.response_code() == ResponseCode::ServFail {
            return response;
        }
        if tcp {
            if fit::fit(&mut response, MAX_MSG_SIZE, true) {
                return reply::with_rcode(request, ResponseCode::ServFail);
            }
        } else {
            fit::fit(&mut response, usize::from(bufsize), false);
        }
        response
    }
}

fn address_records(question: &Query, addresses: &[IpAddr], ttl: u32) -> Vec<Record> {
    let qtype = question.query_type();
    let mut records = Vec::new();
    for address in addresses {
        match address {
            IpAddr::V4(v4) if qtype == RecordType::A || qtype == RecordType::ANY => {
                records.push(Record::from_rdata(
                    question.name().clone(),
                    ttl,
                    RData::A(A(*v4)),
                ));
            }
            IpAddr::V6(v6) if qtype == RecordType::AAAA || qtype == RecordType::ANY => {
                records.push(Record::from_rdata(
                    question.name().clone(),
                    ttl,
                    RData::AAAA(AAAA(*v6)),
                ));
            }
            _ => {}
        }
    }
    records
}

/// Shuffles answers in place with a bounded number of random swaps. Replies
/// threading more than one CNAME are left alone: some stub resolvers
/// (glibc) cannot follow a chain returned out of order.
pub(crate) fn round_robin(answers: &mut [Record]) {
    let cnames = answers
        .iter()
        .filter(|record| record.record_type() == RecordType::CNAME)
        .count();
    if cnames > 1 {
        return;
    }

    match answers.len() {
        0 | 1 => {}
        2 => {
            if rand::random::<u16>() % 2 == 0 {
                answers.swap(0, 1);
            }
        }
        len => {
            let rounds = len * (rand::random::<u16>() as usize % 4 + 1);
            for _ in 0..rounds {
                let a = rand::random::<u16>() as usize % len;
                let mut b = rand::random::<u16>() as usize % len;
                if a == b {
                    b = (b + 1) % len;
                }
                answers.swap(a, b);
            }
        }
    }
}
