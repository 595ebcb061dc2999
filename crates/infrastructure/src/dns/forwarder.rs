//! Upstream query engine: stub-zone routing, nameserver failover and
//! libc-style search-path expansion.
//!
//! Resolution runs in two bounded phases. Phase A walks the selected
//! nameserver list from index 0, advancing on errors and SERVFAIL replies,
//! and ends when the list is exhausted. Phase B walks the search-domain
//! list in order, re-entering phase A per candidate name, and ends when the
//! list is exhausted or a terminal reply arrives.

use crate::dns::exchange::Exchanger;
use crate::dns::reply;
use crate::metrics::Metrics;
use dnsmasq_rs_domain::{Config, DomainError};
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::CNAME;
use hickory_proto::rr::{Name, RData, Record};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Forwarder {
    config: Arc<Config>,
    exchanger: Arc<dyn Exchanger>,
    metrics: Arc<Metrics>,
    stub_zones: Vec<(Name, Vec<SocketAddr>)>,
    search_domains: Vec<Name>,
}

impl Forwarder {
    pub fn new(
        config: Arc<Config>,
        exchanger: Arc<dyn Exchanger>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, DomainError> {
        let stub_zones = config
            .stub_zones
            .iter()
            .map(|zone| {
                Name::from_utf8(&zone.domain)
                    .map(|name| (name, zone.nameservers.clone()))
                    .map_err(|e| {
                        DomainError::ConfigError(format!("invalid stub zone {}: {e}", zone.domain))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let search_domains = config
            .search_domains
            .iter()
            .map(|domain| {
                Name::from_utf8(domain).map_err(|e| {
                    DomainError::ConfigError(format!("invalid search domain {domain}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            exchanger,
            metrics,
            stub_zones,
            search_domains,
        })
    }

    /// Resolves `request` against the upstreams, applying the minimum-label
    /// policy and search expansion. Always produces a reply message; policy
    /// refusals and exhausted upstreams come back as REFUSED and SERVFAIL.
    pub async fn forward(&self, request: &Message, tcp: bool) -> Message {
        self.metrics.inc_forwards();

        let Some(question) = request.query().cloned() else {
            return reply::with_rcode(request, ResponseCode::ServFail);
        };
        let name = question.name().clone();
        let nd = i64::from(name.num_labels()) - 1;
        let ndots = i64::from(self.config.ndots);
        let fwd_ndots = i64::from(self.config.fwd_ndots);
        let enable_search = self.config.enable_search && !self.search_domains.is_empty();

        if self.config.no_rec
            || self.upstreams_for(&name).0.is_empty()
            || (nd < fwd_ndots && !enable_search)
        {
            debug!(name = %name, nd, "refusing to forward");
            return reply::with_rcode(request, ResponseCode::Refused);
        }

        let mut absolute: Option<Message> = None;
        let mut tried_absolute = false;
        let mut search_reply: Option<Message> = None;
        let mut search_failed = false;

        if nd >= ndots && nd >= fwd_ndots {
            tried_absolute = true;
            match self.forward_absolute(request, tcp).await {
                Ok(r) if r.response_code() == ResponseCode::NoError => {
                    return self.finish(r, request);
                }
                Ok(r) => absolute = Some(r),
                Err(e) => debug!(name = %name, error = %e, "absolute query failed"),
            }
        }

        if enable_search {
            match self.forward_search(request, tcp).await {
                Ok(r) if r.response_code() == ResponseCode::NoError => {
                    return self.finish(r, request);
                }
                Ok(r) => search_reply = Some(r),
                Err(e) => {
                    debug!(name = %name, error = %e, "search expansion failed");
                    search_failed = true;
                }
            }
        }

        if !tried_absolute && !search_failed && nd >= fwd_ndots {
            match self.forward_absolute(request, tcp).await {
                Ok(r) if r.response_code() == ResponseCode::NoError => {
                    return self.finish(r, request);
                }
                Ok(r) => absolute = Some(r),
                Err(e) => debug!(name = %name, error = %e, "absolute query failed"),
            }
        }

        if let Some(r) = absolute {
            return self.finish(r, request);
        }
        if let Some(r) = search_reply {
            // The qualified names that produced this are not what the client
            // asked; only the verdict survives.
            return reply::with_rcode(request, r.response_code());
        }
        warn!(name = %name, "no upstream could answer");
        reply::with_rcode(request, ResponseCode::ServFail)
    }

    /// Phase A: sends `request` as-is, trying each server of the selected
    /// list once. Exchange errors and SERVFAIL replies advance to the next
    /// server; every other rcode passes through.
    async fn forward_absolute(
        &self,
        request: &Message,
        tcp: bool,
    ) -> Result<Message, DomainError> {
        let name = request
            .query()
            .map(|q| q.name().clone())
            .unwrap_or_else(Name::root);
        let (servers, is_stub) = self.upstreams_for(&name);
        if is_stub {
            self.metrics.inc_stub_forwards();
        }

        let mut servfail: Option<Message> = None;
        let mut last_error: Option<DomainError> = None;
        for server in servers {
            match self.exchanger.exchange(request, *server, tcp).await {
                Ok(r) if r.response_code() == ResponseCode::ServFail => {
                    debug!(name = %name, server = %server, "upstream answered SERVFAIL, failing over");
                    servfail = Some(r);
                }
                Ok(r) => return Ok(r),
                Err(e) => {
                    debug!(name = %name, server = %server, error = %e, "upstream unreachable, failing over");
                    last_error = Some(e);
                }
            }
        }
        match servfail {
            Some(r) => Ok(r),
            None => Err(last_error.unwrap_or(DomainError::AllServersUnreachable)),
        }
    }

    /// Phase B: qualifies the name with each search domain in order.
    /// Positive answers return immediately with a synthetic CNAME prepended;
    /// a NODATA is remembered as fallback; NXDOMAIN and SERVFAIL continue to
    /// the next domain; anything else ends the search. Every returned reply
    /// carries the original question again.
    async fn forward_search(&self, request: &Message, tcp: bool) -> Result<Message, DomainError> {
        let question = request
            .query()
            .cloned()
            .ok_or_else(|| DomainError::ProtocolError("request has no question".into()))?;
        let name = question.name().clone();

        let mut nodata: Option<Message> = None;
        let mut negative: Option<Message> = None;
        let mut last_error: Option<DomainError> = None;

        for domain in &self.search_domains {
            if domain.zone_of(&name) {
                debug!(name = %name, search = %domain, "name already within search domain, skipping");
                continue;
            }
            let qualified = name
                .clone()
                .append_domain(domain)
                .map_err(|e| DomainError::ProtocolError(format!("cannot qualify {name}: {e}")))?
                .to_lowercase();
            debug!(name = %name, qualified = %qualified, "trying search domain");

            let mut candidate = request.clone();
            if let Some(q) = candidate.queries_mut().first_mut() {
                q.set_name(qualified.clone());
            }

            // A dead upstream set for one domain must not cut the search
            // short; stub routing can give the next domain live servers.
            let mut r = match self.forward_absolute(&candidate, tcp).await {
                Ok(r) => r,
                Err(e) => {
                    debug!(qualified = %qualified, error = %e, "search candidate unreachable, trying next domain");
                    last_error = Some(e);
                    continue;
                }
            };
            let positive = r.response_code() == ResponseCode::NoError && !r.truncated();
            match r.response_code() {
                ResponseCode::NoError if positive && !r.answers().is_empty() => {
                    self.prepend_search_cname(&mut r, &name, &qualified);
                    restore_question(&mut r, &question);
                    return Ok(r);
                }
                ResponseCode::NoError if positive => {
                    if nodata.is_none() {
                        nodata = Some(r);
                    }
                }
                ResponseCode::NXDomain | ResponseCode::ServFail => {
                    negative = Some(r);
                }
                _ => {
                    if r.response_code() == ResponseCode::NoError && !r.answers().is_empty() {
                        self.prepend_search_cname(&mut r, &name, &qualified);
                    }
                    restore_question(&mut r, &question);
                    return Ok(r);
                }
            }
        }

        // The name exists somewhere in the search path even though the
        // record type does not: NODATA beats the negatives.
        if let Some(mut r) = nodata {
            restore_question(&mut r, &question);
            return Ok(r);
        }
        if let Some(mut r) = negative {
            restore_question(&mut r, &question);
            return Ok(r);
        }
        // Candidates went out but none came back: that is upstream
        // exhaustion, not a name verdict.
        if let Some(e) = last_error {
            return Err(e);
        }
        Ok(reply::with_rcode(request, ResponseCode::NXDomain))
    }

    /// The upstream list for `name`: the longest matching stub-zone suffix
    /// wins, the global list otherwise.
    fn upstreams_for(&self, name: &Name) -> (&[SocketAddr], bool) {
        let stub = self
            .stub_zones
            .iter()
            .filter(|(zone, _)| zone.zone_of(name))
            .max_by_key(|(zone, _)| zone.num_labels());
        match stub {
            Some((zone, servers)) => {
                debug!(name = %name, zone = %zone, "routing through stub zone");
                (servers.as_slice(), true)
            }
            None => (self.config.nameservers.as_slice(), false),
        }
    }

    fn finish(&self, mut response: Message, request: &Message) -> Message {
        response.set_id(request.id());
        response
    }

    /// Links the short name the client asked for to the qualified name that
    /// answered, so the reply explains itself.
    fn prepend_search_cname(&self, response: &mut Message, original: &Name, qualified: &Name) {
        let cname = Record::from_rdata(
            original.clone(),
            self.config.ttl,
            RData::CNAME(CNAME(qualified.clone())),
        );
        let mut answers = response.take_answers();
        answers.insert(0, cname);
        response.insert_answers(answers);
    }
}

fn restore_question(response: &mut Message, question: &Query) {
    response.take_queries();
    response.add_query(question.clone());
}
