use async_trait::async_trait;
use dnsmasq_rs_domain::{Config, DomainError, Hostfile};
use dnsmasq_rs_infrastructure::dns::{Exchanger, Forwarder, RequestHandler};
use dnsmasq_rs_infrastructure::{Metrics, ResponseCache};
use hickory_proto::op::{Edns, Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const VERSION: &str = "0.1.0-test";

#[derive(Default)]
struct FixtureHosts {
    forward: HashMap<String, Vec<IpAddr>>,
    reverse: HashMap<String, String>,
}

impl FixtureHosts {
    fn with_forward(mut self, name: &str, ips: &[&str]) -> Self {
        self.forward.insert(
            name.to_string(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
        self
    }

    fn with_reverse(mut self, ptr: &str, fqdn: &str) -> Self {
        self.reverse.insert(ptr.to_string(), fqdn.to_string());
        self
    }
}

impl Hostfile for FixtureHosts {
    fn find_forward(&self, name: &str) -> Result<Vec<IpAddr>, DomainError> {
        Ok(self.forward.get(name.trim_end_matches('.')).cloned().unwrap_or_default())
    }

    fn find_reverse(&self, ptr_name: &str) -> Result<Option<String>, DomainError> {
        Ok(self.reverse.get(ptr_name).cloned())
    }
}

struct CountingExchanger {
    calls: AtomicUsize,
    rcode: ResponseCode,
}

impl CountingExchanger {
    fn new(rcode: ResponseCode) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            rcode,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchanger for CountingExchanger {
    async fn exchange(
        &self,
        request: &Message,
        _server: SocketAddr,
        _tcp: bool,
    ) -> Result<Message, DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_recursion_available(true)
            .set_response_code(self.rcode);
        response.add_queries(request.queries().iter().cloned());
        if self.rcode == ResponseCode::NoError {
            let name = request.query().unwrap().name().clone();
            response.add_answer(Record::from_rdata(
                name,
                300,
                RData::A(A("93.184.216.34".parse().unwrap())),
            ));
        }
        Ok(response)
    }
}

struct Fixture {
    handler: RequestHandler,
    exchanger: Arc<CountingExchanger>,
    metrics: Arc<Metrics>,
}

fn fixture(config: Config, hosts: FixtureHosts, upstream_rcode: ResponseCode) -> Fixture {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());
    let exchanger = CountingExchanger::new(upstream_rcode);
    let forwarder = Forwarder::new(config.clone(), exchanger.clone(), metrics.clone()).unwrap();
    let cache = ResponseCache::new(
        config.rcache_capacity,
        Duration::from_secs(config.rcache_ttl),
    );
    let handler = RequestHandler::new(
        config,
        cache,
        Arc::new(hosts),
        forwarder,
        metrics.clone(),
        VERSION,
    );
    Fixture {
        handler,
        exchanger,
        metrics,
    }
}

fn base_config() -> Config {
    Config {
        nameservers: vec!["10.1.1.1:53".parse().unwrap()],
        ..Config::default()
    }
}

fn query(name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(77).set_recursion_desired(true);
    message.add_query(Query::query(Name::from_utf8(name).unwrap(), rtype));
    message
}

fn chaos_query(name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(78);
    let mut q = Query::query(Name::from_utf8(name).unwrap(), rtype);
    q.set_query_class(DNSClass::CH);
    message.add_query(q);
    message
}

#[tokio::test]
async fn hosts_answer_a_queries() {
    let hosts = FixtureHosts::default().with_forward("test.domain.com", &["192.168.0.1"]);
    let f = fixture(base_config(), hosts, ResponseCode::NoError);

    let response = f.handler.handle(&query("test.domain.com.", RecordType::A), false).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.id(), 77);
    assert!(response.recursion_available());
    assert!(!response.authoritative());

    let answers = response.answers();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].ttl(), 10);
    match answers[0].data().unwrap() {
        RData::A(a) => assert_eq!(a.0, "192.168.0.1".parse::<std::net::Ipv4Addr>().unwrap()),
        other => panic!("expected A record, got {other:?}"),
    }
    // Answered locally, nothing forwarded.
    assert_eq!(f.exchanger.calls(), 0);
}

#[tokio::test]
async fn hosts_lookups_are_case_insensitive() {
    let hosts = FixtureHosts::default().with_forward("test.domain.com", &["192.168.0.1"]);
    let f = fixture(base_config(), hosts, ResponseCode::NoError);

    let response = f.handler.handle(&query("TEST.Domain.COM.", RecordType::A), false).await;
    assert_eq!(response.answers().len(), 1);
}

#[tokio::test]
async fn any_queries_return_both_families() {
    let hosts = FixtureHosts::default().with_forward("dual.example", &["192.0.2.1", "2001:db8::1"]);
    let f = fixture(base_config(), hosts, ResponseCode::NoError);

    let response = f.handler.handle(&query("dual.example.", RecordType::ANY), false).await;
    let types: Vec<RecordType> = response.answers().iter().map(|r| r.record_type()).collect();
    assert_eq!(types, vec![RecordType::A, RecordType::AAAA]);

    let response = f.handler.handle(&query("dual.example.", RecordType::A), false).await;
    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].record_type(), RecordType::A);

    let response = f.handler.handle(&query("dual.example.", RecordType::AAAA), false).await;
    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].record_type(), RecordType::AAAA);
}

#[tokio::test]
async fn single_family_entries_do_not_answer_the_other_family() {
    let hosts = FixtureHosts::default().with_forward("v6only.example", &["2001:db8::1"]);
    let f = fixture(base_config(), hosts, ResponseCode::NXDomain);

    // No A records can be synthesised from an AAAA-only entry: the query
    // goes upstream instead of answering an empty NOERROR locally.
    let response = f.handler.handle(&query("v6only.example.", RecordType::A), false).await;
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert_eq!(f.exchanger.calls(), 1);

    // The family the entry does cover still answers locally.
    let response = f.handler.handle(&query("v6only.example.", RecordType::AAAA), false).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert_eq!(response.answers()[0].record_type(), RecordType::AAAA);
    assert_eq!(f.exchanger.calls(), 1);
}

#[tokio::test]
async fn misses_in_hosts_fall_through_to_forwarding() {
    let f = fixture(base_config(), FixtureHosts::default(), ResponseCode::NoError);

    let response = f.handler.handle(&query("example.com.", RecordType::A), false).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(f.exchanger.calls(), 1);
    assert_eq!(f.metrics.forwards(), 1);
}

#[tokio::test]
async fn ptr_queries_answer_from_hosts() {
    let hosts = FixtureHosts::default()
        .with_reverse("1.0.168.192.in-addr.arpa.", "host.domain.com.");
    let f = fixture(base_config(), hosts, ResponseCode::NoError);

    let response = f
        .handler
        .handle(&query("1.0.168.192.in-addr.arpa.", RecordType::PTR), false)
        .await;
    assert_eq!(response.answers().len(), 1);
    match response.answers()[0].data().unwrap() {
        RData::PTR(ptr) => assert_eq!(ptr.0.to_utf8(), "host.domain.com."),
        other => panic!("expected PTR record, got {other:?}"),
    }
    assert_eq!(f.exchanger.calls(), 0);
}

#[tokio::test]
async fn ptr_misses_are_forwarded() {
    let f = fixture(base_config(), FixtureHosts::default(), ResponseCode::NXDomain);

    let response = f
        .handler
        .handle(&query("1.0.168.192.in-addr.arpa.", RecordType::PTR), false)
        .await;
    assert_eq!(response.response_code(), ResponseCode::NXDomain);
    assert_eq!(f.exchanger.calls(), 1);
}

#[tokio::test]
async fn chaos_txt_reports_version() {
    let f = fixture(base_config(), FixtureHosts::default(), ResponseCode::NoError);

    for name in ["version.bind.", "version.server."] {
        let response = f.handler.handle(&chaos_query(name, RecordType::TXT), false).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.authoritative());
        let answers = response.answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].dns_class(), DNSClass::CH);
        match answers[0].data().unwrap() {
            RData::TXT(txt) => {
                assert_eq!(txt.txt_data().len(), 1);
                assert_eq!(&*txt.txt_data()[0], VERSION.as_bytes());
            }
            other => panic!("expected TXT record, got {other:?}"),
        }
    }
    assert_eq!(f.exchanger.calls(), 0);
}

#[tokio::test]
async fn chaos_txt_reports_host_identifier() {
    let f = fixture(base_config(), FixtureHosts::default(), ResponseCode::NoError);

    let response = f
        .handler
        .handle(&chaos_query("hostname.bind.", RecordType::TXT), false)
        .await;
    match response.answers()[0].data().unwrap() {
        RData::TXT(txt) => assert_eq!(&*txt.txt_data()[0], b"localhost"),
        other => panic!("expected TXT record, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_chaos_queries_fail() {
    let f = fixture(base_config(), FixtureHosts::default(), ResponseCode::NoError);

    let response = f
        .handler
        .handle(&chaos_query("authors.bind.", RecordType::TXT), false)
        .await;
    assert_eq!(response.response_code(), ResponseCode::ServFail);

    let response = f
        .handler
        .handle(&chaos_query("version.bind.", RecordType::A), false)
        .await;
    assert_eq!(response.response_code(), ResponseCode::ServFail);
    assert_eq!(f.exchanger.calls(), 0);
}

#[tokio::test]
async fn second_identical_query_is_served_from_cache() {
    let mut config = base_config();
    config.rcache_capacity = 128;
    let f = fixture(config, FixtureHosts::default(), ResponseCode::NoError);

    let first = f.handler.handle(&query("example.com.", RecordType::A), false).await;
    assert_eq!(first.id(), 77);
    assert_eq!(f.exchanger.calls(), 1);

    let mut second_query = query("example.com.", RecordType::A);
    second_query.set_id(1234);
    let second = f.handler.handle(&second_query, false).await;
    assert_eq!(second.id(), 1234);
    assert_eq!(second.answers().len(), 1);
    // No further upstream exchange.
    assert_eq!(f.exchanger.calls(), 1);
    assert_eq!(f.metrics.cache_hits(), 1);
    assert_eq!(f.metrics.cache_misses(), 1);
}

#[tokio::test]
async fn do_bit_splits_the_cache() {
    let mut config = base_config();
    config.rcache_capacity = 128;
    let f = fixture(config, FixtureHosts::default(), ResponseCode::NoError);

    f.handler.handle(&query("example.com.", RecordType::A), false).await;

    let mut dnssec_query = query("example.com.", RecordType::A);
    let mut edns = Edns::new();
    edns.set_max_payload(4096);
    edns.set_dnssec_ok(true);
    dnssec_query.set_edns(edns);
    f.handler.handle(&dnssec_query, false).await;

    assert_eq!(f.exchanger.calls(), 2);
    assert_eq!(f.metrics.dnssec_ok(), 1);
}

#[tokio::test]
async fn refused_for_short_names_reaches_the_client() {
    let f = fixture(base_config(), FixtureHosts::default(), ResponseCode::NoError);

    let response = f.handler.handle(&query("web.", RecordType::A), false).await;
    assert_eq!(response.response_code(), ResponseCode::Refused);
    assert_eq!(f.exchanger.calls(), 0);
}

#[tokio::test]
async fn requests_without_a_question_fail() {
    let f = fixture(base_config(), FixtureHosts::default(), ResponseCode::NoError);

    let mut request = Message::new();
    request.set_id(9);
    let response = f.handler.handle(&request, false).await;
    assert_eq!(response.response_code(), ResponseCode::ServFail);
}

#[tokio::test]
async fn handle_raw_round_trips_the_wire_format() {
    let hosts = FixtureHosts::default().with_forward("test.domain.com", &["192.168.0.1"]);
    let f = fixture(base_config(), hosts, ResponseCode::NoError);

    let bytes = query("test.domain.com.", RecordType::A).to_vec().unwrap();
    let response_bytes = f.handler.handle_raw(&bytes, false).await.unwrap();
    let response = Message::from_vec(&response_bytes).unwrap();
    assert_eq!(response.id(), 77);
    assert_eq!(response.answers().len(), 1);

    // Garbage with a readable ID still gets a SERVFAIL.
    let garbage = [0xAB, 0xCD, 0xFF];
    let response_bytes = f.handler.handle_raw(&garbage, false).await.unwrap();
    let response = Message::from_vec(&response_bytes).unwrap();
    assert_eq!(response.id(), 0xABCD);
    assert_eq!(response.response_code(), ResponseCode::ServFail);
}

#[tokio::test]
async fn counters_track_the_pipeline() {
    let hosts = FixtureHosts::default().with_forward("local.example", &["192.0.2.9"]);
    let mut config = base_config();
    config.rcache_capacity = 128;
    let f = fixture(config, hosts, ResponseCode::NoError);

    f.handler.handle(&query("local.example.", RecordType::A), false).await;
    f.handler.handle(&query("example.com.", RecordType::A), false).await;
    f.handler.handle(&query("example.com.", RecordType::A), false).await;

    assert_eq!(f.metrics.requests(), 3);
    assert_eq!(f.metrics.forwards(), 1);
    assert_eq!(f.metrics.cache_hits(), 1);
}
