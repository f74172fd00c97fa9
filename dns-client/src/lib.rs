//! DNS client (§4.5): `ResolverClient::lookup`/`exchange` orchestrate A+AAAA
//! fan-out and strategy-based address ordering on top of a cache-wrapped
//! `Transport`; `ResolveDialer` composes that with a `ParallelDialer` so
//! callers can dial an FQDN endpoint directly. Grounded on
//! `original_source/resolve/client.go` (`Client.Lookup`/`Exchange`,
//! `sortAddresses`) and `original_source/resolve/dialer.go` (`ResolveDialer`).

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{Context, Result};
use dns_types::{DomainName, Query, RecordType, Request, Response, ResponseCode, Transport, records};
use net_address::Endpoint;
use net_descriptor::{Dialer, Network, ParallelDialer, Strategy};

/// §6 default: advertised in every query's EDNS(0) OPT.
pub const DEFAULT_UDP_PAYLOAD_SIZE: u16 = 1232;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid domain name {fqdn:?}")]
    InvalidDomain { fqdn: String, #[source] source: anyhow::Error },
    #[error("upstream returned {0:?}")]
    DnsRecord(ResponseCode),
    #[error(transparent)]
    Cache(#[from] dns_cache::Error),
    #[error(transparent)]
    Transport(#[from] dns_types::Error),
    #[error("no addresses found for {fqdn}: {causes}")]
    NoAddresses { fqdn: String, causes: JoinedError },
}

/// Accumulates per-branch failures the way `errors.Join` does in the
/// original: a flat list, rendered joined by `"; "` (§7 "Joined into ...").
#[derive(Debug)]
pub struct JoinedError(pub Vec<anyhow::Error>);

impl std::fmt::Display for JoinedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

impl std::error::Error for JoinedError {}

/// Resolves names and exchanges raw DNS messages against a single upstream
/// `Transport`, optionally fronted by a cache. Grounded on `resolve.Client`.
pub struct ResolverClient {
    cache: Option<Arc<dns_cache::Cache>>,
    transport: Arc<dyn Transport>,
    udp_payload_size: u16,
    next_id: AtomicU16,
}

impl ResolverClient {
    pub fn new(transport: Arc<dyn Transport>, cache: Option<Arc<dns_cache::Cache>>) -> Self {
        Self { cache, transport, udp_payload_size: DEFAULT_UDP_PAYLOAD_SIZE, next_id: AtomicU16::new(0) }
    }

    fn next_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn build_query(&self, domain: DomainName, qtype: RecordType) -> Query {
        Query::new(domain, qtype, self.udp_payload_size).with_id(self.next_id()).with_ad(false)
    }

    /// §4.5 `Exchange`: a single question/response round trip, through the
    /// cache when one is configured.
    pub async fn exchange(&self, query: &Query) -> Result<Response, Error> {
        match &self.cache {
            Some(cache) => Ok(cache.load_or_store_query(query, self.transport.clone()).await?),
            None => Ok(self.transport.exchange(query).await?),
        }
    }

    /// The public `Exchange(ctx, message) → message` operation (§6): accepts
    /// whatever question shape the caller received off the wire, mirroring
    /// `dns_cache::Cache::load_or_store`'s own handling of zero/many
    /// questions for the no-cache path.
    pub async fn exchange_request(&self, request: &Request) -> Result<Response, Error> {
        match &self.cache {
            Some(cache) => Ok(cache.load_or_store(request, self.transport.clone()).await?),
            None => match request {
                Request::NoQuestion { id } => Ok(Response::formerr_for_id(*id)),
                Request::Multiple { bytes, .. } => {
                    let raw = self.transport.exchange_raw(bytes).await?;
                    Ok(Response::parse_passthrough(raw)?)
                }
                Request::Single(query) => self.exchange(query).await,
            },
        }
    }

    /// One exchange for `qtype`, surfacing non-`NOERROR` rcodes as
    /// [`Error::DnsRecord`] and otherwise extracting every A/AAAA address
    /// from the answer section.
    async fn exchange_addresses(&self, domain: &DomainName, qtype: RecordType) -> Result<Vec<IpAddr>, Error> {
        let query = self.build_query(domain.clone(), qtype);
        let response = self.exchange(&query).await?;

        if response.response_code() != ResponseCode::NOERROR {
            return Err(Error::DnsRecord(response.response_code()));
        }

        Ok(response.records().filter_map(records::extract_ip).collect())
    }

    /// §4.5 `Lookup`: normalizes `fqdn`, then either a single exchange
    /// (`*_only` strategies) or a parallel A+AAAA fan-out merged by
    /// [`sort_addresses`]. Joined error only when both branches yield zero
    /// addresses, mirroring `Client.Lookup`.
    pub async fn lookup(&self, fqdn: &str, strategy: Strategy) -> Result<Vec<IpAddr>, Error> {
        let domain: DomainName = DomainName::vec_from_str(fqdn)
            .with_context(|| format!("failed to parse domain name {fqdn:?}"))
            .map_err(|source| Error::InvalidDomain { fqdn: fqdn.to_string(), source })?;

        match strategy {
            Strategy::Ipv4Only => self.exchange_addresses(&domain, RecordType::A).await,
            Strategy::Ipv6Only => self.exchange_addresses(&domain, RecordType::AAAA).await,
            Strategy::PreferIpv4 | Strategy::PreferIpv6 => {
                let (result4, result6) =
                    futures::join!(self.exchange_addresses(&domain, RecordType::A), self.exchange_addresses(&domain, RecordType::AAAA));

                let mut causes = Vec::new();
                let addresses4 = result4.inspect_err(|e| causes.push(anyhow::anyhow!(e.to_string()))).unwrap_or_default();
                let addresses6 = result6.inspect_err(|e| causes.push(anyhow::anyhow!(e.to_string()))).unwrap_or_default();

                if addresses4.is_empty() && addresses6.is_empty() {
                    if causes.is_empty() {
                        causes.push(anyhow::anyhow!("no A/AAAA records found"));
                    }
                    tracing::debug!(fqdn, %strategy, "lookup found no addresses in either family");
                    return Err(Error::NoAddresses { fqdn: fqdn.to_string(), causes: JoinedError(causes) });
                }

                Ok(sort_addresses(addresses4, addresses6, strategy))
            }
        }
    }
}

/// `prefer_v6` (the default) and bare `default` place v6 first; every other
/// strategy places v4 first. Mirrors `sortAddresses` in the original.
pub fn sort_addresses(addresses4: Vec<IpAddr>, addresses6: Vec<IpAddr>, strategy: Strategy) -> Vec<IpAddr> {
    if strategy.prefers_v6() {
        let mut merged = addresses6;
        merged.extend(addresses4);
        merged
    } else {
        let mut merged = addresses4;
        merged.extend(addresses6);
        merged
    }
}

fn strategy_conflicts_network(network: Network, strategy: Strategy) -> bool {
    use net_descriptor::Version;
    matches!(
        (network.version, strategy),
        (Version::V4, Strategy::Ipv6Only) | (Version::V6, Strategy::Ipv4Only)
    )
}

/// Wraps an already-resolved [`ParallelDialer`] with the DNS client, routing
/// FQDN endpoints through [`ResolverClient::lookup`] before delegating to the
/// underlay's serial/parallel dial. Grounded on
/// `original_source/resolve/dialer.go`'s `Dialer`.
///
/// The original detects an already-constructed `*Dialer` underlay via a type
/// assertion to avoid double-wrapping it; Rust trait objects have no such
/// downcast without `Any`, and nothing in this workspace constructs a
/// `ResolveDialer` from another `ResolveDialer`, so that case is simply not
/// reachable here rather than specially handled (see `DESIGN.md`).
pub struct ResolveDialer {
    parallel: Arc<dyn ParallelDialer>,
    client: Arc<ResolverClient>,
    strategy: Strategy,
}

impl ResolveDialer {
    pub fn new(parallel: Arc<dyn ParallelDialer>, client: Arc<ResolverClient>, strategy: Strategy) -> Self {
        Self { parallel, client, strategy }
    }

    async fn resolve(&self, fqdn: &str, network: Network) -> Result<Vec<IpAddr>, Error> {
        if strategy_conflicts_network(network, self.strategy) {
            return Err(Error::NoAddresses { fqdn: fqdn.to_string(), causes: JoinedError(vec![anyhow::anyhow!("network {network} rules out every address family {} would return", self.strategy)]) });
        }

        self.client.lookup(fqdn, self.strategy).await
    }

    /// Dials `addrs` one at a time through `self.parallel`'s `Dialer` half,
    /// in order, returning the first success and otherwise the last error.
    /// Inlined rather than calling `happy_eyeballs::dial_serial` directly:
    /// that helper is generic over `D: Dialer + ?Sized`, and `self.parallel`
    /// is a `dyn ParallelDialer` — calling its (inherited) `Dialer` methods
    /// works fine on the trait object, but satisfying a *generic* `Dialer`
    /// bound with a `dyn ParallelDialer` argument does not.
    async fn dial_serial(&self, network: Network, addrs: &[IpAddr], port: u16) -> std::io::Result<Box<dyn net_descriptor::Conn>> {
        let mut last_err = None;
        for addr in addrs {
            let endpoint = Endpoint::from_ip(*addr, port);
            match self.parallel.dial_context(network, &endpoint).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| happy_eyeballs::Error::NoAddressToDial.into()))
    }
}

impl Dialer for ResolveDialer {
    fn dial_context<'a>(&'a self, network: Network, endpoint: &'a Endpoint) -> net_descriptor::BoxFuture<'a, std::io::Result<Box<dyn net_descriptor::Conn>>> {
        Box::pin(async move {
            if !endpoint.needs_resolve() {
                return self.parallel.dial_context(network, endpoint).await;
            }

            let fqdn = endpoint.host().to_string();
            let addresses = self.resolve(&fqdn, network).await.map_err(std::io::Error::other)?;

            let dial_parallel = self.strategy != Strategy::Ipv4Only
                && self.strategy != Strategy::Ipv6Only
                && network.protocol == net_descriptor::Protocol::Tcp
                && !network.is_single_family()
                && addresses.len() >= 2;

            if dial_parallel {
                self.parallel.dial_parallel(network, &addresses, endpoint.port(), self.strategy).await
            } else {
                self.dial_serial(network, &addresses, endpoint.port()).await
            }
        })
    }

    fn listen_packet<'a>(&'a self, endpoint: &'a Endpoint) -> net_descriptor::BoxFuture<'a, std::io::Result<Box<dyn net_descriptor::PacketConn>>> {
        Box::pin(async move {
            if !endpoint.needs_resolve() {
                return self.parallel.listen_packet(endpoint).await;
            }

            let fqdn = endpoint.host().to_string();
            let addresses = self.resolve(&fqdn, Network::UDP).await.map_err(std::io::Error::other)?;

            let mut last_err = None;
            for addr in &addresses {
                let candidate = Endpoint::from_ip(*addr, endpoint.port());
                match self.parallel.listen_packet(&candidate).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => last_err = Some(e),
                }
            }

            Err(last_err.unwrap_or_else(|| happy_eyeballs::Error::NoAddressToDial.into()))
        })
    }
}

impl ParallelDialer for ResolveDialer {
    fn dial_parallel<'a>(
        &'a self,
        network: Network,
        addrs: &'a [IpAddr],
        port: u16,
        strategy: Strategy,
    ) -> net_descriptor::BoxFuture<'a, std::io::Result<Box<dyn net_descriptor::Conn>>> {
        self.parallel.dial_parallel(network, addrs, port, strategy)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Mutex;

    use dns_types::BoxFuture;

    use super::*;

    struct FakeTransport {
        v4: Vec<Ipv4Addr>,
        v6: Vec<Ipv6Addr>,
        rcode: ResponseCode,
        calls: Mutex<Vec<RecordType>>,
    }

    impl Transport for FakeTransport {
        fn exchange<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Response, dns_types::Error>> {
            let qtype = query.qtype();
            self.calls.lock().unwrap().push(qtype);

            let answers: Vec<_> = match qtype {
                RecordType::A => self.v4.iter().map(|ip| records::a(*ip)).collect(),
                RecordType::AAAA => self.v6.iter().map(|ip| records::aaaa(*ip)).collect(),
                _ => Vec::new(),
            };

            let domain = query.domain();
            let response = dns_types::ResponseBuilder::for_query(query, self.rcode)
                .with_records(answers.into_iter().map(move |data| (domain.clone(), 60u32, data)))
                .build();

            Box::pin(async move { Ok(response) })
        }

        fn exchange_raw<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, dns_types::Error>> {
            self.calls.lock().unwrap().push(RecordType::ANY);
            let mut reply = message.to_vec();
            reply[2] |= 0b1000_0000;
            Box::pin(async move { Ok(reply) })
        }
    }

    fn client(v4: Vec<Ipv4Addr>, v6: Vec<Ipv6Addr>) -> ResolverClient {
        let transport = Arc::new(FakeTransport { v4, v6, rcode: ResponseCode::NOERROR, calls: Mutex::new(Vec::new()) });
        ResolverClient::new(transport, None)
    }

    #[tokio::test]
    async fn lookup_prefers_v6_first_by_default() {
        let c = client(vec![Ipv4Addr::new(192, 0, 2, 1)], vec![Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)]);

        let addrs = c.lookup("example.com", Strategy::PreferIpv6).await.unwrap();
        assert_eq!(addrs, vec![IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);
    }

    #[tokio::test]
    async fn lookup_prefers_v4_first_when_asked() {
        let c = client(vec![Ipv4Addr::new(192, 0, 2, 1)], vec![Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)]);

        let addrs = c.lookup("example.com", Strategy::PreferIpv4).await.unwrap();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))]);
    }

    #[tokio::test]
    async fn lookup_only_queries_one_family_for_ipv4_only() {
        let transport = Arc::new(FakeTransport {
            v4: vec![Ipv4Addr::new(192, 0, 2, 1)],
            v6: vec![Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)],
            rcode: ResponseCode::NOERROR,
            calls: Mutex::new(Vec::new()),
        });
        let c = ResolverClient::new(transport.clone(), None);

        let addrs = c.lookup("example.com", Strategy::Ipv4Only).await.unwrap();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);
        assert_eq!(*transport.calls.lock().unwrap(), vec![RecordType::A]);
    }

    #[tokio::test]
    async fn lookup_partial_success_returns_the_successful_family() {
        let c = client(vec![Ipv4Addr::new(192, 0, 2, 1)], vec![]);

        let addrs = c.lookup("example.com", Strategy::PreferIpv6).await.unwrap();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);
    }

    #[tokio::test]
    async fn lookup_fails_when_both_families_empty() {
        let c = client(vec![], vec![]);

        let err = c.lookup("example.com", Strategy::PreferIpv6).await.unwrap_err();
        assert!(matches!(err, Error::NoAddresses { .. }));
    }

    #[tokio::test]
    async fn lookup_surfaces_dns_record_error() {
        let transport = Arc::new(FakeTransport { v4: vec![], v6: vec![], rcode: ResponseCode::SERVFAIL, calls: Mutex::new(Vec::new()) });
        let c = ResolverClient::new(transport, None);

        let err = c.lookup("example.com", Strategy::Ipv4Only).await.unwrap_err();
        assert!(matches!(err, Error::DnsRecord(ResponseCode::SERVFAIL)));
    }

    #[tokio::test]
    async fn exchange_request_short_circuits_no_question() {
        let c = client(vec![], vec![]);
        let response = c.exchange_request(&Request::NoQuestion { id: 0x1234 }).await.unwrap();
        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.response_code(), ResponseCode::FORMERR);
    }

    #[tokio::test]
    async fn exchange_request_forwards_multi_question_without_a_cache() {
        let transport = Arc::new(FakeTransport { v4: vec![], v6: vec![], rcode: ResponseCode::NOERROR, calls: Mutex::new(Vec::new()) });
        let c = ResolverClient::new(transport.clone(), None);

        let mut bytes = vec![0u8; 12];
        bytes[0..2].copy_from_slice(&0x55AAu16.to_be_bytes());
        bytes[4..6].copy_from_slice(&2u16.to_be_bytes());
        let request = Request::parse(&bytes).unwrap();
        assert!(matches!(request, Request::Multiple { id: 0x55AA, .. }));

        let response = c.exchange_request(&request).await.unwrap();
        assert_eq!(response.id(), 0x55AA);
        assert_eq!(*transport.calls.lock().unwrap(), vec![RecordType::ANY], "must forward to the transport, not synthesize a reply");
    }

    #[tokio::test]
    async fn lookup_rejects_malformed_domain() {
        let c = client(vec![], vec![]);
        let err = c.lookup("foo..bar", Strategy::PreferIpv6).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDomain { .. }));
    }

    struct FakeParallelDialer {
        dial_context_calls: Mutex<Vec<Endpoint>>,
    }

    impl Dialer for FakeParallelDialer {
        fn dial_context<'a>(&'a self, _network: Network, endpoint: &'a Endpoint) -> net_descriptor::BoxFuture<'a, std::io::Result<Box<dyn net_descriptor::Conn>>> {
            self.dial_context_calls.lock().unwrap().push(endpoint.clone());
            Box::pin(async { Err(std::io::Error::other("no real sockets in this test")) })
        }

        fn listen_packet<'a>(&'a self, _endpoint: &'a Endpoint) -> net_descriptor::BoxFuture<'a, std::io::Result<Box<dyn net_descriptor::PacketConn>>> {
            Box::pin(async { Err(std::io::Error::other("no real sockets in this test")) })
        }
    }

    impl ParallelDialer for FakeParallelDialer {
        fn dial_parallel<'a>(
            &'a self,
            network: Network,
            addrs: &'a [IpAddr],
            port: u16,
            _strategy: Strategy,
        ) -> net_descriptor::BoxFuture<'a, std::io::Result<Box<dyn net_descriptor::Conn>>> {
            Box::pin(async move {
                for addr in addrs {
                    self.dial_context_calls.lock().unwrap().push(Endpoint::from_ip(*addr, port));
                }
                let _ = network;
                Err(std::io::Error::other("no real sockets in this test"))
            })
        }
    }

    #[tokio::test]
    async fn dial_context_bypasses_lookup_for_ip_endpoints() {
        let parallel = Arc::new(FakeParallelDialer { dial_context_calls: Mutex::new(Vec::new()) });
        let resolver = Arc::new(client(vec![], vec![]));
        let resolve_dialer = ResolveDialer::new(parallel.clone(), resolver, Strategy::PreferIpv6);

        let endpoint = Endpoint::from_ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)), 443);
        let _ = resolve_dialer.dial_context(Network::TCP, &endpoint).await;

        assert_eq!(parallel.dial_context_calls.lock().unwrap().as_slice(), &[endpoint]);
    }

    #[tokio::test]
    async fn dial_context_resolves_fqdn_endpoints_before_dialing() {
        let parallel = Arc::new(FakeParallelDialer { dial_context_calls: Mutex::new(Vec::new()) });
        let resolver = Arc::new(client(vec![Ipv4Addr::new(192, 0, 2, 9)], vec![]));
        let resolve_dialer = ResolveDialer::new(parallel.clone(), resolver, Strategy::Ipv4Only);

        let endpoint = Endpoint::from_fqdn("example.com", 443);
        let _ = resolve_dialer.dial_context(Network::TCP, &endpoint).await;

        assert_eq!(parallel.dial_context_calls.lock().unwrap().as_slice(), &[Endpoint::from_ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), 443)]);
    }
}
