//! Local (stub) resolver transport: `resolv.conf`-sourced configuration,
//! a hosts-file short-circuit, name-list expansion, and serial/parallel
//! racing across configured servers, per §4.8. Grounded on
//! `resolve/transport/local.go` (`LocalTransport`, `dnsConfig`,
//! `resolverConfig`) and `resolve/transport/helper.go`.

mod config;
mod hosts;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dns_transport_tcp::TcpTransport;
use dns_transport_udp::UdpTransport;
use dns_types::{Query, RecordType, Response, ResponseCode, Transport, records};
use net_address::Endpoint;
use net_descriptor::Dialer;
use parking_lot::RwLock;

pub use config::{DEFAULT_ATTEMPTS, DEFAULT_NDOTS, DEFAULT_TIMEOUT, ReloadingConfig, ResolvConfig, avoid_dns, default_search, name_list};
pub use hosts::{HostsFile, NullHosts, StaticHosts};

const HOSTS_FILE_TTL_SECS: u32 = 600;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("server {0} is not part of the current resolver configuration")]
    UnknownServer(String),
    #[error("no candidate names to query")]
    NoCandidateNames,
    #[error("all servers exhausted: {0}")]
    Exhausted(String),
    #[error(transparent)]
    Dns(#[from] dns_types::Error),
}

impl From<Error> for dns_types::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Dns(error) => error,
            other => dns_types::Error::Io(std::io::Error::other(other)),
        }
    }
}

/// Per-server UDP transports, diffed against the live server set on every
/// attempt (§4.8, "Transport pool maintenance").
#[derive(Default)]
struct TransportPool {
    by_server: HashMap<String, Arc<UdpTransport>>,
}

impl TransportPool {
    /// Drops transports for servers no longer in `config`, so stale sockets
    /// aren't kept alive past a config reload.
    fn reconcile(&mut self, servers: &[Endpoint]) {
        let live: std::collections::HashSet<String> = servers.iter().map(Endpoint::to_string).collect();
        self.by_server.retain(|server, _| live.contains(server));
    }

    fn get_or_create(&mut self, server: &Endpoint, dialer: &Arc<dyn Dialer>) -> Arc<UdpTransport> {
        self.by_server
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(UdpTransport::new(server.clone(), dialer.clone())))
            .clone()
    }
}

/// Stub resolver transport backed by `/etc/resolv.conf` (or an equivalent
/// path) and an optional hosts file.
pub struct LocalTransport {
    config: ReloadingConfig,
    hosts: Arc<dyn HostsFile>,
    dialer: Arc<dyn Dialer>,
    pool: RwLock<TransportPool>,
}

impl LocalTransport {
    pub fn new(resolv_conf_path: impl Into<PathBuf>, hosts: Arc<dyn HostsFile>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            config: ReloadingConfig::new(resolv_conf_path),
            hosts,
            dialer,
            pool: RwLock::new(TransportPool::default()),
        }
    }

    pub fn without_hosts(resolv_conf_path: impl Into<PathBuf>, dialer: Arc<dyn Dialer>) -> Self {
        Self::new(resolv_conf_path, Arc::new(NullHosts), dialer)
    }

    pub async fn exchange(&self, query: &Query) -> Result<Response, Error> {
        if let Some(response) = self.hosts_short_circuit(query) {
            return Ok(response);
        }

        let config = self.config.current();
        let name = query.domain().to_string();
        let names = name_list(&config, &name);
        if names.is_empty() {
            return Err(Error::NoCandidateNames);
        }

        {
            let mut pool = self.pool.write();
            pool.reconcile(&config.servers);
        }

        let is_address_question = matches!(query.qtype(), RecordType::A | RecordType::AAAA);
        if config.single_request || !is_address_question {
            self.exchange_serial(&config, query, &names).await
        } else {
            self.exchange_parallel(&config, query, &names).await
        }
    }

    fn hosts_short_circuit(&self, query: &Query) -> Option<Response> {
        if !matches!(query.qtype(), RecordType::A | RecordType::AAAA) {
            return None;
        }

        let name = query.domain().to_string();
        let addrs = self.hosts.lookup(&name);
        let matching: Vec<_> = addrs
            .into_iter()
            .filter(|addr| matches!((addr, query.qtype()), (std::net::IpAddr::V4(_), RecordType::A) | (std::net::IpAddr::V6(_), RecordType::AAAA)))
            .collect();
        if matching.is_empty() {
            return None;
        }

        let response = dns_types::ResponseBuilder::for_query(query, ResponseCode::NOERROR)
            .with_records(matching.into_iter().map(|addr| (query.domain(), HOSTS_FILE_TTL_SECS, records::ip(addr))))
            .with_authoritative_and_recursion_available()
            .build();
        Some(response)
    }

    async fn exchange_serial(&self, config: &ResolvConfig, query: &Query, names: &[String]) -> Result<Response, Error> {
        let mut errors = Vec::new();
        for name in names {
            match self.try_one_name(config, query, name).await {
                Ok(response) => return Ok(response),
                Err(error) => errors.push(format!("{name}: {error}")),
            }
        }
        Err(Error::Exhausted(errors.join("; ")))
    }

    async fn exchange_parallel(&self, config: &ResolvConfig, query: &Query, names: &[String]) -> Result<Response, Error> {
        use futures::stream::{FuturesUnordered, StreamExt};

        let mut racers: FuturesUnordered<_> =
            names.iter().map(|name| Box::pin(self.try_one_name(config, query, name))).collect();

        let mut errors = Vec::new();
        while let Some(result) = racers.next().await {
            match result {
                Ok(response) => return Ok(response),
                Err(error) => errors.push(error.to_string()),
            }
        }
        Err(Error::Exhausted(errors.join("; ")))
    }

    /// One racer: `attempts` rounds across the (optionally rotated) server
    /// list, first success wins.
    async fn try_one_name(&self, config: &ResolvConfig, query: &Query, name: &str) -> Result<Response, Error> {
        let offset = config.next_server_offset() as usize;
        let server_count = config.servers.len();
        if server_count == 0 {
            return Err(Error::Exhausted("no servers configured".to_string()));
        }

        let mut errors = Vec::new();
        for _attempt in 0..config.attempts {
            for i in 0..server_count {
                let server = &config.servers[(i + offset) % server_count];
                match self.exchange_via_server(config, server, query, name).await {
                    Ok(response) => return Ok(response),
                    Err(error) => errors.push(format!("{server}: {error}")),
                }
            }
        }
        Err(Error::Exhausted(errors.join("; ")))
    }

    async fn exchange_via_server(&self, config: &ResolvConfig, server: &Endpoint, query: &Query, name: &str) -> Result<Response, Error> {
        let server = force_port_53(server);

        if !config.servers.iter().map(force_port_53).any(|known| known == server) {
            return Err(Error::UnknownServer(server.to_string()));
        }

        let candidate_name: dns_types::DomainName =
            name.parse().map_err(|_| Error::Exhausted(format!("{name} is not a valid domain name")))?;
        let udp_size = query.edns().map(|edns| edns.udp_payload_size).unwrap_or(1232);
        let candidate = Query::new(candidate_name, query.qtype(), udp_size).with_id(query.id()).with_ad(config.trust_ad);

        if config.use_tcp {
            let tcp = TcpTransport::new(server, self.dialer.clone());
            return Ok(Transport::exchange(&tcp, &candidate).await?);
        }

        let udp = self.pool.write().get_or_create(&server, &self.dialer);
        Ok(Transport::exchange(udp.as_ref(), &candidate).await?)
    }

    /// Forwards a multi-question message verbatim to each configured server
    /// in turn, first success wins. Unlike `exchange`, there is no single
    /// question to expand against the search domain list, so this skips
    /// straight to the per-server attempt loop (§4.4).
    pub async fn exchange_raw(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let config = self.config.current();
        if config.servers.is_empty() {
            return Err(Error::Exhausted("no servers configured".to_string()));
        }

        {
            let mut pool = self.pool.write();
            pool.reconcile(&config.servers);
        }

        let mut errors = Vec::new();
        for server in &config.servers {
            match self.exchange_raw_via_server(&config, server, message).await {
                Ok(reply) => return Ok(reply),
                Err(error) => errors.push(format!("{server}: {error}")),
            }
        }
        Err(Error::Exhausted(errors.join("; ")))
    }

    async fn exchange_raw_via_server(&self, config: &ResolvConfig, server: &Endpoint, message: &[u8]) -> Result<Vec<u8>, Error> {
        let server = force_port_53(server);
        let use_tcp = config.use_tcp;

        if use_tcp {
            let tcp = TcpTransport::new(server, self.dialer.clone());
            return Ok(Transport::exchange_raw(&tcp, message).await?);
        }

        let udp = self.pool.write().get_or_create(&server, &self.dialer);
        Ok(Transport::exchange_raw(udp.as_ref(), message).await?)
    }
}

fn force_port_53(endpoint: &Endpoint) -> Endpoint {
    if endpoint.port() == 53 { endpoint.clone() } else { Endpoint::new(endpoint.host().clone(), 53) }
}

impl Transport for LocalTransport {
    fn exchange<'a>(&'a self, query: &'a Query) -> dns_types::BoxFuture<'a, Result<Response, dns_types::Error>> {
        Box::pin(async move { self.exchange(query).await.map_err(Into::into) })
    }
}
