//! Network descriptor `(Protocol, Version)`, `Strategy`, and the narrow
//! `Dialer`/`ParallelDialer` capability traits that the dialing layers
//! implement and depend on without creating a crate cycle between them.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;

use net_address::Endpoint;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid network string: {0}")]
    InvalidNetwork(String),
    #[error("invalid strategy: {0}")]
    InvalidStrategy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    V4,
    V6,
    Dual,
}

/// Pair `(protocol, version)`. `Version::Dual` means "either family
/// acceptable"; [`Network::apply_strategy`] narrows it to v4 or v6 when the
/// strategy forces one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Network {
    pub protocol: Protocol,
    pub version: Version,
}

impl Network {
    pub const fn new(protocol: Protocol, version: Version) -> Self {
        Self { protocol, version }
    }

    pub const TCP: Network = Network::new(Protocol::Tcp, Version::Dual);
    pub const TCP4: Network = Network::new(Protocol::Tcp, Version::V4);
    pub const TCP6: Network = Network::new(Protocol::Tcp, Version::V6);
    pub const UDP: Network = Network::new(Protocol::Udp, Version::Dual);
    pub const UDP4: Network = Network::new(Protocol::Udp, Version::V4);
    pub const UDP6: Network = Network::new(Protocol::Udp, Version::V6);

    pub fn is_tcp(&self) -> bool {
        matches!(self.protocol, Protocol::Tcp)
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.protocol, Protocol::Udp)
    }

    pub fn accepts_v4(&self) -> bool {
        matches!(self.version, Version::Dual | Version::V4)
    }

    pub fn accepts_v6(&self) -> bool {
        matches!(self.version, Version::Dual | Version::V6)
    }

    pub fn is_single_family(&self) -> bool {
        !matches!(self.version, Version::Dual)
    }

    /// Narrows `Dual` to `v4`/`v6` when the strategy forces one family;
    /// already-narrowed networks (e.g. `tcp4`) are left alone.
    pub fn apply_strategy(mut self, strategy: Strategy) -> Network {
        match strategy {
            Strategy::Ipv4Only => self.version = Version::V4,
            Strategy::Ipv6Only => self.version = Version::V6,
            Strategy::PreferIpv4 | Strategy::PreferIpv6 => {}
        }
        self
    }

    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.accepts_v4(),
            IpAddr::V6(_) => self.accepts_v6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.version {
            Version::V4 => "4",
            Version::V6 => "6",
            Version::Dual => "",
        };
        write!(f, "{}{suffix}", self.protocol.as_str())
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, version) = match s {
            "tcp" => (Protocol::Tcp, Version::Dual),
            "udp" => (Protocol::Udp, Version::Dual),
            "tcp4" => (Protocol::Tcp, Version::V4),
            "udp4" => (Protocol::Udp, Version::V4),
            "tcp6" => (Protocol::Tcp, Version::V6),
            "udp6" => (Protocol::Udp, Version::V6),
            other => return Err(Error::InvalidNetwork(other.to_string())),
        };
        Ok(Network { protocol, version })
    }
}

/// Closed strategy enum. `Default` (the `Default` trait impl) matches the
/// spec's default of `prefer_ipv6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    PreferIpv6,
    PreferIpv4,
    Ipv6Only,
    Ipv4Only,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::PreferIpv6
    }
}

impl Strategy {
    pub fn prefers_v6(&self) -> bool {
        matches!(self, Strategy::PreferIpv6)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::PreferIpv6 => "prefer_ipv6",
            Strategy::PreferIpv4 => "prefer_ipv4",
            Strategy::Ipv6Only => "ipv6_only",
            Strategy::Ipv4Only => "ipv4_only",
        };
        f.write_str(s)
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer_ipv4" => Ok(Strategy::PreferIpv4),
            "prefer_ipv6" => Ok(Strategy::PreferIpv6),
            "ipv4_only" => Ok(Strategy::Ipv4Only),
            "ipv6_only" => Ok(Strategy::Ipv6Only),
            "default" | "" => Ok(Strategy::default()),
            other => Err(Error::InvalidStrategy(other.to_string())),
        }
    }
}

/// A dialed stream connection. Narrow enough that `dialer`, `happy-eyeballs`
/// and `dns-transport-tcp` can all treat it opaquely.
pub trait Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> io::Result<std::net::SocketAddr>;
    fn peer_addr(&self) -> io::Result<std::net::SocketAddr>;
}

/// A listening/connected packet socket, as returned by `Dialer::listen_packet`.
pub trait PacketConn: Send + Sync {
    fn send_to<'a>(&'a self, buf: &'a [u8], dst: std::net::SocketAddr) -> BoxFuture<'a, io::Result<usize>>;
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, std::net::SocketAddr)>>;
    fn local_addr(&self) -> io::Result<std::net::SocketAddr>;
}

/// Dials already-resolved endpoints. Resolution happens one layer up
/// (`dns-client`); implementations reject FQDN endpoints.
pub trait Dialer: Send + Sync {
    fn dial_context<'a>(
        &'a self,
        network: Network,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, io::Result<Box<dyn Conn>>>;

    fn listen_packet<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<Box<dyn PacketConn>>>;
}

/// A `Dialer` that can additionally race a pre-resolved address set with
/// happy-eyeballs fallback.
pub trait ParallelDialer: Dialer {
    fn dial_parallel<'a>(
        &'a self,
        network: Network,
        addrs: &'a [IpAddr],
        port: u16,
        strategy: Strategy,
    ) -> BoxFuture<'a, io::Result<Box<dyn Conn>>>;
}
