//! Address model: a tagged endpoint carrying at most one of IPv4, IPv6 or
//! FQDN plus a port, with the invariants the rest of the workspace relies on.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("empty host")]
    EmptyHost,
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// The host part of an [`Endpoint`]: exactly one of IPv4, IPv6 or FQDN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Fqdn(String),
}

impl Host {
    pub fn is_ip(&self) -> bool {
        !matches!(self, Host::Fqdn(_))
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Host::V4(v4) => Some(IpAddr::V4(*v4)),
            Host::V6(v6) => Some(IpAddr::V6(*v6)),
            Host::Fqdn(_) => None,
        }
    }

    /// Unwraps an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) to plain IPv4.
    /// Any other host is returned unchanged.
    pub fn unwrap_v4_in_v6(self) -> Host {
        match self {
            Host::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Host::V4(v4),
                None => Host::V6(v6),
            },
            other => other,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::V4(v4) => write!(f, "{v4}"),
            Host::V6(v6) => write!(f, "{v6}"),
            Host::Fqdn(name) => write!(f, "{name}"),
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Host::V4(v4),
            IpAddr::V6(v6) => Host::V6(v6),
        }
    }
}

/// Tagged `(host, port)` pair. Exactly one of IP/FQDN is populated in
/// `host`; `Dialable`/`NeedResolve` are derived predicates, not stored bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl Endpoint {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self { host: Host::from(ip), port }
    }

    pub fn from_fqdn(fqdn: impl Into<String>, port: u16) -> Self {
        Self { host: Host::Fqdn(fqdn.into()), port }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `Dialable ⇔ (IP present ∨ FQDN non-empty) ∧ port ≠ 0`.
    pub fn is_dialable(&self) -> bool {
        let host_ok = match &self.host {
            Host::Fqdn(name) => !name.is_empty(),
            _ => true,
        };
        host_ok && self.port != 0
    }

    /// `NeedResolve ⇔ FQDN set ∧ IP absent`.
    pub fn needs_resolve(&self) -> bool {
        matches!(self.host, Host::Fqdn(_))
    }

    pub fn unwrap_v4_in_v6(self) -> Endpoint {
        Endpoint { host: self.host.unwrap_v4_in_v6(), port: self.port }
    }

    /// Drops the port, keeping only the host. Used by the NAT bidirectional
    /// wrapper to compare peers irrespective of ephemeral source ports.
    pub fn no_port(&self) -> Host {
        self.host.clone()
    }

    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        self.host.as_ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::from_ip(addr.ip(), addr.port())
    }
}

/// Bracketed-IPv6 string form per RFC 3986, e.g. `[2001:db8::1]:53`.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::V6(v6) => write!(f, "[{v6}]:{}", self.port),
            other => write!(f, "{other}:{}", self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host_part, port_part) = split_host_port(s)?;
        let port: u16 = port_part
            .parse()
            .map_err(|_| Error::InvalidPort(port_part.to_string()))?;

        if host_part.is_empty() {
            return Err(Error::EmptyHost);
        }

        let host = if let Ok(v4) = host_part.parse::<Ipv4Addr>() {
            Host::V4(v4)
        } else if let Ok(v6) = host_part.parse::<Ipv6Addr>() {
            Host::V6(v6)
        } else {
            Host::Fqdn(host_part.to_string())
        };

        Ok(Endpoint { host, port })
    }
}

fn split_host_port(s: &str) -> Result<(&str, &str), Error> {
    if let Some(rest) = s.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| Error::InvalidEndpoint(s.to_string()))?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| Error::InvalidEndpoint(s.to_string()))?;
        return Ok((host, port));
    }

    let idx = s
        .rfind(':')
        .ok_or_else(|| Error::InvalidEndpoint(s.to_string()))?;
    Ok((&s[..idx], &s[idx + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialable_requires_host_and_nonzero_port() {
        let empty_fqdn = Endpoint::from_fqdn("", 80);
        assert!(!empty_fqdn.is_dialable());

        let zero_port = Endpoint::from_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        assert!(!zero_port.is_dialable());

        let ok = Endpoint::from_fqdn("example.com", 443);
        assert!(ok.is_dialable());
    }

    #[test]
    fn need_resolve_only_for_fqdn() {
        let ip = Endpoint::from_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 80);
        assert!(!ip.needs_resolve());

        let fqdn = Endpoint::from_fqdn("example.com", 80);
        assert!(fqdn.needs_resolve());
    }

    #[test]
    fn display_round_trips_v4() {
        let ep = Endpoint::from_ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 53);
        let s = ep.to_string();
        assert_eq!(s, "192.0.2.1:53");
        assert_eq!(s.parse::<Endpoint>().unwrap(), ep);
    }

    #[test]
    fn display_round_trips_bracketed_v6() {
        let ep = Endpoint::from_ip(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 53);
        let s = ep.to_string();
        assert_eq!(s, "[2001:db8::1]:53");
        assert_eq!(s.parse::<Endpoint>().unwrap(), ep);
    }

    #[test]
    fn display_round_trips_fqdn() {
        let ep = Endpoint::from_fqdn("example.com", 443);
        let s = ep.to_string();
        assert_eq!(s, "example.com:443");
        assert_eq!(s.parse::<Endpoint>().unwrap(), ep);
    }

    #[test]
    fn unwraps_v4_in_v6() {
        let mapped = Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0xc000, 0x0201);
        let ep = Endpoint::from_ip(IpAddr::V6(mapped), 53).unwrap_v4_in_v6();
        assert_eq!(ep.host(), &Host::V4(Ipv4Addr::new(192, 0, 2, 1)));
    }

    #[test]
    fn rejects_malformed_strings() {
        assert_eq!("".parse::<Endpoint>(), Err(Error::InvalidEndpoint("".into())));
        assert!("example.com".parse::<Endpoint>().is_err());
        assert!("example.com:notaport".parse::<Endpoint>().is_err());
    }
}
