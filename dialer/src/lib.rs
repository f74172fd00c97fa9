//! Default dialer: separate v4/v6 dialers for TCP (TFO-aware) and UDP,
//! `DialContext`/`ListenPacket` per §4.2.

mod tfo;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use net_address::Endpoint;
use net_descriptor::{BoxFuture, Conn as NdConn, Network, PacketConn as NdPacketConn, Protocol};
use socket_control::HookChain;
use tfo::TfoStream;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("endpoint is not dialable")]
    NotDialable,
    #[error("endpoint has not been resolved to an IP")]
    AddressNotResolved,
    #[error("no address to dial: endpoint family disagrees with network")]
    NoAddressToDial,
    #[error("network not supported: {0}")]
    UnsupportedNetwork(Network),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::other(e)
    }
}

/// Tunable knobs, defaults per §6: TCP keepalive idle 5 min / interval 75s /
/// probes 16, dial timeout 5s, fragmentation enabled by default (disabled
/// unless `allow_udp_fragmentation` is set, matching `!config.UDPFragment`
/// in the original).
#[derive(Debug, Clone)]
pub struct Config {
    pub keepalive_idle: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_probes: u32,
    pub timeout: Duration,
    pub interface: Option<String>,
    pub interface_index: Option<u32>,
    pub bind_address4: Option<Ipv4Addr>,
    pub bind_address6: Option<Ipv6Addr>,
    pub fwmark: u32,
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub tfo: bool,
    pub allow_udp_fragmentation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_idle: Duration::from_secs(5 * 60),
            keepalive_interval: Duration::from_secs(75),
            keepalive_probes: 16,
            timeout: Duration::from_secs(5),
            interface: None,
            interface_index: None,
            bind_address4: None,
            bind_address6: None,
            fwmark: 0,
            reuse_addr: false,
            reuse_port: false,
            tfo: false,
            allow_udp_fragmentation: false,
        }
    }
}

fn build_hooks(config: &Config, for_listener: bool) -> HookChain {
    let mut chain = HookChain::new();

    if config.interface.is_some() || config.interface_index.is_some() {
        chain = chain.push(socket_control::bind_to_interface(config.interface.clone(), config.interface_index));
    }
    if config.fwmark != 0 {
        chain = chain.push(socket_control::fwmark(config.fwmark));
    }
    if for_listener && config.reuse_addr {
        chain = chain.push(socket_control::reuse_address());
    }
    if for_listener && config.reuse_port {
        chain = chain.push(socket_control::reuse_port());
    }
    if !config.allow_udp_fragmentation {
        chain = chain.push(socket_control::disable_udp_fragmentation());
    }

    chain
}

fn apply_tcp_keepalive(stream: &socket_factory::TcpStream, config: &Config) -> io::Result<()> {
    use std::os::fd::{AsRawFd, FromRawFd};
    let borrowed = unsafe { socket2::Socket::from_raw_fd(stream.as_raw_fd()) };
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(config.keepalive_idle)
        .with_interval(config.keepalive_interval);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let keepalive = keepalive.with_retries(config.keepalive_probes);
    let result = borrowed.set_tcp_keepalive(&keepalive);
    // `from_raw_fd` does not take ownership away from `stream`; forget the
    // temporary wrapper so it doesn't close the fd on drop.
    std::mem::forget(borrowed);
    result
}

/// Holds four underlying dialers (TCP v4, TCP v6, UDP v4, UDP v6), each
/// sharing the composed control-hook chain and local bind configuration.
pub struct DefaultDialer {
    tcp_hooks: HookChain,
    udp_hooks: HookChain,
    udp_listener_hooks: HookChain,
    bind_v4: Option<SocketAddr>,
    bind_v6: Option<SocketAddr>,
    config: Config,
}

impl DefaultDialer {
    pub fn new(config: Config) -> Self {
        let tcp_hooks = build_hooks(&config, false);
        let udp_hooks = build_hooks(&config, false);
        let udp_listener_hooks = build_hooks(&config, true);
        let bind_v4 = config.bind_address4.map(|ip| SocketAddr::new(ip.into(), 0));
        let bind_v6 = config.bind_address6.map(|ip| SocketAddr::new(ip.into(), 0));

        Self { tcp_hooks, udp_hooks, udp_listener_hooks, bind_v4, bind_v6, config }
    }

    async fn dial_tcp(&self, addr: SocketAddr) -> io::Result<Box<dyn NdConn>> {
        let socket = socket_factory::tcp(&self.tcp_hooks, &addr)?;
        if let Some(bind) = self.local_bind_for(addr) {
            socket.bind(bind)?;
        }

        if self.config.tfo {
            let mut stream = TfoStream::new(socket, addr);
            // Trigger the handshake eagerly so a caller that only Reads
            // still gets a connection (degrades to connect-then-write).
            stream.handshake(&[]).await?;
            return Ok(Box::new(TfoConnAdapter(stream)));
        }

        let stream = socket.connect(addr).await?;
        apply_tcp_keepalive(&stream, &self.config)?;
        Ok(Box::new(PlainConnAdapter(stream)))
    }

    async fn dial_udp(&self, addr: SocketAddr) -> io::Result<Box<dyn NdConn>> {
        let bind = self.local_bind_for(addr).unwrap_or(match addr {
            SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        });

        let socket = socket2::Socket::new(socket2::Domain::for_address(bind), socket2::Type::DGRAM, None)?;
        if bind.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        {
            use std::os::fd::AsRawFd;
            let network = if addr.is_ipv4() { "udp4" } else { "udp6" };
            self.udp_hooks.apply(network, &addr.to_string(), socket.as_raw_fd())?;
        }
        socket.bind(&bind.into())?;
        socket.connect(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = tokio::net::UdpSocket::from_std(std_socket)?;
        Ok(Box::new(UdpConnAdapter(tokio_socket)))
    }

    fn local_bind_for(&self, target: SocketAddr) -> Option<SocketAddr> {
        match target {
            SocketAddr::V4(_) => self.bind_v4,
            SocketAddr::V6(_) => self.bind_v6,
        }
    }
}

impl net_descriptor::Dialer for DefaultDialer {
    fn dial_context<'a>(&'a self, network: Network, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<Box<dyn NdConn>>> {
        Box::pin(async move {
            if !endpoint.is_dialable() {
                return Err(Error::NotDialable.into());
            }
            if endpoint.needs_resolve() {
                return Err(Error::AddressNotResolved.into());
            }
            let ip = endpoint.host().as_ip().expect("IP-only: needs_resolve() already checked");
            if !network.matches_ip(ip) {
                return Err(Error::NoAddressToDial.into());
            }

            let addr = SocketAddr::new(ip, endpoint.port());
            match network.protocol {
                Protocol::Tcp => self.dial_tcp(addr).await,
                Protocol::Udp => self.dial_udp(addr).await,
            }
        })
    }

    fn listen_packet<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<Box<dyn NdPacketConn>>> {
        Box::pin(async move {
            let ip = endpoint.host().as_ip();

            // Explicit v6 takes the v6 path; an unspecified/absent v4 bind
            // is equivalent to "any v4" (§4.2 `ListenPacket`).
            let bind = match ip {
                Some(std::net::IpAddr::V6(v6)) => SocketAddr::new(v6.into(), 0),
                _ => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            };

            let socket = socket2::Socket::new(socket2::Domain::for_address(bind), socket2::Type::DGRAM, None)?;
            if bind.is_ipv6() {
                socket.set_only_v6(true)?;
            }
            socket.set_nonblocking(true)?;
            {
                use std::os::fd::AsRawFd;
                let network = if bind.is_ipv4() { "udp4" } else { "udp6" };
                self.udp_listener_hooks.apply(network, &bind.to_string(), socket.as_raw_fd())?;
            }
            socket.bind(&bind.into())?;

            let std_socket: std::net::UdpSocket = socket.into();
            let tokio_socket = tokio::net::UdpSocket::from_std(std_socket)?;
            Ok(Box::new(UdpPacketConn(tokio_socket)) as Box<dyn NdPacketConn>)
        })
    }
}

impl net_descriptor::ParallelDialer for DefaultDialer {
    fn dial_parallel<'a>(
        &'a self,
        network: Network,
        addrs: &'a [std::net::IpAddr],
        port: u16,
        strategy: net_descriptor::Strategy,
    ) -> BoxFuture<'a, io::Result<Box<dyn NdConn>>> {
        Box::pin(async move { happy_eyeballs::dial_parallel(self, network, addrs, port, strategy, happy_eyeballs::DEFAULT_FALLBACK_DELAY).await })
    }
}

struct PlainConnAdapter(socket_factory::TcpStream);

impl tokio::io::AsyncRead for PlainConnAdapter {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for PlainConnAdapter {
    fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl NdConn for PlainConnAdapter {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }
}

struct TfoConnAdapter(TfoStream);

impl tokio::io::AsyncRead for TfoConnAdapter {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for TfoConnAdapter {
    fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl NdConn for TfoConnAdapter {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }
}

struct UdpConnAdapter(tokio::net::UdpSocket);

impl tokio::io::AsyncRead for UdpConnAdapter {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        self.get_mut().0.poll_recv(cx, buf)
    }
}

impl tokio::io::AsyncWrite for UdpConnAdapter {
    fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &[u8]) -> std::task::Poll<io::Result<usize>> {
        self.get_mut().0.poll_send(cx, buf)
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

impl NdConn for UdpConnAdapter {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }
}

struct UdpPacketConn(tokio::net::UdpSocket);

impl NdPacketConn for UdpPacketConn {
    fn send_to<'a>(&'a self, buf: &'a [u8], dst: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(self.0.send_to(buf, dst))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        Box::pin(self.0.recv_from(buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use net_descriptor::Dialer as _;

    #[tokio::test]
    async fn dial_context_rejects_fqdn() {
        let dialer = DefaultDialer::new(Config::default());
        let endpoint = Endpoint::from_fqdn("example.com", 80);

        let err = dialer.dial_context(Network::TCP, &endpoint).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn dial_context_rejects_family_mismatch() {
        let dialer = DefaultDialer::new(Config::default());
        let endpoint = Endpoint::from_ip(std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 80);

        let err = dialer.dial_context(Network::TCP6, &endpoint).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn dial_context_connects_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let dialer = DefaultDialer::new(Config::default());
        let endpoint = Endpoint::from_ip(addr.ip(), addr.port());

        let conn = dialer.dial_context(Network::TCP, &endpoint).await.unwrap();
        assert_eq!(conn.peer_addr().unwrap(), addr);

        accept.await.unwrap();
    }
}
