//! Socket-control hooks: composable `(network, address, fd) -> io::Result<()>`
//! callbacks applied after socket creation, before connect/listen/bind.

use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("setsockopt {0} failed: {1}")]
    SetSockOpt(&'static str, #[source] io::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::other(e)
    }
}

/// A single socket-setup step. Hooks compose left-to-right; the first
/// failure aborts the chain (§4.1).
pub trait Hook: Send + Sync {
    fn apply(&self, network: &str, address: &str, fd: RawFd) -> io::Result<()>;
}

impl<F> Hook for F
where
    F: Fn(&str, &str, RawFd) -> io::Result<()> + Send + Sync,
{
    fn apply(&self, network: &str, address: &str, fd: RawFd) -> io::Result<()> {
        self(network, address, fd)
    }
}

#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn Hook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn apply(&self, network: &str, address: &str, fd: RawFd) -> io::Result<()> {
        for hook in &self.hooks {
            hook.apply(network, address, fd)?;
        }
        Ok(())
    }
}

/// Process-wide "SO_BINDTOIFINDEX unsupported" latch. Set once on the first
/// `ENOPROTOOPT`/`EINVAL`, never cleared — every later call on this process
/// goes straight to the `SO_BINDTODEVICE` fallback (§9 design note).
static BINDTOIFINDEX_DISABLED: AtomicBool = AtomicBool::new(false);

#[cfg(target_os = "linux")]
const SO_BINDTOIFINDEX: libc::c_int = 62;

fn is_virtual_interface(addr: IpAddr) -> bool {
    let is_interface_local_multicast = match addr {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => v6.multicast_scope() == Some(std::net::Ipv6MulticastScope::InterfaceLocal),
    };
    addr.is_loopback() || addr.is_multicast() || is_interface_local_multicast
}

/// Binds the socket to a named/indexed interface. No-ops for virtual
/// destinations (loopback, multicast, interface-local multicast) per §4.1.
pub fn bind_to_interface(interface_name: Option<String>, interface_index: Option<u32>) -> impl Hook {
    move |_network: &str, address: &str, fd: RawFd| -> io::Result<()> {
        if interface_name.is_none() && interface_index.is_none() {
            return Err(Error::InterfaceNotFound(String::new()).into());
        }

        if let Ok(addr) = address.parse::<std::net::SocketAddr>() {
            if is_virtual_interface(addr.ip()) {
                return Ok(());
            }
        }

        bind_to_interface_platform(fd, interface_name.as_deref(), interface_index)
    }
}

#[cfg(target_os = "linux")]
fn bind_to_interface_platform(fd: RawFd, interface_name: Option<&str>, interface_index: Option<u32>) -> io::Result<()> {
    use std::ffi::CString;

    if !BINDTOIFINDEX_DISABLED.load(Ordering::Relaxed) {
        if let Some(idx) = interface_index {
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    SO_BINDTOIFINDEX,
                    (&idx as *const u32).cast(),
                    std::mem::size_of::<u32>() as libc::socklen_t,
                )
            };
            if rc == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOPROTOOPT) | Some(libc::EINVAL) => {
                    BINDTOIFINDEX_DISABLED.store(true, Ordering::Relaxed);
                }
                _ => return Err(Error::SetSockOpt("SO_BINDTOIFINDEX", err).into()),
            }
        }
    }

    let name = interface_name.ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
    let c_name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            c_name.as_ptr().cast(),
            c_name.as_bytes_with_nul().len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::SetSockOpt("SO_BINDTODEVICE", io::Error::last_os_error()).into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_interface_platform(_fd: RawFd, _interface_name: Option<&str>, _interface_index: Option<u32>) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "bind-to-interface is only implemented on Linux"))
}

fn setsockopt_bool(fd: RawFd, level: libc::c_int, name: libc::c_int, opt_name: &'static str) -> io::Result<()> {
    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::SetSockOpt(opt_name, io::Error::last_os_error()).into());
    }
    Ok(())
}

pub fn reuse_address() -> impl Hook {
    |_network: &str, _address: &str, fd: RawFd| setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, "SO_REUSEADDR")
}

pub fn reuse_port() -> impl Hook {
    |_network: &str, _address: &str, fd: RawFd| -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
        {
            setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, "SO_REUSEPORT")
        }
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd")))]
        {
            let _ = fd;
            Ok(())
        }
    }
}

/// Sets the routing fwmark (`SO_MARK`), Linux-only.
pub fn fwmark(mark: u32) -> impl Hook {
    move |_network: &str, _address: &str, fd: RawFd| -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_MARK,
                    (&mark as *const u32).cast(),
                    std::mem::size_of::<u32>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(Error::SetSockOpt("SO_MARK", io::Error::last_os_error()).into());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (fd, mark);
            Ok(())
        }
    }
}

/// Disables UDP fragmentation (`IP(V6)_MTU_DISCOVER=DO`); no-op for TCP.
pub fn disable_udp_fragmentation() -> impl Hook {
    |network: &str, _address: &str, fd: RawFd| -> io::Result<()> {
        if !network.starts_with("udp") {
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        {
            let is_v4 = network != "udp6";
            let is_v6 = network != "udp4";

            if is_v4 {
                setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO, "IP_MTU_DISCOVER")?;
            }
            if is_v6 {
                setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER, libc::IP_PMTUDISC_DO, "IPV6_MTU_DISCOVER")?;
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = fd;
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int, opt_name: &'static str) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::SetSockOpt(opt_name, io::Error::last_os_error()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn loopback_and_multicast_are_virtual() {
        assert!(is_virtual_interface(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_virtual_interface(IpAddr::V4(Ipv4Addr::new(224, 0, 0, 1))));
        assert!(!is_virtual_interface(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))));
        assert!(!is_virtual_interface(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1))));
    }

    #[test]
    fn chain_stops_at_first_failure() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let chain = HookChain::new()
            .push(move |_: &str, _: &str, _: RawFd| -> io::Result<()> {
                calls2.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::other("boom"))
            })
            .push(move |_: &str, _: &str, _: RawFd| -> io::Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        assert!(chain.apply("tcp", "192.0.2.1:80", 0).is_err());
    }
}
