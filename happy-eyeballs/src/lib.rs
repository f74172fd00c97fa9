//! Happy-eyeballs (RFC 6555) parallel dialing over a generic [`Dialer`],
//! per §4.3: partition addresses by family, dial the preferred family first,
//! start the other family after a fallback delay (or immediately once the
//! primary fails), and return whichever connects first.

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use net_address::Endpoint;
use net_descriptor::{Conn, Dialer, Network, Strategy, Version};

/// §6 default: 300ms.
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no address to dial")]
    NoAddressToDial,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::other(e)
    }
}

type ConnFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Box<dyn Conn>>> + 'a>>;

/// Dials `addrs` one at a time in order, returning the first success and
/// otherwise the last error.
pub async fn dial_serial<D>(dialer: &D, network: Network, addrs: &[IpAddr], port: u16) -> io::Result<Box<dyn Conn>>
where
    D: Dialer + ?Sized,
{
    if addrs.is_empty() {
        return Err(Error::NoAddressToDial.into());
    }

    let mut last_err = None;
    for addr in addrs {
        let endpoint = Endpoint::from_ip(*addr, port);
        match dialer.dial_context(network, &endpoint).await {
            Ok(conn) => return Ok(conn),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.expect("addrs is non-empty, so the loop ran at least once"))
}

/// Races the preferred family against the other, starting the second after
/// `fallback_delay` (or immediately once the first family's attempt fails).
/// Degenerates to [`dial_serial`] when only one family is present, when the
/// network is already single-family, or when the strategy forces one family.
pub async fn dial_parallel<D>(
    dialer: &D,
    network: Network,
    addrs: &[IpAddr],
    port: u16,
    strategy: Strategy,
    fallback_delay: Duration,
) -> io::Result<Box<dyn Conn>>
where
    D: Dialer + ?Sized,
{
    let fallback_delay = if fallback_delay.is_zero() { DEFAULT_FALLBACK_DELAY } else { fallback_delay };

    let addrs4: Vec<IpAddr> = addrs.iter().copied().filter(|a| a.is_ipv4()).collect();
    let addrs6: Vec<IpAddr> = addrs.iter().copied().filter(|a| a.is_ipv6()).collect();

    if addrs4.is_empty() || addrs6.is_empty() {
        return dial_serial(dialer, network, addrs, port).await;
    }
    if network.version == Version::V4 || strategy == Strategy::Ipv4Only {
        return dial_serial(dialer, network, &addrs4, port).await;
    }
    if network.version == Version::V6 || strategy == Strategy::Ipv6Only {
        return dial_serial(dialer, network, &addrs6, port).await;
    }

    let (primaries, fallbacks) = if strategy.prefers_v6() { (&addrs6, &addrs4) } else { (&addrs4, &addrs6) };

    let mut primary_fut: ConnFuture<'_> = Box::pin(dial_serial(dialer, network, primaries, port));
    let mut fallback_fut: Option<ConnFuture<'_>> = None;
    let mut sleep = Box::pin(tokio::time::sleep(fallback_delay));

    let mut primary_result: Option<io::Result<Box<dyn Conn>>> = None;
    let mut fallback_result: Option<io::Result<Box<dyn Conn>>> = None;

    std::future::poll_fn(move |cx| {
        if primary_result.is_none() {
            if let Poll::Ready(res) = primary_fut.as_mut().poll(cx) {
                if res.is_ok() {
                    return Poll::Ready(res);
                }
                // A failed primary starts the fallback racer right away.
                sleep.as_mut().reset(tokio::time::Instant::now());
                primary_result = Some(res);
            }
        }

        if fallback_fut.is_none() && sleep.as_mut().poll(cx).is_ready() {
            fallback_fut = Some(Box::pin(dial_serial(dialer, network, fallbacks, port)));
        }

        if let Some(fut) = fallback_fut.as_mut() {
            if fallback_result.is_none() {
                if let Poll::Ready(res) = fut.as_mut().poll(cx) {
                    if res.is_ok() {
                        return Poll::Ready(res);
                    }
                    fallback_result = Some(res);
                }
            }
        }

        if primary_result.is_some() && fallback_result.is_some() {
            return Poll::Ready(primary_result.take().expect("just checked is_some"));
        }

        Poll::Pending
    })
    .await
}
