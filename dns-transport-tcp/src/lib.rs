//! DNS-over-TCP transport (§4.7): one connection per exchange, a 2-byte
//! big-endian length prefix on both the query and the reply.

use std::io;
use std::sync::Arc;

use dns_types::{BoxFuture, Query, Response, Transport};
use net_address::Endpoint;
use net_descriptor::{Dialer, Network};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Messages under this length cannot carry a header plus a question, so a
/// reply this short is malformed regardless of what it claims to contain.
const MIN_MESSAGE_LEN: u16 = 12;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Dns(#[from] dns_types::Error),
    #[error("reply length {0} is shorter than a DNS header")]
    ShortReply(u16),
    #[error("message of {0} bytes does not fit a 16-bit length prefix")]
    MessageTooLong(usize),
}

impl From<Error> for dns_types::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => dns_types::Error::Io(io),
            Error::Dns(e) => e,
            Error::ShortReply(_) | Error::MessageTooLong(_) => {
                dns_types::Error::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            }
        }
    }
}

/// DNS-over-TCP transport to a single upstream server. A fresh TCP
/// connection is dialed for every exchange and closed afterwards; there is
/// no connection pooling here (that lives one layer up, in
/// `local-resolver`'s per-server transport pool).
pub struct TcpTransport {
    server: Endpoint,
    dialer: Arc<dyn Dialer>,
}

impl TcpTransport {
    /// `server.port() == 0` defaults to port 53, mirroring
    /// `NewTCPTransport`.
    pub fn new(server: Endpoint, dialer: Arc<dyn Dialer>) -> Self {
        let server = if server.port() == 0 { Endpoint::new(server.host().clone(), 53) } else { server };
        Self { server, dialer }
    }

    pub async fn exchange(&self, query: &Query) -> Result<Response, Error> {
        let mut conn = self.dialer.dial_context(Network::TCP, &self.server).await?;

        write_message(&mut conn, query.as_bytes()).await?;
        let reply = read_message(&mut conn).await?;

        Ok(Response::parse(&reply)?)
    }

    /// Forwards an already-framed message verbatim, without parsing the
    /// reply into a [`Response`]. Used for multi-question requests, which
    /// don't fit `Query`'s single-question invariant (§4.4).
    pub async fn exchange_raw(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let mut conn = self.dialer.dial_context(Network::TCP, &self.server).await?;

        write_message(&mut conn, message).await?;
        read_message(&mut conn).await
    }
}

impl Transport for TcpTransport {
    fn exchange<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Response, dns_types::Error>> {
        Box::pin(async move { self.exchange(query).await.map_err(Into::into) })
    }

    fn exchange_raw<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, dns_types::Error>> {
        Box::pin(async move { self.exchange_raw(message).await.map_err(Into::into) })
    }
}

/// Writes a 2-byte big-endian length prefix followed by `message`.
///
/// Rust futures are cancel-safe on drop: wrapping a call to this function
/// (or [`read_message`]) in `tokio::time::timeout` and letting it expire
/// drops the in-flight I/O future, which drops `conn` and closes the
/// socket — the same effect as `tcp.go`'s context-cancels-close side
/// goroutine, without needing one.
async fn write_message(conn: &mut (impl tokio::io::AsyncWrite + Unpin), message: &[u8]) -> Result<(), Error> {
    let len: u16 = message.len().try_into().map_err(|_| Error::MessageTooLong(message.len()))?;

    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);

    conn.write_all(&framed).await?;
    Ok(())
}

async fn read_message(conn: &mut (impl tokio::io::AsyncRead + Unpin)) -> Result<Vec<u8>, Error> {
    let len = conn.read_u16().await?;
    if len < MIN_MESSAGE_LEN {
        return Err(Error::ShortReply(len));
    }

    let mut buf = vec![0u8; len as usize];
    conn.read_exact(&mut buf).await?;
    Ok(buf)
}
