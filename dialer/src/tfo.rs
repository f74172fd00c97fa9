//! TFO connection state machine (§4.2). The platform TCP Fast Open syscall
//! (`MSG_FASTOPEN`/`connectx`) is an external collaborator out of this
//! workspace's scope; this models the `pending -> connecting -> {established,
//! failed, closed}` contract and falls back to a plain connect-then-write
//! when establishing, which loses the one-RTT saving but preserves the
//! state machine callers depend on.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use socket_factory::{TcpSocket, TcpStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum State {
    Pending(TcpSocket),
    Connecting(ConnectFuture),
    Established(TcpStream),
    Failed,
    Closed,
}

/// A TCP stream whose connect is deferred until the first write.
/// `needs_handshake()` is `true` exactly while `Pending`.
pub struct TfoStream {
    state: State,
    addr: SocketAddr,
    read_waker: Option<Waker>,
}

const ZERO_ENDPOINT: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

impl TfoStream {
    pub fn new(socket: TcpSocket, addr: SocketAddr) -> Self {
        Self { state: State::Pending(socket), addr, read_waker: None }
    }

    pub fn needs_handshake(&self) -> bool {
        matches!(self.state, State::Pending(_))
    }

    /// Alias for `Write(b)` per §4.2's contract.
    pub async fn handshake(&mut self, buf: &[u8]) -> io::Result<usize> {
        use tokio::io::AsyncWriteExt;
        self.write(buf).await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.state {
            State::Established(stream) => stream.local_addr(),
            _ => Ok(ZERO_ENDPOINT),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.state {
            State::Established(stream) => stream.peer_addr(),
            _ => Ok(ZERO_ENDPOINT),
        }
    }

    fn wake_pending_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

impl AsyncWrite for TfoStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            match &mut self.state {
                State::Pending(_) => {
                    let State::Pending(socket) = std::mem::replace(&mut self.state, State::Failed) else {
                        unreachable!("just matched Pending")
                    };
                    let addr = self.addr;
                    self.state = State::Connecting(Box::pin(async move { socket.connect(addr).await }));
                }
                State::Connecting(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(stream)) => {
                        self.state = State::Established(stream);
                        self.wake_pending_reader();
                    }
                    Poll::Ready(Err(e)) => {
                        self.state = State::Failed;
                        self.wake_pending_reader();
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                State::Established(stream) => return Pin::new(stream).poll_write(cx, buf),
                State::Failed => return Poll::Ready(Err(io::Error::other("TFO connection failed"))),
                State::Closed => return Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected))),
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Established(stream) => Pin::new(stream).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = match &mut self.state {
            State::Established(stream) => Pin::new(stream).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        };
        self.state = State::Closed;
        result
    }
}

impl AsyncRead for TfoStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Established(stream) => Pin::new(stream).poll_read(cx, buf),
            State::Failed => Poll::Ready(Err(io::Error::other("TFO connection failed"))),
            State::Closed => Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected))),
            State::Pending(_) | State::Connecting(_) => {
                self.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn needs_handshake_until_first_write() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut sock, &mut buf).await.unwrap();
            buf
        });

        let socket = socket_factory::tcp(&socket_control::HookChain::new(), &addr).unwrap();
        let mut stream = TfoStream::new(socket, addr);
        assert!(stream.needs_handshake());

        stream.handshake(b"hello").await.unwrap();
        assert!(!stream.needs_handshake());

        let received = accept.await.unwrap();
        assert_eq!(&received, b"hello");
    }
}
