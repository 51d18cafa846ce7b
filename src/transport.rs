//! Byte-stream transport to one endpoint: TCP, Unix domain socket, or an
//! arbitrary wrapped stream (TLS). This crate does not depend on a TLS
//! implementation — an embedder hands in an already-negotiated
//! `AsyncRead + AsyncWrite` stream and `Transport::Tls` carries it as a
//! trait object, matching the non-goal that keeps TLS configuration out of
//! this core.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use crate::error::{RedisCoreError, Result};

/// Default size of the internal receive buffer (§4.2).
pub const DEFAULT_RECV_BUFFER: usize = 64 * 1024;

/// Bound required of a wrapped (e.g. TLS) stream handed to [`Transport::Tls`].
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

/// The outcome of one `recv` call.
#[derive(Debug)]
pub enum RecvOutcome {
    /// `n` new bytes were appended to the caller's buffer.
    Data(usize),
    /// The peer closed the stream cleanly (zero-length read).
    Eof,
    /// The receive timeout elapsed with nothing to report; the transport is
    /// otherwise still healthy.
    TimedOut,
}

/// One live byte-stream connection to a Redis endpoint.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<dyn AsyncDuplex>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp(s) => f.debug_tuple("Tcp").field(s).finish(),
            Transport::Unix(s) => f.debug_tuple("Unix").field(s).finish(),
            Transport::Tls(_) => f.debug_tuple("Tls").field(&"<dyn AsyncDuplex>").finish(),
        }
    }
}

/// Per-transport TCP tuning knobs (§6 `tcp_nodelay`/`tcp_keepalive`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOptions {
    pub nodelay: bool,
    pub keepalive: Option<Duration>,
}

impl Transport {
    /// Opens a TCP connection, applying `connect_timeout` and the requested
    /// socket options. Connect timeout is distinct from the per-receive
    /// timeout used later on `recv`.
    pub async fn connect_tcp(addr: SocketAddr, connect_timeout: Option<Duration>, opts: TcpOptions) -> Result<Self> {
        let connect = TcpStream::connect(addr);
        let stream = match connect_timeout {
            Some(d) => tokio::time::timeout(d, connect)
                .await
                .map_err(|_| RedisCoreError::communication(Some(addr), std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))??,
            None => connect.await?,
        };
        if opts.nodelay {
            stream.set_nodelay(true)?;
        }
        if let Some(keepalive) = opts.keepalive {
            apply_tcp_keepalive(&stream, keepalive);
        }
        Ok(Transport::Tcp(stream))
    }

    pub async fn connect_unix(path: impl AsRef<std::path::Path>, connect_timeout: Option<Duration>) -> Result<Self> {
        let connect = UnixStream::connect(path.as_ref().to_owned());
        let stream = match connect_timeout {
            Some(d) => tokio::time::timeout(d, connect)
                .await
                .map_err(|_| RedisCoreError::communication(None, std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))??,
            None => connect.await?,
        };
        Ok(Transport::Unix(stream))
    }

    /// Wraps an already-established duplex stream (e.g. a negotiated TLS
    /// session) as a transport.
    pub fn from_wrapped(stream: Box<dyn AsyncDuplex>) -> Self {
        Transport::Tls(stream)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            Transport::Tcp(s) => s.peer_addr().ok(),
            Transport::Unix(_) => None,
            Transport::Tls(_) => None,
        }
    }

    /// Writes every chunk in order and flushes once at the end — the
    /// encoder already produced chunk boundaries that make sense to
    /// coalesce at this layer's discretion, so a single flush is enough.
    pub async fn send(&mut self, chunks: &[bytes::Bytes]) -> Result<()> {
        let peer = self.peer();
        for chunk in chunks {
            self.write_all(chunk).await.map_err(|e| RedisCoreError::communication(peer, e))?;
        }
        self.flush().await.map_err(|e| RedisCoreError::communication(peer, e))?;
        Ok(())
    }

    /// Reads whatever is available (up to the internal buffer growth) into
    /// `buf`, honoring an optional per-call timeout.
    pub async fn recv(&mut self, buf: &mut BytesMut, timeout: Option<Duration>) -> Result<RecvOutcome> {
        let peer = self.peer();
        let read = self.read_buf(buf);
        let result = match timeout {
            Some(d) => match tokio::time::timeout(d, read).await {
                Ok(r) => r,
                Err(_) => return Ok(RecvOutcome::TimedOut),
            },
            None => read.await,
        };
        match result {
            Ok(0) => Ok(RecvOutcome::Eof),
            Ok(n) => Ok(RecvOutcome::Data(n)),
            Err(e) => Err(RedisCoreError::communication(peer, e)),
        }
    }

    pub async fn close(mut self) {
        let _ = self.flush().await;
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(buf).await,
            Transport::Unix(s) => s.write_all(buf).await,
            Transport::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush().await,
            Transport::Unix(s) => s.flush().await,
            Transport::Tls(s) => s.flush().await,
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        if buf.capacity() - buf.len() < 4096 {
            buf.reserve(DEFAULT_RECV_BUFFER);
        }
        match self {
            Transport::Tcp(s) => s.read_buf(buf).await,
            Transport::Unix(s) => s.read_buf(buf).await,
            Transport::Tls(s) => s.read_buf(buf).await,
        }
    }
}

fn apply_tcp_keepalive(stream: &TcpStream, keepalive: Duration) {
    let sock_ref = socket2::SockRef::from(stream);
    let _ = sock_ref.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(keepalive));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_loopback_send_recv_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let mut transport = Transport::connect_tcp(addr, Some(Duration::from_secs(1)), TcpOptions::default()).await.unwrap();
        transport.send(&[bytes::Bytes::from_static(b"ping")]).await.unwrap();

        let mut buf = BytesMut::new();
        let outcome = transport.recv(&mut buf, Some(Duration::from_secs(1))).await.unwrap();
        assert!(matches!(outcome, RecvOutcome::Data(4)));
        assert_eq!(&buf[..], b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn recv_times_out_without_killing_transport() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(sock);
        });

        let mut transport = Transport::connect_tcp(addr, None, TcpOptions::default()).await.unwrap();
        let mut buf = BytesMut::new();
        let outcome = transport.recv(&mut buf, Some(Duration::from_millis(20))).await.unwrap();
        assert!(matches!(outcome, RecvOutcome::TimedOut));
    }
}
