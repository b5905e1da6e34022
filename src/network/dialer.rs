//! Transport dialers shared by every protocol scanner

use super::context::{ContextStream, ScanContext};
use super::tls::{TlsLog, TlsWrapper};
use super::ScanTarget;
use crate::config::TlsConfig;
use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_openssl::SslStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
}

/// How a scanner wants its connections made. Built once at scanner init.
#[derive(Debug, Clone, Default)]
pub struct DialerGroupConfig {
    pub transport: Transport,
    /// Expose the raw L4 dialer to the scanner (it layers its own framing)
    pub need_separate_l4_dialer: bool,
    pub tls_enabled: bool,
    pub tls: TlsConfig,
    pub connect_timeout: Option<Duration>,
    pub source_address: Option<IpAddr>,
}

/// Plain TCP dialer
#[derive(Debug, Clone, Default)]
pub struct L4Dialer {
    connect_timeout: Option<Duration>,
    source_address: Option<IpAddr>,
}

impl L4Dialer {
    pub fn new(connect_timeout: Option<Duration>, source_address: Option<IpAddr>) -> Self {
        Self {
            connect_timeout,
            source_address,
        }
    }

    pub async fn dial(&self, ctx: &ScanContext, target: &ScanTarget) -> ScanResult<Connection> {
        let stream = self.connect(ctx, target).await?;
        Ok(Connection::plain(stream))
    }

    /// Open a TCP stream guarded by `ctx`
    pub async fn connect(
        &self,
        ctx: &ScanContext,
        target: &ScanTarget,
    ) -> ScanResult<ContextStream<TcpStream>> {
        let attempt = async {
            match self.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, self.connect_tcp(target))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                    }),
                None => self.connect_tcp(target).await,
            }
        };

        let stream = ctx.run(attempt).await?.map_err(|source| ScanError::Dial {
            target: target.to_string(),
            source,
        })?;

        log::debug!("Connected to {}", target);
        Ok(ctx.guard(stream))
    }

    async fn connect_tcp(&self, target: &ScanTarget) -> io::Result<TcpStream> {
        let addr = resolve(target).await?;
        let stream = match self.source_address {
            Some(source) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(SocketAddr::new(source, 0))?;
                socket.connect(addr).await?
            }
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

async fn resolve(target: &ScanTarget) -> io::Result<SocketAddr> {
    if let Some(ip) = target.ip {
        return Ok(SocketAddr::new(ip, target.port));
    }
    tokio::net::lookup_host((target.host.as_str(), target.port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {}", target.host),
            )
        })
}

/// The live dialers for one scanner, shared read-only across scans
#[derive(Debug)]
pub struct DialerGroup {
    pub dialer: L4Dialer,
    pub l4_dialer: Option<L4Dialer>,
    pub tls_wrapper: Option<TlsWrapper>,
}

impl DialerGroup {
    pub fn new(config: &DialerGroupConfig) -> ScanResult<Self> {
        let dialer = L4Dialer::new(config.connect_timeout, config.source_address);
        let tls_wrapper = if config.tls_enabled {
            Some(TlsWrapper::new(&config.tls)?)
        } else {
            None
        };

        Ok(Self {
            l4_dialer: config.need_separate_l4_dialer.then(|| dialer.clone()),
            dialer,
            tls_wrapper,
        })
    }

    pub fn l4_dialer(&self) -> Option<&L4Dialer> {
        self.l4_dialer.as_ref()
    }

    pub fn tls_wrapper(&self) -> Option<&TlsWrapper> {
        self.tls_wrapper.as_ref()
    }

    /// Dial `target`, running a TLS handshake first when the group has TLS enabled
    pub async fn dial(&self, ctx: &ScanContext, target: &ScanTarget) -> ScanResult<Connection> {
        let stream = self.dialer.connect(ctx, target).await?;

        let Some(wrapper) = &self.tls_wrapper else {
            return Ok(Connection::plain(stream));
        };

        let attempt = wrapper.handshake(stream, target).await?;
        if attempt.is_complete() {
            return Ok(Connection {
                stream: ConnectionStream::Tls(Box::new(attempt.stream)),
                tls_log: Some(attempt.log),
            });
        }

        let source = attempt
            .error
            .unwrap_or_else(|| ScanError::Tls("handshake did not complete".to_string()));
        Err(ScanError::TlsHandshake {
            target: target.to_string(),
            log: Box::new(attempt.log),
            source: Box::new(source),
        })
    }
}

enum ConnectionStream {
    Plain(ContextStream<TcpStream>),
    Tls(Box<SslStream<ContextStream<TcpStream>>>),
}

/// A dialed connection, owned by the scan that opened it
pub struct Connection {
    stream: ConnectionStream,
    tls_log: Option<TlsLog>,
}

impl Connection {
    fn plain(stream: ContextStream<TcpStream>) -> Self {
        Self {
            stream: ConnectionStream::Plain(stream),
            tls_log: None,
        }
    }

    /// Handshake log, present when the group wrapped this connection in TLS
    pub fn tls_log(&self) -> Option<&TlsLog> {
        self.tls_log.as_ref()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.stream {
            ConnectionStream::Plain(s) => s.get_ref().peer_addr(),
            ConnectionStream::Tls(s) => s.get_ref().get_ref().peer_addr(),
        }
    }

    /// Graceful shutdown; failures are only worth a debug record
    pub async fn close(mut self) {
        if let Err(e) = self.shutdown().await {
            log::debug!("Error closing connection: {}", e);
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnectionStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ConnectionStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            ConnectionStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ConnectionStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnectionStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ConnectionStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ConnectionStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ConnectionStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_l4_dialer_only_when_requested() {
        let group = DialerGroup::new(&DialerGroupConfig::default()).unwrap();
        assert!(group.l4_dialer().is_none());
        assert!(group.tls_wrapper().is_none());

        let group = DialerGroup::new(&DialerGroupConfig {
            need_separate_l4_dialer: true,
            tls_enabled: true,
            ..DialerGroupConfig::default()
        })
        .unwrap();
        assert!(group.l4_dialer().is_some());
        assert!(group.tls_wrapper().is_some());
    }

    #[tokio::test]
    async fn test_dial_plain_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let group = DialerGroup::new(&DialerGroupConfig::default()).unwrap();
        let ctx = ScanContext::with_timeout(Duration::from_secs(5));
        let mut conn = group.dial(&ctx, &ScanTarget::from_addr(addr)).await.unwrap();
        assert!(conn.tls_log().is_none());
        assert_eq!(conn.peer_addr().unwrap(), addr);

        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        conn.close().await;
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = L4Dialer::default();
        let ctx = ScanContext::with_timeout(Duration::from_secs(5));
        let err = dialer
            .dial(&ctx, &ScanTarget::from_addr(addr))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScanError::Dial { .. }));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
    }
}
