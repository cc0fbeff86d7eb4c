//! Default transport: a TCP stream, optionally wrapped in TLS.
//!
//! [`WebSocket::connect`](crate::WebSocket::connect) opens one of these from the URL scheme.
//! Any other `AsyncRead + AsyncWrite` stream can be used through
//! [`WebSocket::handshake`](crate::WebSocket::handshake).
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{
    client::TlsStream,
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};

use crate::{handshake::Target, Result};

/// A stream that is either plain TCP or TLS over TCP.
#[pin_project(project = MaybeTlsStreamProj)]
pub enum MaybeTlsStream {
    /// `ws://` connection.
    Plain(#[pin] TcpStream),
    /// `wss://` connection.
    Tls(#[pin] TlsStream<TcpStream>),
}

impl MaybeTlsStream {
    /// Opens the TCP connection for `target` and performs the TLS handshake when needed.
    ///
    /// `tcp_address` overrides DNS resolution of the host.
    pub(crate) async fn connect(
        target: &Target,
        tcp_address: Option<SocketAddr>,
        connector: Option<TlsConnector>,
        no_delay: bool,
    ) -> Result<Self> {
        let tcp_stream = match tcp_address {
            Some(address) => TcpStream::connect(address).await?,
            None => TcpStream::connect((target.host.as_str(), target.port)).await?,
        };

        let _ = tcp_stream.set_nodelay(no_delay);

        if !target.tls {
            return Ok(Self::Plain(tcp_stream));
        }

        let connector = match connector {
            Some(connector) => connector,
            None => tls_connector()?,
        };

        let domain = ServerName::try_from(target.host.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname"))?;

        #[cfg(feature = "logging")]
        log::debug!("starting TLS handshake with {}", target.host);

        Ok(Self::Tls(connector.connect(domain, tcp_stream).await?))
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain(stream) => stream.poll_read(cx, buf),
            MaybeTlsStreamProj::Tls(stream) => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsStreamProj::Plain(stream) => stream.poll_write(cx, buf),
            MaybeTlsStreamProj::Tls(stream) => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain(stream) => stream.poll_flush(cx),
            MaybeTlsStreamProj::Tls(stream) => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain(stream) => stream.poll_shutdown(cx),
            MaybeTlsStreamProj::Tls(stream) => stream.poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsStreamProj::Plain(stream) => stream.poll_write_vectored(cx, bufs),
            MaybeTlsStreamProj::Tls(stream) => stream.poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(stream) => stream.is_write_vectored(),
            Self::Tls(stream) => stream.is_write_vectored(),
        }
    }
}

/// Creates a TLS connector trusting the webpki root certificates.
///
/// If no process-wide crypto provider has been installed,
/// [*ring*](https://github.com/briansmith/ring) is used.
pub fn tls_connector() -> Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Remembers when the wrapped stream last produced bytes.
///
/// The read timeout is measured from this instant, so a frame trickling in slowly keeps the
/// connection alive as long as every gap stays below the timeout.
#[pin_project]
pub(crate) struct ReadActivity<S> {
    #[pin]
    inner: S,
    last_read: tokio::time::Instant,
}

impl<S> ReadActivity<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            last_read: tokio::time::Instant::now(),
        }
    }

    /// When the last non-empty read completed.
    pub(crate) fn last_read(&self) -> tokio::time::Instant {
        self.last_read
    }
}

impl<S: AsyncRead> AsyncRead for ReadActivity<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let filled = buf.filled().len();
        let poll = this.inner.poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > filled {
            *this.last_read = tokio::time::Instant::now();
        }
        poll
    }
}

impl<S: AsyncWrite> AsyncWrite for ReadActivity<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_read_activity_moves_on_data_only() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = ReadActivity::new(client);
        let opened = stream.last_read();

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"abc").await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        let after_data = stream.last_read();
        assert!(after_data >= opened + Duration::from_millis(20));

        drop(server);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.last_read(), after_data);
    }
}
