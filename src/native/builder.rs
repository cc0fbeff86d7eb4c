use std::net::SocketAddr;

use tokio_rustls::TlsConnector;
use url::Url;

use crate::{handshake::Target, stream::MaybeTlsStream};

use super::{Options, WebSocket};

/// Configures a connection before starting it.
///
/// Created by [`WebSocket::connect`]. Nothing happens until [`WebSocketBuilder::start`] is
/// called.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use tidews::{DeflateOptions, Options, WebSocket};
///
/// # async fn example() -> tidews::Result<()> {
/// let ws = WebSocket::connect("wss://example.com/socket".parse()?)
///     .with_options(
///         Options::default()
///             .with_compression(DeflateOptions::default())
///             .with_read_timeout(Duration::from_secs(60)),
///     )
///     .start();
/// # Ok(())
/// # }
/// ```
pub struct WebSocketBuilder {
    url: Url,
    options: Options,
    connector: Option<TlsConnector>,
    tcp_address: Option<SocketAddr>,
}

impl WebSocketBuilder {
    pub(super) fn new(url: Url) -> Self {
        Self {
            url,
            options: Options::default(),
            connector: None,
            tcp_address: None,
        }
    }

    /// Sets the connection options.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Sets the TLS connector used for `wss://` URLs.
    ///
    /// Without one, a connector trusting the webpki root certificates is created, see
    /// [`tls_connector`](crate::stream::tls_connector).
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Connects to `address` instead of resolving the URL host.
    ///
    /// The URL host is still used for the `Host` header and TLS server name.
    pub fn with_tcp_address(mut self, address: SocketAddr) -> Self {
        self.tcp_address = Some(address);
        self
    }

    /// Spawns the connection task and returns the connection right away.
    ///
    /// Connecting and the handshake happen in the background. Their outcome is the first
    /// event: [`Event::Open`](crate::Event::Open) on success, otherwise
    /// [`Event::End`](crate::Event::End).
    pub fn start(self) -> WebSocket {
        let Self {
            url,
            options,
            connector,
            tcp_address,
        } = self;

        let no_delay = options.no_delay;
        let target = Target::from_url(&url);

        WebSocket::spawn(url, options, async move {
            let target = target?;
            MaybeTlsStream::connect(&target, tcp_address, connector, no_delay).await
        })
    }
}
