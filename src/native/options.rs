use std::time::Duration;

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit will be rejected to ensure memory safety
/// and prevent excessively large messages from impacting performance.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum allowed read buffer size, set to 2 MiB.
///
/// A fragmented or compressed message growing past this size closes the connection
/// with [`CloseCode::Size`](crate::close::CloseCode::Size).
pub const MAX_READ_BUFFER: usize = 2 * 1024 * 1024;

/// Default deadline for the TCP connect, TLS and HTTP upgrade together.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for the server's Close frame after sending ours.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Compression level used by the DEFLATE encoder.
pub type CompressionLevel = flate2::Compression;

/// Configuration options for a WebSocket connection.
///
/// `Options` allows users to set parameters that govern the behavior of a WebSocket connection,
/// including payload size limits, compression settings, handshake headers and deadlines.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use tidews::{Options, CompressionLevel};
///
/// let options = Options::default()
///     .with_compression_level(CompressionLevel::new(6))
///     .with_protocol("chat")
///     .with_read_timeout(Duration::from_secs(60));
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum allowed payload size for a single incoming frame, in bytes.
    ///
    /// Default: 1 MiB (1,048,576 bytes) as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Maximum size of a reassembled incoming message, after decompression.
    ///
    /// Bounds both fragmented messages and inflated compressed messages.
    ///
    /// Default: 2 MiB (2,097,152 bytes) as defined in [`MAX_READ_BUFFER`], or twice the
    /// configured `max_payload_read` value if that is set.
    pub max_read_buffer: Option<usize>,

    /// Compression settings for the WebSocket connection.
    ///
    /// When set, permessage-deflate is offered during the handshake.
    pub compression: Option<DeflateOptions>,

    /// Sub-protocols offered in `Sec-WebSocket-Protocol`, in order of preference.
    pub protocols: Vec<String>,

    /// Value of the `Origin` header. Derived from the URL when unset.
    pub origin: Option<String>,

    /// Extra headers added to the upgrade request.
    pub headers: Vec<(String, String)>,

    /// Deadline for TCP connect, TLS and the upgrade handshake together.
    ///
    /// Default: 30 seconds.
    pub connect_timeout: Duration,

    /// Longest wait for the next bytes from the server once open. Unbounded when `None`.
    pub read_timeout: Option<Duration>,

    /// Longest time a single write may take. Unbounded when `None`.
    pub write_timeout: Option<Duration>,

    /// Time granted to the server to answer our Close frame.
    ///
    /// Default: 5 seconds.
    pub close_timeout: Duration,

    /// Sets `TCP_NODELAY` on connections opened by [`WebSocket::connect`](crate::WebSocket::connect).
    ///
    /// Default: `true`.
    pub no_delay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: None,
            max_read_buffer: None,
            compression: None,
            protocols: Vec::new(),
            origin: None,
            headers: Vec::new(),
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: None,
            write_timeout: None,
            close_timeout: CLOSE_TIMEOUT,
            no_delay: true,
        }
    }
}

/// Configuration options for WebSocket message compression using the Deflate algorithm.
///
/// # Compression Level
/// Controls the tradeoff between compression ratio and CPU usage via the `level` field.
///
/// # Context Management
/// - **Context Takeover** (default): the DEFLATE window is kept between messages.
/// - **No Context Takeover**: the window is reset after each message, which lowers memory
///   usage and compression ratio.
///
/// # Window Size
/// `server_max_window_bits` asks the server to compress with a smaller window.
/// `client_max_window_bits` limits the window this client compresses with. Only 15 bits
/// can be produced without the `zlib` feature; when the server asks for a smaller client
/// window, outgoing messages are then sent uncompressed.
///
/// # Example
/// ```
/// use tidews::{DeflateOptions, CompressionLevel};
///
/// let opts = DeflateOptions {
///     level: CompressionLevel::default(),
///     server_no_context_takeover: true,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Default)]
pub struct DeflateOptions {
    /// Sets the compression level (0-9), balancing compression ratio against CPU usage.
    pub level: CompressionLevel,

    /// Window size (in bits) requested for messages the server compresses. Valid range: 8-15.
    pub server_max_window_bits: Option<u8>,

    /// Window size (in bits) offered for messages this client compresses. Valid range: 8-15.
    pub client_max_window_bits: Option<u8>,

    /// Requests that the server resets its compression context after each message.
    pub server_no_context_takeover: bool,

    /// Resets the client compression context after each message.
    pub client_no_context_takeover: bool,
}

impl Options {
    /// Enables compression and sets the compression level for outgoing messages.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;

        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Enables compression with the given settings.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression for the WebSocket connection.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the maximum allowed payload size for a single incoming frame.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a reassembled incoming message.
    pub fn with_max_read_buffer(self, size: usize) -> Self {
        Self {
            max_read_buffer: Some(size),
            ..self
        }
    }

    /// Requests a smaller compression window from the server. Enables compression.
    pub fn with_server_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_max_window_bits = Some(max_window_bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Offers a smaller compression window for outgoing messages. Enables compression.
    pub fn with_client_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_max_window_bits = Some(max_window_bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for server-side compression.
    ///
    /// This setting corresponds to the "server_no_context_takeover" extension parameter
    /// in the WebSocket protocol negotiation.
    pub fn server_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for client-side compression.
    ///
    /// This setting corresponds to the "client_no_context_takeover" extension parameter
    /// in the WebSocket protocol negotiation.
    pub fn client_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Adds a sub-protocol to offer in `Sec-WebSocket-Protocol`.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Overrides the `Origin` header.
    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..self
        }
    }

    /// Adds a header to the upgrade request.
    ///
    /// Names and values containing CR or LF fail the handshake with
    /// [`WebSocketError::InvalidHeader`](crate::WebSocketError::InvalidHeader).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the deadline for connecting and completing the handshake.
    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            ..self
        }
    }

    /// Fails the connection when the server stays silent for longer than `timeout`.
    pub fn with_read_timeout(self, timeout: Duration) -> Self {
        Self {
            read_timeout: Some(timeout),
            ..self
        }
    }

    /// Fails the connection when a write takes longer than `timeout`.
    pub fn with_write_timeout(self, timeout: Duration) -> Self {
        Self {
            write_timeout: Some(timeout),
            ..self
        }
    }

    /// Sets how long to wait for the server's Close frame after sending ours.
    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: timeout,
            ..self
        }
    }

    /// Sets `TCP_NODELAY` on the connection.
    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self { no_delay, ..self }
    }

    /// Effective per-frame payload limit.
    pub(crate) fn payload_limit(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    /// Effective limit for a reassembled message.
    pub(crate) fn read_buffer_limit(&self) -> usize {
        self.max_read_buffer.unwrap_or_else(|| {
            self.max_payload_read
                .map(|payload| payload.saturating_mul(2))
                .unwrap_or(MAX_READ_BUFFER)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.payload_limit(), MAX_PAYLOAD_READ);
        assert_eq!(options.read_buffer_limit(), MAX_READ_BUFFER);
        assert_eq!(options.connect_timeout, Duration::from_secs(30));
        assert_eq!(options.close_timeout, Duration::from_secs(5));
        assert!(options.no_delay);
        assert!(options.compression.is_none());
    }

    #[test]
    fn test_read_buffer_follows_payload_limit() {
        let options = Options::default().with_max_payload_read(4096);
        assert_eq!(options.read_buffer_limit(), 8192);

        let options = options.with_max_read_buffer(5000);
        assert_eq!(options.read_buffer_limit(), 5000);
    }

    #[test]
    fn test_compression_builders() {
        let options = Options::default()
            .with_server_max_window_bits(10)
            .client_no_context_takeover();
        let compression = options.compression.unwrap();
        assert_eq!(compression.server_max_window_bits, Some(10));
        assert!(compression.client_no_context_takeover);
        assert!(!compression.server_no_context_takeover);

        assert!(Options::default()
            .with_compression_level(CompressionLevel::best())
            .without_compression()
            .compression
            .is_none());
    }
}
