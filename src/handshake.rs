//! HTTP/1.1 upgrade handshake for the client side (RFC 6455 section 4.1).
//!
//! The request is written by hand and the response head is parsed with `httparse` as it
//! comes off the stream.
//! Bytes the server sent after the header block already belong to the WebSocket stream and
//! are returned to the caller untouched.
use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::{Host, Url};

use crate::{compression::WebSocketExtensions, Options, Result, WebSocketError};

/// GUID appended to the key before hashing.
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound for the response status line and headers.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Most headers accepted in the response.
const MAX_RESPONSE_HEADERS: usize = 64;

/// What the server agreed to during the handshake.
#[derive(Debug, Clone, Default)]
pub(crate) struct Negotiation {
    /// The sub-protocol selected by the server, if any.
    pub(crate) protocol: Option<String>,
    /// permessage-deflate parameters, present when compression is on.
    pub(crate) extensions: Option<WebSocketExtensions>,
}

/// Host, port and TLS flag of a `ws://` or `wss://` URL.
///
/// IPv6 hosts are kept without brackets so they can be resolved and used as a TLS server name.
pub(crate) struct Target {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) tls: bool,
}

impl Target {
    pub(crate) fn from_url(url: &Url) -> Result<Self> {
        let tls = match url.scheme() {
            "ws" => false,
            "wss" => true,
            scheme => {
                return Err(WebSocketError::InvalidAddress(format!(
                    "unsupported scheme {scheme}"
                )))
            }
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(WebSocketError::InvalidAddress(format!("{url} has no host"))),
        };

        let port = url
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        Ok(Self { host, port, tls })
    }

    /// `host[:port]`, with the port left out when it is 80 or 443.
    fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        if self.port == 80 || self.port == 443 {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    fn default_origin(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}", self.authority())
    }
}

/// Runs the opening handshake over `stream`.
///
/// Returns the negotiated parameters and whatever the server sent after its header block.
pub(crate) async fn client_handshake<S>(
    stream: &mut S,
    url: &Url,
    options: &Options,
) -> Result<(Negotiation, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let request = build_request(url, options, &key)?;

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some((response, len)) = Response::parse(&buf)? {
            if len > MAX_RESPONSE_HEAD {
                return Err(WebSocketError::InvalidResponse(
                    "response head exceeds 16 KiB".to_owned(),
                ));
            }

            buf.advance(len);
            let negotiation = negotiate(&response, &key, options)?;

            #[cfg(feature = "logging")]
            log::debug!(
                "handshake with {url} complete: protocol={:?} extensions={:?}",
                negotiation.protocol,
                negotiation.extensions
            );

            return Ok((negotiation, buf));
        }

        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(WebSocketError::InvalidResponse(
                "response head exceeds 16 KiB".to_owned(),
            ));
        }

        if stream.read_buf(&mut buf).await? == 0 {
            return Err(WebSocketError::ConnectionClosed);
        }
    }
}

/// Formats the upgrade request.
pub(crate) fn build_request(url: &Url, options: &Options, key: &str) -> Result<String> {
    let target = Target::from_url(url)?;
    let path = &url[url::Position::BeforePath..url::Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };

    let origin = options
        .origin
        .clone()
        .unwrap_or_else(|| target.default_origin());
    check_header_value("Origin", &origin)?;

    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Origin: {origin}\r\n",
        target.authority()
    );

    if !options.protocols.is_empty() {
        let protocols = options.protocols.join(", ");
        check_header_value("Sec-WebSocket-Protocol", &protocols)?;
        request.push_str(&format!("Sec-WebSocket-Protocol: {protocols}\r\n"));
    }

    if let Some(compression) = &options.compression {
        let offer = WebSocketExtensions::from(compression);
        request.push_str(&format!("Sec-WebSocket-Extensions: {offer}\r\n"));
    }

    for (name, value) in &options.headers {
        if name.is_empty() || name.contains(|c: char| c == ':' || c.is_ascii_whitespace()) {
            return Err(WebSocketError::InvalidHeader(format!("invalid header name {name:?}")));
        }
        check_header_value(name, value)?;
        request.push_str(&format!("{name}: {value}\r\n"));
    }

    request.push_str("\r\n");
    Ok(request)
}

fn check_header_value(name: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        return Err(WebSocketError::InvalidHeader(format!(
            "{name} contains a line break"
        )));
    }
    Ok(())
}

/// Headers of the server response.
#[derive(Debug)]
pub(crate) struct Response {
    /// Header names are lowercased.
    headers: Vec<(String, String)>,
}

impl Response {
    /// Parses the response head at the start of `buf`.
    ///
    /// Returns `None` while the head is incomplete, otherwise the response and the number of
    /// bytes its head takes up.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);

        let mut config = httparse::ParserConfig::default();
        config.allow_obsolete_multiline_headers_in_responses(true);

        let len = match config.parse_response(&mut response, buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(
                err @ (httparse::Error::HeaderName
                | httparse::Error::HeaderValue
                | httparse::Error::NewLine
                | httparse::Error::TooManyHeaders),
            ) => return Err(WebSocketError::InvalidHeader(err.to_string())),
            Err(err) => return Err(WebSocketError::InvalidResponse(err.to_string())),
        };

        if response.version != Some(1) || response.code != Some(101) {
            return Err(WebSocketError::InvalidResponse(format!(
                "HTTP/1.{} {} {}",
                response.version.unwrap_or_default(),
                response.code.unwrap_or_default(),
                response.reason.unwrap_or_default()
            )));
        }

        let headers: Vec<(String, String)> = response
            .headers
            .iter()
            .map(|header| -> Result<(String, String)> {
                let value = std::str::from_utf8(header.value).map_err(|_| {
                    WebSocketError::InvalidHeader(format!("{} is not valid UTF-8", header.name))
                })?;
                Ok((header.name.to_ascii_lowercase(), unfold(value)))
            })
            .collect::<Result<_>>()?;

        Ok(Some((Self { headers }, len)))
    }

    /// Looks a header up by name, case-insensitively. Repeated headers are joined with `, `.
    pub(crate) fn header(&self, name: &str) -> Option<String> {
        let mut values = self
            .headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str());

        let first = values.next()?;
        Some(values.fold(first.to_owned(), |mut joined, value| {
            joined.push_str(", ");
            joined.push_str(value);
            joined
        }))
    }
}

/// Joins the lines of an obsolete folded header value with single spaces.
fn unfold(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Checks the response against the request and extracts the agreed parameters.
pub(crate) fn negotiate(response: &Response, key: &str, options: &Options) -> Result<Negotiation> {
    if !response
        .header("upgrade")
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !response.header("connection").is_some_and(|value| {
        value
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    }) {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    if response.header("sec-websocket-accept").as_deref() != Some(accept_key(key).as_str()) {
        return Err(WebSocketError::InvalidAcceptKey);
    }

    let protocol = response.header("sec-websocket-protocol");
    if let Some(protocol) = &protocol {
        if !options.protocols.iter().any(|offered| offered == protocol) {
            return Err(WebSocketError::InvalidHeader(format!(
                "server selected a protocol that was not offered: {protocol}"
            )));
        }
    }

    let extensions = match response.header("sec-websocket-extensions") {
        None => None,
        Some(header) => {
            let Some(offer) = &options.compression else {
                return Err(WebSocketError::InvalidCompressionOptions(format!(
                    "server enabled extensions that were not offered: {header}"
                )));
            };

            let accepted = WebSocketExtensions::from_response(&header)?;
            if let Some(accepted) = &accepted {
                check_window_bits("server_max_window_bits", offer.server_max_window_bits, accepted.server_max_window_bits)?;
                check_window_bits("client_max_window_bits", offer.client_max_window_bits, accepted.client_max_window_bits)?;
            }
            accepted
        }
    };

    #[cfg(feature = "logging")]
    if options.compression.is_some() && extensions.is_none() {
        log::debug!("server declined permessage-deflate, continuing without compression");
    }

    Ok(Negotiation {
        protocol,
        extensions,
    })
}

/// The server may lower a window we asked for, never raise it.
fn check_window_bits(key: &str, offered: Option<u8>, accepted: Option<u8>) -> Result<()> {
    match (offered, accepted) {
        (Some(offered), Some(accepted)) if accepted > offered => {
            Err(WebSocketError::InvalidCompressionOptions(format!(
                "{key}={accepted} exceeds the offered {offered}"
            )))
        }
        _ => Ok(()),
    }
}

fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Expected `Sec-WebSocket-Accept` value for `key`.
pub(crate) fn accept_key(key: &str) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID);
    BASE64_STANDARD.encode(sha1.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn response(lines: &[&str]) -> Response {
        let head = format!("{}\r\n\r\n", lines.join("\r\n"));
        Response::parse(head.as_bytes()).unwrap().unwrap().0
    }

    fn upgrade_response(key: &str, extra: &[&str]) -> Response {
        let accept = format!("Sec-WebSocket-Accept: {}", accept_key(key));
        let mut lines = vec![
            "HTTP/1.1 101 Switching Protocols",
            "Upgrade: websocket",
            "Connection: Upgrade",
            accept.as_str(),
        ];
        lines.extend_from_slice(extra);
        response(&lines)
    }

    #[test]
    fn test_accept_key() {
        // RFC 6455 section 1.3
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_generated_key_is_16_bytes() {
        use base64::prelude::*;
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(key).unwrap().len(), 16);
    }

    #[test]
    fn test_request_omits_default_ports() {
        let url: Url = "ws://example.com:80/chat?room=1#frag".parse().unwrap();
        let request = build_request(&url, &Options::default(), "key").unwrap();

        assert!(request.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com\r\n"));
        assert!(request.contains("Origin: http://example.com\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains("Connection: Upgrade\r\n"));
        assert!(request.contains("Sec-WebSocket-Key: key\r\n"));
        assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(!request.contains("Sec-WebSocket-Extensions"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_request_with_port_and_options() {
        let url: Url = "wss://example.com:8443".parse().unwrap();
        let options = Options::default()
            .with_protocol("chat")
            .with_protocol("superchat")
            .with_server_max_window_bits(10)
            .with_header("Authorization", "Bearer token");
        let request = build_request(&url, &options, "key").unwrap();

        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:8443\r\n"));
        assert!(request.contains("Origin: https://example.com:8443\r\n"));
        assert!(request.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(request.contains(
            "Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits; server_max_window_bits=10\r\n"
        ));
        assert!(request.contains("Authorization: Bearer token\r\n"));
    }

    #[test]
    fn test_request_rejects_line_breaks() {
        let url: Url = "ws://example.com".parse().unwrap();
        let options = Options::default().with_header("X-Evil", "a\r\nHost: other");
        assert!(matches!(
            build_request(&url, &options, "key"),
            Err(WebSocketError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_ipv6_host() {
        let url: Url = "ws://[::1]:9001/chat".parse().unwrap();
        let target = Target::from_url(&url).unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 9001);

        let request = build_request(&url, &Options::default(), "key").unwrap();
        assert!(request.contains("Host: [::1]:9001\r\n"));
        assert!(request.contains("Origin: http://[::1]:9001\r\n"));
    }

    #[test]
    fn test_invalid_address() {
        let url: Url = "http://example.com".parse().unwrap();
        assert!(matches!(
            build_request(&url, &Options::default(), "key"),
            Err(WebSocketError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_status_must_be_101() {
        let err = Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidResponse(status) if status == "HTTP/1.1 200 OK"));

        assert!(Response::parse(b"HTTP/1.0 101 Switching Protocols\r\n\r\n").is_err());
    }

    #[test]
    fn test_headers_case_insensitive_and_folded() {
        let response = response(&[
            "HTTP/1.1 101 Switching Protocols",
            "UPGRADE: WebSocket",
            "x-long: first",
            "\tsecond",
            "X-Long: third",
        ]);

        assert_eq!(response.header("upgrade").as_deref(), Some("WebSocket"));
        assert_eq!(response.header("X-LONG").as_deref(), Some("first second, third"));
        assert_eq!(response.header("missing"), None);
    }

    #[test]
    fn test_partial_head_then_complete() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n";
        assert!(Response::parse(head).unwrap().is_none());

        let full = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x00";
        let (response, len) = Response::parse(full).unwrap().unwrap();
        assert_eq!(len, full.len() - 2);
        assert_eq!(response.header("upgrade").as_deref(), Some("websocket"));
    }

    #[test]
    fn test_malformed_header_line() {
        let err = Response::parse(b"HTTP/1.1 101 Switching Protocols\r\nno colon here\r\n\r\n").unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidHeader(_)));
    }

    #[test]
    fn test_negotiate_plain() {
        let negotiation = negotiate(&upgrade_response("abc", &[]), "abc", &Options::default()).unwrap();
        assert!(negotiation.protocol.is_none());
        assert!(negotiation.extensions.is_none());
    }

    #[test]
    fn test_negotiate_rejects_bad_accept() {
        let response = upgrade_response("other", &[]);
        assert!(matches!(
            negotiate(&response, "abc", &Options::default()),
            Err(WebSocketError::InvalidAcceptKey)
        ));
    }

    #[test]
    fn test_negotiate_upgrade_and_connection() {
        let accept = format!("Sec-WebSocket-Accept: {}", accept_key("k"));
        let no_upgrade = response(&["HTTP/1.1 101 Switching Protocols", "Connection: Upgrade", accept.as_str()]);
        assert!(matches!(
            negotiate(&no_upgrade, "k", &Options::default()),
            Err(WebSocketError::InvalidUpgradeHeader)
        ));

        let no_connection = response(&["HTTP/1.1 101 Switching Protocols", "Upgrade: websocket", accept.as_str()]);
        assert!(matches!(
            negotiate(&no_connection, "k", &Options::default()),
            Err(WebSocketError::InvalidConnectionHeader)
        ));

        let keep_alive = response(&[
            "HTTP/1.1 101 Switching Protocols",
            "Upgrade: websocket",
            "Connection: keep-alive, Upgrade",
            accept.as_str(),
        ]);
        assert!(negotiate(&keep_alive, "k", &Options::default()).is_ok());
    }

    #[test]
    fn test_negotiate_protocol() {
        let options = Options::default().with_protocol("chat");

        let ok = upgrade_response("k", &["Sec-WebSocket-Protocol: chat"]);
        assert_eq!(negotiate(&ok, "k", &options).unwrap().protocol.as_deref(), Some("chat"));

        let unexpected = upgrade_response("k", &["Sec-WebSocket-Protocol: mqtt"]);
        assert!(matches!(
            negotiate(&unexpected, "k", &options),
            Err(WebSocketError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_negotiate_compression() {
        let options = Options::default().with_server_max_window_bits(12);

        let ok = upgrade_response(
            "k",
            &["Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=10; client_max_window_bits=15"],
        );
        let extensions = negotiate(&ok, "k", &options).unwrap().extensions.unwrap();
        assert_eq!(extensions.server_max_window_bits, Some(10));
        assert_eq!(extensions.client_max_window_bits, Some(15));

        let raised = upgrade_response("k", &["Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=15"]);
        assert!(matches!(
            negotiate(&raised, "k", &options),
            Err(WebSocketError::InvalidCompressionOptions(_))
        ));

        let out_of_range = upgrade_response("k", &["Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=20"]);
        assert!(matches!(
            negotiate(&out_of_range, "k", &options),
            Err(WebSocketError::InvalidCompressionOptions(_))
        ));

        let not_offered = upgrade_response("k", &["Sec-WebSocket-Extensions: permessage-deflate"]);
        assert!(matches!(
            negotiate(&not_offered, "k", &Options::default()),
            Err(WebSocketError::InvalidCompressionOptions(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_keeps_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let url: Url = "ws://localhost:9001/test".parse().unwrap();

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut request = Vec::new();
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let n = server.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
            }

            let request = String::from_utf8(request).unwrap();
            let key = request
                .lines()
                .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
                .unwrap()
                .to_owned();

            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept_key(&key)
            );
            let mut response = response.into_bytes();
            response.extend_from_slice(b"\x81\x02hi");
            server.write_all(&response).await.unwrap();
            request
        });

        let (negotiation, rest) = client_handshake(&mut client, &url, &Options::default()).await.unwrap();
        assert!(negotiation.protocol.is_none());
        assert_eq!(&rest[..], b"\x81\x02hi");

        let request = server.await.unwrap();
        assert!(request.contains("Host: localhost:9001\r\n"));
    }

    #[tokio::test]
    async fn test_handshake_eof() {
        let (mut client, server) = tokio::io::duplex(4096);
        drop(server);

        let url: Url = "ws://localhost/".parse().unwrap();
        assert!(client_handshake(&mut client, &url, &Options::default()).await.is_err());
    }
}
