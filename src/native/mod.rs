//! Client connections on the Tokio runtime.

mod builder;
mod connection;
mod options;
mod split;

use crate::{close, compression, frame, Result, WebSocketError};

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use close::CloseCode;
use compression::{Compressor, Decompressor, MAX_WINDOW_BITS};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use url::Url;

use connection::{Command, Shared};

// Re-exports
pub use builder::WebSocketBuilder;
pub use frame::{Frame, OpCode};
pub use options::{
    CompressionLevel, DeflateOptions, Options, CLOSE_TIMEOUT, CONNECT_TIMEOUT, MAX_PAYLOAD_READ,
    MAX_READ_BUFFER,
};

pub(crate) use crate::handshake::Negotiation;

impl Negotiation {
    /// Builds the inflater for messages sent by the server.
    pub(crate) fn decompressor(&self) -> Option<Decompressor> {
        let config = self.extensions.as_ref()?;
        let window_bits = config.server_max_window_bits.unwrap_or(MAX_WINDOW_BITS);

        #[cfg(feature = "logging")]
        log::debug!(
            "Established decompressor with settings \
            server_max_window_bits={window_bits} server_no_context_takeover={}",
            config.server_no_context_takeover
        );

        Some(Decompressor::new(
            window_bits,
            config.server_no_context_takeover,
        ))
    }

    /// Builds the deflater for messages sent to the server.
    ///
    /// Returns `None` when compression was not negotiated, or when the window the server
    /// imposed cannot be produced. Messages then go out uncompressed, which permessage-deflate
    /// allows.
    pub(crate) fn compressor(&self, level: CompressionLevel) -> Option<Compressor> {
        let config = self.extensions.as_ref()?;
        let window_bits = config.client_max_window_bits.unwrap_or(MAX_WINDOW_BITS);

        let compressor = Compressor::new(level, window_bits, config.client_no_context_takeover);

        #[cfg(feature = "logging")]
        match compressor {
            Some(_) => log::debug!(
                "Established compressor with settings \
                client_max_window_bits={window_bits} client_no_context_takeover={}",
                config.client_no_context_takeover
            ),
            None => log::debug!(
                "client_max_window_bits={window_bits} is not supported, sending uncompressed"
            ),
        }

        compressor
    }
}

// ================== Message ====================

/// A complete WebSocket message.
///
/// Incoming fragmented messages are reassembled and decompressed before they are delivered.
/// Outgoing messages are always sent as a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A UTF-8 text message.
    Text(String),
    /// A binary message.
    Binary(Bytes),
    /// A ping control message. Incoming pings are answered automatically.
    Ping(Bytes),
    /// A pong control message.
    Pong(Bytes),
    /// A close control message, with its status code and reason when present.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Returns the payload of the message as bytes.
    pub fn into_data(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.to_vec(),
            Self::Close(None) => Vec::new(),
            Self::Close(Some(frame)) => {
                let mut data = u16::from(frame.code).to_be_bytes().to_vec();
                data.extend_from_slice(frame.reason.as_bytes());
                data
            }
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }
}

/// Status code and reason of a Close message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

// ================== Event ====================

/// Everything that happens on a connection, in order.
///
/// A connection that opens yields [`Event::Open`], then any number of messages and pongs,
/// then [`Event::Close`] and finally [`Event::End`]. A connection that fails during the
/// handshake yields [`Event::End`] only. [`Event::End`] is always the last event and is
/// delivered exactly once.
#[derive(Debug, Clone)]
pub enum Event {
    /// The handshake succeeded.
    Open {
        /// Sub-protocol selected by the server.
        protocol: Option<String>,
    },
    /// A text or binary message arrived.
    Message(Message),
    /// A pong arrived.
    Pong(Bytes),
    /// The connection stopped exchanging messages.
    Close {
        code: CloseCode,
        reason: String,
        /// `true` when both sides exchanged Close frames.
        was_clean: bool,
    },
    /// The connection failed. Followed by [`Event::Close`] and [`Event::End`].
    Error(Arc<WebSocketError>),
    /// The transport is closed and no more events follow.
    End {
        code: CloseCode,
        reason: String,
        was_clean: bool,
        /// The error that ended the connection, if any.
        error: Option<Arc<WebSocketError>>,
    },
}

// ================== ReadyState ====================

/// Lifecycle of a connection. States only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ReadyState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Atomic cell holding a [`ReadyState`].
pub(crate) struct AtomicReadyState(AtomicU8);

impl AtomicReadyState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ReadyState::Connecting as u8))
    }

    pub(crate) fn load(&self) -> ReadyState {
        ReadyState::from(self.0.load(Ordering::Acquire))
    }

    /// Moves the state forward to `state`. Earlier states are ignored.
    pub(crate) fn advance(&self, state: ReadyState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Moves from `from` to `to`, returning `false` if the state was not `from`.
    pub(crate) fn transition(&self, from: ReadyState, to: ReadyState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Closing` unless the connection is already closing or closed.
    pub(crate) fn begin_closing(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < ReadyState::Closing as u8).then_some(ReadyState::Closing as u8)
            })
            .is_ok()
    }
}

// ================== WebSocket ====================

/// A client WebSocket connection.
///
/// The connection runs on its own task. [`WebSocket`] is the stream of [`Event`]s it
/// produces, and dereferences to a [`WebSocketHandle`] for sending.
///
/// # Connecting
/// ```no_run
/// use futures::StreamExt;
/// use tidews::{Event, WebSocket};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut ws = WebSocket::connect("wss://echo.websocket.org".parse()?).start();
///     while let Some(event) = ws.next().await {
///         println!("{event:?}");
///     }
///     Ok(())
/// }
/// ```
pub struct WebSocket {
    handle: WebSocketHandle,
    events: mpsc::UnboundedReceiver<Event>,
}

impl WebSocket {
    /// Starts configuring a connection to `url`, which must use the `ws` or `wss` scheme.
    pub fn connect(url: Url) -> WebSocketBuilder {
        WebSocketBuilder::new(url)
    }

    /// Performs the opening handshake over an already connected stream and drives the
    /// connection on a new task.
    ///
    /// `url` is only used for the request target and the `Host` and `Origin` headers.
    pub fn handshake<S>(url: Url, io: S, options: Options) -> WebSocket
    where
        S: AsyncWrite + AsyncRead + Send + Unpin + 'static,
    {
        Self::spawn(url, options, async move { Ok(io) })
    }

    pub(crate) fn spawn<F, S>(url: Url, options: Options, connect: F) -> WebSocket
    where
        F: std::future::Future<Output = Result<S>> + Send + 'static,
        S: AsyncWrite + AsyncRead + Send + Unpin + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());

        tokio::spawn(connection::run(
            connect,
            url,
            options,
            Arc::clone(&shared),
            command_rx,
            event_tx,
        ));

        WebSocket {
            handle: WebSocketHandle {
                commands: command_tx,
                shared,
            },
            events: event_rx,
        }
    }

    /// Returns a handle that can send on this connection from anywhere.
    pub fn handle(&self) -> WebSocketHandle {
        self.handle.clone()
    }

    /// Waits for the next event. Returns `None` after [`Event::End`].
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

impl std::ops::Deref for WebSocket {
    type Target = WebSocketHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl futures::Stream for WebSocket {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.events.poll_recv(cx)
    }
}

// ================== WebSocketHandle ====================

/// Sending side of a connection.
///
/// Every method only enqueues work for the connection task and returns immediately. Once
/// the connection is closing or closed, sends are silently dropped.
#[derive(Clone)]
pub struct WebSocketHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl WebSocketHandle {
    /// Queues a message.
    ///
    /// Sending [`Message::Close`] starts the closing handshake like [`WebSocketHandle::close`].
    pub fn send(&self, message: impl Into<Message>) {
        match message.into() {
            Message::Close(frame) => match frame {
                Some(CloseFrame { code, reason }) => self.close(Some(code), reason),
                None => self.close(None, ""),
            },
            message => {
                if self.ready_state() < ReadyState::Closing {
                    let _ = self.commands.send(Command::Send(message));
                }
            }
        }
    }

    /// Queues a text message.
    pub fn send_text(&self, text: impl Into<String>) {
        self.send(Message::Text(text.into()));
    }

    /// Queues a binary message.
    pub fn send_binary(&self, data: impl Into<Bytes>) {
        self.send(Message::Binary(data.into()));
    }

    /// Serializes `data` and queues it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize>(&self, data: &T) -> Result<()> {
        let text = serde_json::to_string(data)?;
        self.send_text(text);
        Ok(())
    }

    /// Queues a ping. Payloads longer than 125 bytes are truncated.
    pub fn ping(&self, payload: impl Into<Bytes>) {
        self.send(Message::Ping(payload.into()));
    }

    /// Starts the closing handshake.
    ///
    /// Messages queued before this call are still sent. Codes that cannot appear on the
    /// wire (such as 1005 or 1006) produce a Close frame without a status code. Calling
    /// this more than once has no effect.
    pub fn close(&self, code: Option<CloseCode>, reason: impl Into<String>) {
        if self.shared.state.begin_closing() {
            let _ = self.commands.send(Command::Close(code, reason.into()));
        }
    }

    /// Returns the current state of the connection.
    pub fn ready_state(&self) -> ReadyState {
        self.shared.state.load()
    }

    /// Returns the sub-protocol selected by the server, once the connection is open.
    pub fn protocol(&self) -> Option<&str> {
        self.shared.protocol.get()?.as_deref()
    }
}
