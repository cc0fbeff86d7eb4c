//! The task driving one connection.
//!
//! The task owns the transport and is the only writer of the connection state. It performs
//! the handshake, then waits on the transport and the command channel at the same time:
//! incoming frames are reassembled into messages, control frames are answered, and queued
//! commands are encoded and written. Any error ends the connection with the close code the
//! error maps to.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::{self, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use url::Url;

use crate::{
    close::CloseCode,
    codec::{self, Codec},
    frame::Frame,
    handshake::client_handshake,
    stream::ReadActivity,
    Result, WebSocketError,
};

use super::{
    split::{ReadHalf, WriteHalf},
    AtomicReadyState, CloseFrame, Event, Message, Options, ReadyState,
};

/// Work queued by a [`WebSocketHandle`](super::WebSocketHandle).
pub(crate) enum Command {
    Send(Message),
    Close(Option<CloseCode>, String),
}

/// State visible to handles.
pub(crate) struct Shared {
    pub(super) state: AtomicReadyState,
    /// Set once, right before the `Open` event.
    pub(super) protocol: OnceLock<Option<String>>,
}

impl Shared {
    pub(super) fn new() -> Self {
        Self {
            state: AtomicReadyState::new(),
            protocol: OnceLock::new(),
        }
    }
}

/// How a connection ended, reported by [`Event::End`].
struct Termination {
    code: CloseCode,
    reason: String,
    was_clean: bool,
    error: Option<Arc<WebSocketError>>,
}

impl Termination {
    fn failed(code: CloseCode, error: WebSocketError) -> Self {
        Self {
            code,
            reason: error.to_string(),
            was_clean: false,
            error: Some(Arc::new(error)),
        }
    }
}

/// Runs a connection from the first byte to the last event.
///
/// `connect` produces the transport. It and the handshake together are bounded by the
/// connect timeout.
pub(super) async fn run<F, S>(
    connect: F,
    url: Url,
    options: Options,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
) where
    F: Future<Output = Result<S>>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let opening = async {
        let mut stream = connect.await?;
        let (negotiation, read_buf) = client_handshake(&mut stream, &url, &options).await?;
        Ok::<_, WebSocketError>((stream, negotiation, read_buf))
    };

    let termination = match time::timeout(options.connect_timeout, opening).await {
        Ok(Ok((stream, negotiation, read_buf))) => {
            let _ = shared.protocol.set(negotiation.protocol.clone());
            // a close() during the handshake keeps the state at Closing
            shared.state.transition(ReadyState::Connecting, ReadyState::Open);

            #[cfg(feature = "logging")]
            log::debug!("connection to {url} open");

            let _ = events.send(Event::Open {
                protocol: negotiation.protocol.clone(),
            });

            let decoder = codec::Decoder::new(
                options.payload_limit(),
                negotiation.extensions.is_some(),
            );
            let codec = Codec::from((decoder, codec::Encoder));

            let mut parts = FramedParts::new::<Frame>(ReadActivity::new(stream), codec);
            parts.read_buf = read_buf;

            let compression_level = options
                .compression
                .as_ref()
                .map(|compression| compression.level)
                .unwrap_or_default();

            let mut connection = Connection {
                framed: Framed::from_parts(parts),
                read_half: ReadHalf::new(negotiation.decompressor(), options.read_buffer_limit()),
                write_half: WriteHalf::new(negotiation.compressor(compression_level)),
                obligated_sends: VecDeque::new(),
                shared: Arc::clone(&shared),
                events: events.clone(),
                close_sent: false,
                close_deadline: None,
                read_timeout: options.read_timeout,
                write_timeout: options.write_timeout,
                close_timeout: options.close_timeout,
            };

            connection.drive(&mut commands).await
        }
        Ok(Err(err)) => {
            #[cfg(feature = "logging")]
            log::debug!("handshake with {url} failed: {err}");

            Termination::failed(CloseCode::Abnormal, err)
        }
        Err(_) => {
            #[cfg(feature = "logging")]
            log::debug!("handshake with {url} timed out");

            Termination::failed(CloseCode::Abnormal, WebSocketError::Timeout)
        }
    };

    shared.state.advance(ReadyState::Closed);

    let _ = events.send(Event::End {
        code: termination.code,
        reason: termination.reason,
        was_clean: termination.was_clean,
        error: termination.error,
    });
}

/// An open connection.
struct Connection<S> {
    framed: Framed<ReadActivity<S>, Codec>,
    read_half: ReadHalf,
    write_half: WriteHalf,
    /// Pongs owed to the peer, written before any queued command.
    obligated_sends: VecDeque<Frame>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Event>,
    close_sent: bool,
    /// When the peer must have answered our Close frame.
    close_deadline: Option<Instant>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    close_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Termination {
        match self.process(commands).await {
            Ok(termination) => termination,
            Err(err) => self.fail(err).await,
        }
    }

    async fn process(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<Termination> {
        loop {
            while let Some(frame) = self.obligated_sends.pop_front() {
                self.write(frame).await?;
            }

            let read_deadline = self.read_deadline();

            tokio::select! {
                biased;
                frame = self.framed.next() => {
                    let frame = frame.ok_or(WebSocketError::ConnectionClosed)??;

                    if let Some(termination) = self.on_frame(frame).await? {
                        return Ok(termination);
                    }
                }
                command = commands.recv(), if !self.close_sent => {
                    match command {
                        Some(Command::Send(message)) => {
                            let frame = self.write_half.encode(message)?;
                            self.write(frame).await?;
                        }
                        Some(Command::Close(code, reason)) => self.send_close(code, reason).await?,
                        None => {
                            // every handle is gone
                            self.shared.state.begin_closing();
                            self.send_close(Some(CloseCode::Away), String::new()).await?;
                        }
                    }
                }
                _ = sleep_until(self.close_deadline) => {
                    #[cfg(feature = "logging")]
                    log::debug!("peer did not answer the close frame in time");

                    return Err(WebSocketError::Timeout);
                }
                _ = sleep_until(read_deadline) => {
                    // bytes of an unfinished frame moved the deadline while we slept
                    if self.read_deadline().is_some_and(|deadline| deadline <= Instant::now()) {
                        #[cfg(feature = "logging")]
                        log::debug!("no bytes from the peer within the read timeout");

                        return Err(WebSocketError::Timeout);
                    }
                }
            }
        }
    }

    /// The read timeout counted from the last bytes the transport produced.
    fn read_deadline(&self) -> Option<Instant> {
        let last_read = self.framed.get_ref().last_read();
        self.read_timeout.map(|timeout| last_read + timeout)
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Option<Termination>> {
        let Some(message) = self.read_half.on_frame(frame)? else {
            return Ok(None);
        };

        match message {
            Message::Ping(payload) => {
                if !self.close_sent {
                    self.obligated_sends.push_back(Frame::pong(payload));
                }
            }
            Message::Pong(payload) => self.emit(Event::Pong(payload)),
            Message::Close(close) => return self.on_close(close).await.map(Some),
            message => self.emit(Event::Message(message)),
        }

        Ok(None)
    }

    async fn on_close(&mut self, close: Option<CloseFrame>) -> Result<Termination> {
        let (code, reason) = match close {
            Some(CloseFrame { code, reason }) => (code, reason),
            None => (CloseCode::Status, String::new()),
        };

        #[cfg(feature = "logging")]
        log::debug!("received close frame: code={code} reason={reason:?}");

        if !self.close_sent {
            self.shared.state.advance(ReadyState::Closing);
            self.close_sent = true;

            let echo = if code == CloseCode::Status {
                Frame::close_raw(bytes::Bytes::new())
            } else {
                Frame::close(code, &reason)
            };
            self.write(echo).await?;
        }

        self.shutdown().await;

        self.emit(Event::Close {
            code,
            reason: reason.clone(),
            was_clean: true,
        });

        Ok(Termination {
            code,
            reason,
            was_clean: true,
            error: None,
        })
    }

    /// Writes our Close frame and starts waiting for the peer's.
    async fn send_close(&mut self, code: Option<CloseCode>, reason: String) -> Result<()> {
        #[cfg(feature = "logging")]
        log::debug!("closing connection: code={code:?} reason={reason:?}");

        let frame = self
            .write_half
            .encode(Message::Close(code.map(|code| CloseFrame { code, reason })))?;

        self.close_sent = true;
        self.close_deadline = Some(Instant::now() + self.close_timeout);
        self.write(frame).await
    }

    /// Ends the connection after an error.
    ///
    /// Protocol, payload and size errors still tell the peer with a Close frame, unless one
    /// was already sent. Transport errors just drop the connection.
    async fn fail(&mut self, err: WebSocketError) -> Termination {
        self.shared.state.advance(ReadyState::Closing);
        let code = err.close_code();

        #[cfg(feature = "logging")]
        log::debug!("connection failed with {code}: {err}");

        if code != CloseCode::Abnormal && !self.close_sent {
            self.close_sent = true;

            let frame = self.write_half.encode(Message::Close(Some(CloseFrame {
                code,
                reason: err.to_string(),
            })));
            if let Ok(frame) = frame {
                let _ = self.write(frame).await;
            }
        }

        self.shutdown().await;

        let termination = Termination::failed(code, err);
        if let Some(error) = &termination.error {
            self.emit(Event::Error(Arc::clone(error)));
        }
        self.emit(Event::Close {
            code,
            reason: termination.reason.clone(),
            was_clean: false,
        });

        termination
    }

    async fn write(&mut self, frame: Frame) -> Result<()> {
        match self.write_timeout {
            Some(timeout) => time::timeout(timeout, self.framed.send(frame))
                .await
                .map_err(|_| WebSocketError::Timeout)?,
            None => self.framed.send(frame).await,
        }
    }

    async fn shutdown(&mut self) {
        let _ = time::timeout(self.close_timeout, self.framed.get_mut().shutdown()).await;
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
