//! End-to-end tests against an in-memory server speaking raw bytes.

use std::time::Duration;

use base64::prelude::*;
use futures::StreamExt;
use sha1::{Digest, Sha1};
use tidews::{close::CloseCode, DeflateOptions, Event, Message, Options, WebSocket, WebSocketError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    time::timeout,
};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Reads the upgrade request and returns it.
async fn read_request(server: &mut DuplexStream) -> String {
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = server.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending its request");
        request.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(request).unwrap()
}

fn accept_key(request: &str) -> String {
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .unwrap();

    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// The 101 response to `request`, with `extra` header lines.
fn upgrade_response(request: &str, extra: &[&str]) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        accept_key(request)
    );
    for line in extra {
        response.push_str(line);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response
}

/// Completes the handshake, adding `extra` header lines to the 101 response.
async fn accept(server: &mut DuplexStream, extra: &[&str]) -> String {
    let request = read_request(server).await;
    server
        .write_all(upgrade_response(&request, extra).as_bytes())
        .await
        .unwrap();
    request
}

/// Encodes an unmasked frame, the way a server sends it.
fn server_frame(fin: bool, rsv1: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![(fin as u8) << 7 | (rsv1 as u8) << 6 | opcode];
    match payload.len() {
        len @ 0..=125 => frame.push(len as u8),
        len @ 126..=0xFFFF => {
            frame.push(126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    frame
}

struct ClientFrame {
    fin: bool,
    rsv1: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Reads one frame written by the client, checking that it is masked.
async fn read_client_frame(server: &mut DuplexStream) -> ClientFrame {
    let mut head = [0u8; 2];
    server.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1] & 0x80, 0x80, "client frames must be masked");

    let len = match head[1] & 0x7F {
        126 => server.read_u16().await.unwrap() as usize,
        127 => server.read_u64().await.unwrap() as usize,
        len => len as usize,
    };

    let mut mask = [0u8; 4];
    server.read_exact(&mut mask).await.unwrap();

    let mut payload = vec![0u8; len];
    server.read_exact(&mut payload).await.unwrap();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    ClientFrame {
        fin: head[0] & 0x80 != 0,
        rsv1: head[0] & 0x40 != 0,
        opcode: head[0] & 0x0F,
        payload,
    }
}

fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    payload
}

fn start(options: Options) -> (WebSocket, DuplexStream) {
    start_with_buffer(options, 64 * 1024)
}

fn start_with_buffer(options: Options, max_buf_size: usize) -> (WebSocket, DuplexStream) {
    let (client, server) = tokio::io::duplex(max_buf_size);
    let ws = WebSocket::handshake("ws://localhost:9001/chat".parse().unwrap(), client, options);
    (ws, server)
}

/// Collects events up to and including `End`.
async fn collect_events(ws: &mut WebSocket) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("connection did not end in time");

        match event {
            Some(event @ Event::End { .. }) => {
                events.push(event);
                break;
            }
            Some(event) => events.push(event),
            None => panic!("event stream ended without End"),
        }
    }

    // nothing follows End
    assert!(ws.next().await.is_none());
    events
}

#[tokio::test]
async fn test_server_close_with_reason() {
    let (mut ws, mut server) = start(Options::default());

    let request = accept(&mut server, &[]).await;
    assert!(request.starts_with("GET /chat HTTP/1.1\r\n"));
    assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));

    server
        .write_all(&server_frame(true, false, 0x8, &close_payload(1000, "bye")))
        .await
        .unwrap();

    let echo = read_client_frame(&mut server).await;
    assert_eq!(echo.opcode, 0x8);
    assert_eq!(echo.payload, close_payload(1000, "bye"));

    let events = collect_events(&mut ws).await;
    assert_eq!(events.len(), 3, "{events:?}");
    assert!(matches!(&events[0], Event::Open { protocol: None }));
    assert!(matches!(
        &events[1],
        Event::Close { code: CloseCode::Normal, reason, was_clean: true } if reason == "bye"
    ));
    assert!(matches!(
        &events[2],
        Event::End { code: CloseCode::Normal, reason, was_clean: true, error: None } if reason == "bye"
    ));
}

#[tokio::test]
async fn test_fragmented_text_with_ping() {
    let (mut ws, mut server) = start(Options::default());
    accept(&mut server, &[]).await;

    let mut bytes = server_frame(false, false, 0x1, b"Hel");
    bytes.extend(server_frame(true, false, 0x9, b"p"));
    bytes.extend(server_frame(true, false, 0x0, b"lo"));
    server.write_all(&bytes).await.unwrap();

    let pong = read_client_frame(&mut server).await;
    assert!(pong.fin);
    assert_eq!(pong.opcode, 0xA);
    assert_eq!(pong.payload, b"p");

    server
        .write_all(&server_frame(true, false, 0x8, &close_payload(1000, "")))
        .await
        .unwrap();

    let events = collect_events(&mut ws).await;
    let messages: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Message(message) => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(messages, [Message::Text("Hello".into())]);
}

#[tokio::test]
async fn test_deflate_with_small_server_window() {
    let options = Options::default().with_compression(DeflateOptions {
        server_max_window_bits: Some(10),
        ..Default::default()
    });
    let (mut ws, mut server) = start(options);

    let request = accept(
        &mut server,
        &["Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=10"],
    )
    .await;
    assert!(request.contains("permessage-deflate"));
    assert!(request.contains("server_max_window_bits=10"));

    let text = "Hello, compressed world! ".repeat(40);
    let mut compress = flate2::Compress::new(flate2::Compression::default(), false);
    let mut compressed = Vec::with_capacity(text.len());
    compress
        .compress_vec(text.as_bytes(), &mut compressed, flate2::FlushCompress::Sync)
        .unwrap();
    assert!(compressed.ends_with(&[0x00, 0x00, 0xFF, 0xFF]));
    compressed.truncate(compressed.len() - 4);

    server
        .write_all(&server_frame(true, true, 0x1, &compressed))
        .await
        .unwrap();

    assert!(matches!(ws.next().await, Some(Event::Open { .. })));
    match ws.next().await {
        Some(Event::Message(Message::Text(received))) => assert_eq!(received, text),
        other => panic!("unexpected event {other:?}"),
    }

    // the client compresses its own messages too
    ws.send_text("reply");
    let reply = read_client_frame(&mut server).await;
    assert_eq!(reply.opcode, 0x1);
    assert!(reply.rsv1);

    let mut inflated = Vec::with_capacity(64);
    let mut decompress = flate2::Decompress::new(false);
    let mut input = reply.payload;
    input.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
    decompress
        .decompress_vec(&input, &mut inflated, flate2::FlushDecompress::Sync)
        .unwrap();
    assert_eq!(inflated, b"reply");
}

#[tokio::test]
async fn test_masked_frame_fails_with_protocol_error() {
    let (mut ws, mut server) = start(Options::default());
    accept(&mut server, &[]).await;

    // masked text frame "hi" with a zero key
    server
        .write_all(&[0x81, 0x82, 0x00, 0x00, 0x00, 0x00, b'h', b'i'])
        .await
        .unwrap();

    let close = read_client_frame(&mut server).await;
    assert_eq!(close.opcode, 0x8);
    assert_eq!(&close.payload[..2], &1002u16.to_be_bytes());

    let events = collect_events(&mut ws).await;
    assert!(matches!(events[0], Event::Open { .. }));
    assert!(events
        .iter()
        .all(|event| !matches!(event, Event::Message(_))));
    assert!(matches!(
        events[1],
        Event::Error(ref err) if matches!(**err, WebSocketError::MaskedFrame)
    ));
    assert!(matches!(
        events[2],
        Event::Close { code: CloseCode::Protocol, was_clean: false, .. }
    ));
    assert!(matches!(
        events[3],
        Event::End { code: CloseCode::Protocol, was_clean: false, error: Some(_), .. }
    ));
}

#[tokio::test]
async fn test_invalid_utf8_closes_with_1007() {
    let (mut ws, mut server) = start(Options::default());
    accept(&mut server, &[]).await;

    server
        .write_all(&server_frame(true, false, 0x1, &[0xED, 0xA0, 0x80]))
        .await
        .unwrap();

    let close = read_client_frame(&mut server).await;
    assert_eq!(&close.payload[..2], &1007u16.to_be_bytes());

    let events = collect_events(&mut ws).await;
    assert!(matches!(
        events.last(),
        Some(Event::End { code: CloseCode::Invalid, was_clean: false, .. })
    ));
}

#[tokio::test]
async fn test_handshake_failure_ends_without_open() {
    let (mut ws, mut server) = start(Options::default());

    read_request(&mut server).await;
    server
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();

    let events = collect_events(&mut ws).await;
    assert_eq!(events.len(), 1, "{events:?}");
    assert!(matches!(
        &events[0],
        Event::End { code: CloseCode::Abnormal, was_clean: false, error: Some(err), .. }
            if matches!(**err, WebSocketError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_eof_is_abnormal() {
    let (mut ws, mut server) = start(Options::default());
    accept(&mut server, &[]).await;
    drop(server);

    let events = collect_events(&mut ws).await;
    assert!(matches!(events[0], Event::Open { .. }));
    assert!(matches!(
        events.last(),
        Some(Event::End { code: CloseCode::Abnormal, was_clean: false, error: Some(_), .. })
    ));
    assert_eq!(ws.ready_state(), tidews::ReadyState::Closed);
}

#[tokio::test]
async fn test_local_close_waits_for_peer() {
    let (mut ws, mut server) = start(Options::default());
    accept(&mut server, &[]).await;

    ws.send_text("hi");
    ws.close(Some(CloseCode::Normal), "done");

    let text = read_client_frame(&mut server).await;
    assert_eq!(text.opcode, 0x1);
    assert_eq!(text.payload, b"hi");

    let close = read_client_frame(&mut server).await;
    assert_eq!(close.payload, close_payload(1000, "done"));

    server
        .write_all(&server_frame(true, false, 0x8, &close.payload))
        .await
        .unwrap();

    let events = collect_events(&mut ws).await;
    assert!(matches!(
        events.last(),
        Some(Event::End { code: CloseCode::Normal, was_clean: true, error: None, .. })
    ));
}

#[tokio::test]
async fn test_close_timeout() {
    let options = Options::default().with_close_timeout(Duration::from_millis(50));
    let (mut ws, mut server) = start(options);
    accept(&mut server, &[]).await;

    ws.close(None, "");
    let close = read_client_frame(&mut server).await;
    assert!(close.payload.is_empty());

    // never answer
    let events = collect_events(&mut ws).await;
    assert!(matches!(
        events.last(),
        Some(Event::End { code: CloseCode::Abnormal, was_clean: false, .. })
    ));
    drop(server);
}

#[tokio::test]
async fn test_negotiated_protocol() {
    let options = Options::default().with_protocol("chat").with_protocol("superchat");
    let (mut ws, mut server) = start(options);

    let request = accept(&mut server, &["Sec-WebSocket-Protocol: superchat"]).await;
    assert!(request.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));

    match ws.next().await {
        Some(Event::Open { protocol }) => assert_eq!(protocol.as_deref(), Some("superchat")),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(ws.protocol(), Some("superchat"));
}

#[tokio::test]
async fn test_pong_written_before_queued_messages() {
    let (mut ws, mut server) = start(Options::default());

    // queued while connecting
    ws.send_text("one");
    ws.send_text("two");
    ws.send_text("three");

    // the ping arrives in the same read as the 101 response
    let request = read_request(&mut server).await;
    let mut bytes = upgrade_response(&request, &[]).into_bytes();
    bytes.extend(server_frame(true, false, 0x9, b"p"));
    server.write_all(&bytes).await.unwrap();

    let pong = read_client_frame(&mut server).await;
    assert_eq!(pong.opcode, 0xA);
    assert_eq!(pong.payload, b"p");

    for expected in ["one", "two", "three"] {
        let text = read_client_frame(&mut server).await;
        assert_eq!(text.opcode, 0x1);
        assert_eq!(text.payload, expected.as_bytes());
    }

    assert!(matches!(ws.next().await, Some(Event::Open { .. })));
}

#[tokio::test]
async fn test_write_timeout() {
    let options = Options::default()
        .with_write_timeout(Duration::from_millis(100))
        .with_close_timeout(Duration::from_millis(100));
    let (mut ws, mut server) = start_with_buffer(options, 64);
    accept(&mut server, &[]).await;

    // the server stops reading, so the frame never fits
    ws.send_binary(vec![0u8; 64 * 1024]);

    let events = collect_events(&mut ws).await;
    assert!(matches!(events[0], Event::Open { .. }));
    assert!(matches!(
        events.last(),
        Some(Event::End { code: CloseCode::Abnormal, was_clean: false, error: Some(err), .. })
            if matches!(**err, WebSocketError::Timeout)
    ));
    drop(server);
}

#[tokio::test]
async fn test_read_timeout_when_idle() {
    let options = Options::default().with_read_timeout(Duration::from_millis(100));
    let (mut ws, mut server) = start(options);
    accept(&mut server, &[]).await;

    let events = collect_events(&mut ws).await;
    assert!(matches!(events[0], Event::Open { .. }));
    assert!(matches!(
        events.last(),
        Some(Event::End { code: CloseCode::Abnormal, was_clean: false, error: Some(err), .. })
            if matches!(**err, WebSocketError::Timeout)
    ));
    drop(server);
}

#[tokio::test]
async fn test_slow_frame_within_read_timeout() {
    let options = Options::default().with_read_timeout(Duration::from_millis(200));
    let (mut ws, mut server) = start(options);
    accept(&mut server, &[]).await;

    // one frame spread over several read timeouts, never silent for long
    let payload = vec![7u8; 150];
    for byte in server_frame(true, false, 0x2, &payload) {
        server.write_all(&[byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    server
        .write_all(&server_frame(true, false, 0x8, &close_payload(1000, "")))
        .await
        .unwrap();

    let echo = read_client_frame(&mut server).await;
    assert_eq!(echo.opcode, 0x8);

    let events = collect_events(&mut ws).await;
    assert!(matches!(events[0], Event::Open { .. }));
    assert!(matches!(&events[1], Event::Message(Message::Binary(data)) if data[..] == payload[..]));
    assert!(matches!(
        events.last(),
        Some(Event::End { code: CloseCode::Normal, was_clean: true, error: None, .. })
    ));
}

#[tokio::test]
async fn test_dropping_every_handle_closes_with_going_away() {
    let (mut ws, mut server) = start(Options::default());
    accept(&mut server, &[]).await;

    assert!(matches!(ws.next_event().await, Some(Event::Open { protocol: None })));

    let handle = ws.handle();
    tokio::spawn(async move { handle.send_text("from a task") })
        .await
        .unwrap();

    let text = read_client_frame(&mut server).await;
    assert_eq!(text.opcode, 0x1);
    assert_eq!(text.payload, b"from a task");

    drop(ws);

    let close = read_client_frame(&mut server).await;
    assert_eq!(close.opcode, 0x8);
    assert_eq!(close.payload, close_payload(1001, ""));
}
