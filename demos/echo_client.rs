/// Sends a few messages to a public echo server and prints what comes back.
use std::time::Duration;

use futures::StreamExt;
use tidews::{close::CloseCode, DeflateOptions, Event, Message, Options, WebSocket};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let mut ws = WebSocket::connect(url.parse()?)
        .with_options(
            Options::default()
                .with_compression(DeflateOptions::default())
                .with_read_timeout(Duration::from_secs(30)),
        )
        .start();

    let mut sent = 0;
    while let Some(event) = ws.next().await {
        match event {
            Event::Open { protocol } => {
                log::info!("connected (protocol: {protocol:?})");
                ws.send_text("hello");
                ws.ping("are you there?");
            }
            Event::Message(Message::Text(text)) => {
                log::info!("text: {text}");
                sent += 1;
                if sent < 3 {
                    ws.send_binary(vec![sent as u8; 16]);
                } else {
                    ws.close(Some(CloseCode::Normal), "done");
                }
            }
            Event::Message(Message::Binary(data)) => {
                log::info!("binary: {} bytes", data.len());
                sent += 1;
                ws.send_text(format!("message #{sent}"));
            }
            Event::Pong(payload) => log::info!("pong: {payload:?}"),
            Event::Error(err) => log::warn!("error: {err}"),
            Event::End {
                code,
                reason,
                was_clean,
                ..
            } => log::info!("closed with {code} {reason:?} (clean: {was_clean})"),
            _ => {}
        }
    }

    Ok(())
}
