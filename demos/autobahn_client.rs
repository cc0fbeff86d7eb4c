use anyhow::Result;
use futures::StreamExt;
use tidews::{close::CloseCode, CompressionLevel, Event, Message, Options, WebSocket};

const AGENT: &str = "tidews";

fn connect(path: &str) -> Result<WebSocket> {
    let ws = WebSocket::connect(format!("ws://localhost:9001/{path}").parse()?)
        .with_options(
            Options::default()
                .with_compression_level(CompressionLevel::fast())
                .with_max_payload_read(100 * 1024 * 1024)
                .with_max_read_buffer(200 * 1024 * 1024),
        )
        .start();
    Ok(ws)
}

async fn get_case_count() -> Result<u32> {
    let mut ws = connect("getCaseCount")?;
    let mut count = None;

    while let Some(event) = ws.next().await {
        match event {
            Event::Message(Message::Text(text)) => {
                count = Some(text.parse()?);
                ws.close(Some(CloseCode::Normal), "");
            }
            Event::End { error: Some(err), .. } if count.is_none() => return Err(err.into()),
            _ => {}
        }
    }

    count.ok_or_else(|| anyhow::Error::msg("no case count received"))
}

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let count = get_case_count().await?;
    log::info!("Running {count} cases");

    for case in 1..=count {
        log::debug!("Running {case}");

        let mut ws = connect(&format!("runCase?case={case}&agent={AGENT}"))?;
        while let Some(event) = ws.next().await {
            match event {
                // echo every message back as-is
                Event::Message(message) => ws.send(message),
                Event::End { code, reason, .. } => {
                    log::debug!("case {case} ended with {code} {reason:?}");
                }
                _ => {}
            }
        }
    }

    let mut ws = connect(&format!("updateReports?agent={AGENT}"))?;
    while let Some(event) = ws.next().await {
        if let Event::Open { .. } = event {
            ws.close(Some(CloseCode::Normal), "");
        }
    }

    Ok(())
}
