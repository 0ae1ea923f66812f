mod events;
mod reconnect;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::env;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use events::{describe, ClientMessage, ServerEvent};
use reconnect::{Backoff, Reconnect};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let url = env::var("HUB_WS_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string());
    let channels = parse_channels(
        &env::var("WATCH_CHANNELS").unwrap_or_else(|_| "all_sensor_data,alerts".to_string()),
    );

    tokio::select! {
        res = watch(&url, &channels) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

fn parse_channels(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect()
}

/// Follow the hub until the reconnect budget runs out.
async fn watch(url: &str, channels: &[String]) -> Result<()> {
    let mut reconnect = Reconnect::new(Backoff::default());

    loop {
        let Some(attempt) = reconnect.begin_attempt() else {
            bail!("giving up on {url}");
        };
        info!(state = ?reconnect.state(), %url, "connecting");

        match connect_async(url).await {
            Ok((socket, _)) => {
                reconnect.connected();
                info!(%url, "connected");
                let since = Instant::now();
                if let Err(e) = follow(socket, channels).await {
                    warn!("connection lost: {e:#}");
                } else {
                    warn!("hub closed the connection");
                }
                match reconnect.lost(since.elapsed()) {
                    Some(delay) => sleep(delay).await,
                    None => bail!("giving up on {url}: connections keep dropping"),
                }
            }
            Err(e) => {
                warn!(attempt, "connect failed: {e}");
                match reconnect.failed() {
                    Some(delay) => sleep(delay).await,
                    None => bail!("giving up on {url} after {attempt} attempts"),
                }
            }
        }
    }
}

async fn follow(socket: Socket, channels: &[String]) -> Result<()> {
    let (mut write, mut read) = socket.split();

    for channel in channels {
        let text = serde_json::to_string(&ClientMessage::Subscribe { channel: channel.as_str() })?;
        write
            .send(Message::Text(text.into()))
            .await
            .with_context(|| format!("failed to subscribe to {channel}"))?;
    }

    while let Some(msg) = read.next().await {
        match msg.context("read failed")? {
            Message::Text(text) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                Ok(ev @ ServerEvent::Alert(_)) => warn!("{}", describe(&ev)),
                Ok(ev) => info!("{}", describe(&ev)),
                Err(e) => warn!("unparseable event: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
