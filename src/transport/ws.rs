//! WebSocket transport.
//!
//! Runs as a single task that owns the socket and retries lost links on its
//! own, doubling the wait between attempts up to a cap. Liveness is probed
//! with protocol-level pings; the first probe goes out as soon as the link
//! is up.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{handshake::client::generate_key, http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ConnectionTarget;
use crate::error::{GroundlinkError, Result};
use crate::protocol::decode_frame;
use crate::transport::{TransportEvent, TransportHandle, TransportSettings, QUEUE_DEPTH};

/// Disconnection reasons the transport recovers from by itself. Everything
/// else ends the session for good.
const WILL_RECONNECT: &[&str] = &["ping timeout", "transport close"];

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

pub struct WsTransport;

impl WsTransport {
    pub async fn open(
        target: &ConnectionTarget,
        settings: &TransportSettings,
    ) -> Result<TransportHandle> {
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let session_id = Uuid::new_v4();
        let url = target.url.clone();
        let task = tokio::spawn(run_ws(url.clone(), *settings, event_tx, outbound_rx));
        Ok(TransportHandle::new(
            session_id,
            url,
            event_rx,
            outbound_tx,
            task,
        ))
    }
}

async fn run_ws(
    url: String,
    settings: TransportSettings,
    events: mpsc::Sender<TransportEvent>,
    mut outbound: mpsc::Receiver<String>,
) {
    let mut attempt: u32 = 0;
    let mut delay = INITIAL_RECONNECT_DELAY;

    if events.send(TransportEvent::Connecting).await.is_err() {
        return;
    }

    loop {
        match connect(&url, settings.connect_timeout).await {
            Ok(stream) => {
                attempt = 0;
                delay = INITIAL_RECONNECT_DELAY;
                info!(url = %url, "WebSocket connected");
                if events.send(TransportEvent::Connected).await.is_err() {
                    return;
                }

                let reason = drive_session(stream, &settings, &events, &mut outbound).await;
                let will_reconnect = WILL_RECONNECT.contains(&reason.as_str());
                warn!(url = %url, reason = %reason, will_reconnect, "WebSocket session ended");
                if events
                    .send(TransportEvent::Disconnected {
                        reason,
                        will_reconnect,
                        url: url.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                if !will_reconnect {
                    return;
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(url = %url, error = %reason, "WebSocket connect failed");
                if events
                    .send(TransportEvent::Error {
                        reason,
                        will_reconnect: true,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }

        attempt += 1;
        let wait = jittered(delay);
        if events
            .send(TransportEvent::Reconnecting {
                attempt,
                delay: wait,
            })
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(wait).await;
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

async fn connect(
    url: &str,
    connect_timeout: Duration,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let request = Request::builder()
        .uri(url)
        .header("Host", host_header(url))
        .header("Origin", "http://localhost")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())
        .map_err(|e| GroundlinkError::Transport(format!("Failed to build request: {e}")))?;

    match timeout(connect_timeout, connect_async_with_config(request, None, false)).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(e)) => Err(GroundlinkError::Transport(format!(
            "WebSocket connect failed: {e}"
        ))),
        Err(_) => Err(GroundlinkError::Timeout("WebSocket connect".to_string())),
    }
}

/// Pump frames in both directions until the session dies, returning why.
async fn drive_session(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    settings: &TransportSettings,
    events: &mpsc::Sender<TransportEvent>,
    outbound: &mut mpsc::Receiver<String>,
) -> String {
    let (mut sink, mut stream) = stream.split();
    // first tick fires immediately, so the first probe goes out right away
    let mut ping_timer = interval(settings.ping_interval);
    let mut awaiting_pong = false;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                    Ok(frame) => {
                        if events.send(TransportEvent::Message(frame)).await.is_err() {
                            return "io client disconnect".to_string();
                        }
                    }
                    Err(e) => error!(error = %e, "Dropping undecodable frame"),
                },
                Some(Ok(Message::Pong(_))) => {
                    awaiting_pong = false;
                    last_pong = Instant::now();
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        return "transport close".to_string();
                    }
                }
                Some(Ok(Message::Close(_))) => return "io server disconnect".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("transport error: {e}"),
                None => return "transport close".to_string(),
            },
            _ = ping_timer.tick() => {
                if awaiting_pong && last_pong.elapsed() >= settings.ping_timeout {
                    return "ping timeout".to_string();
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return "transport close".to_string();
                }
            }
            text = outbound.recv() => match text {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        return "transport close".to_string();
                    }
                }
                None => return "io client disconnect".to_string(),
            },
        }
    }
}

fn host_header(url: &str) -> &str {
    let without_scheme = url.split("//").last().unwrap_or("localhost");
    without_scheme.split('/').next().unwrap_or(without_scheme)
}

fn jittered(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 4) as u64;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_header() {
        assert_eq!(host_header("ws://localhost:5000"), "localhost:5000");
        assert_eq!(host_header("ws://10.0.0.7:5000/path"), "10.0.0.7:5000");
        assert_eq!(host_header("no-scheme"), "no-scheme");
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let base = Duration::from_millis(400);
        for _ in 0..50 {
            let wait = jittered(base);
            assert!(wait >= base);
            assert!(wait <= base + Duration::from_millis(100));
        }
        assert_eq!(jittered(Duration::from_millis(2)), Duration::from_millis(2));
    }

    #[test]
    fn test_reconnect_reasons() {
        assert!(WILL_RECONNECT.contains(&"ping timeout"));
        assert!(WILL_RECONNECT.contains(&"transport close"));
        assert!(!WILL_RECONNECT.contains(&"io server disconnect"));
        assert!(!WILL_RECONNECT.contains(&"io client disconnect"));
    }
}
