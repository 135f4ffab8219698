//! Controller link: connect with identity headers, keep the link alive and
//! pump frames between the socket and the agent's channels.
//!
//! # Reconnect policy
//! Each failed connect, and each lost link, counts as one consecutive
//! failure. The delay before the next attempt is `min(30s, 2^failures s)`.
//! The counter resets only once a connection is established.

use std::collections::VecDeque;
use std::time::Duration;

use ds_protocol::AgentMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tracing::{debug, warn};

use crate::identity::DeviceIdentity;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Frames held by the link while the command consumer is behind. Beyond
/// this, new frames are refused with [`BUSY_MESSAGE`].
pub const INBOUND_BACKLOG: usize = 256;

pub const BUSY_MESSAGE: &str = "Agente ocupado: comando descartado";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid connect request: {0}")]
    InvalidRequest(String),
    #[error("connect failed: {0}")]
    Handshake(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connection closed by controller")]
    Closed,
    #[error("no response to keep-alive within {0:?}")]
    KeepAliveTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("gave up reconnecting after {attempts} consecutive failures")]
pub struct ReconnectExhausted {
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Consecutive-failure counter driving the reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    ceiling: u32,
}

impl Backoff {
    /// `ceiling` is the number of consecutive failures after which
    /// [`record_failure`](Self::record_failure) reports exhaustion.
    pub fn new(ceiling: u32) -> Self {
        Self {
            failures: 0,
            ceiling,
        }
    }

    /// Count one failure and return the delay before the next attempt.
    pub fn record_failure(&mut self) -> Result<Duration, ReconnectExhausted> {
        if self.failures >= self.ceiling {
            return Err(ReconnectExhausted {
                attempts: self.failures,
            });
        }
        self.failures += 1;
        Ok(self.delay())
    }

    /// Delay for the current failure count.
    pub fn delay(&self) -> Duration {
        let secs = 1u64.checked_shl(self.failures).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(MAX_BACKOFF)
    }

    /// Only called once a connection has been established.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Open a WebSocket to the controller presenting `identity` as headers.
pub async fn connect(
    url: &str,
    identity: &DeviceIdentity,
    max_message_bytes: usize,
) -> Result<WsStream, ConnectError> {
    let request = build_identity_request(url, identity)?;
    let config = WebSocketConfig::default()
        .max_message_size(Some(max_message_bytes))
        .max_frame_size(Some(max_message_bytes));
    let (ws, _response) = tokio_tungstenite::connect_async_with_config(request, Some(config), false)
        .await
        .map_err(|e| ConnectError::Handshake(e.to_string()))?;
    Ok(ws)
}

pub fn build_identity_request(
    url: &str,
    identity: &DeviceIdentity,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ConnectError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectError::InvalidRequest(format!("invalid URL '{url}': {e}")))?;

    for (name, value) in identity.connect_headers() {
        request.headers_mut().insert(
            name,
            value.parse().map_err(
                |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                    ConnectError::InvalidRequest(format!("invalid {name} header: {e}"))
                },
            )?,
        );
    }

    Ok(request)
}

// ---------------------------------------------------------------------------
// Link I/O
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Pump one live connection until it fails or shutdown is requested.
///
/// Inbound text frames go to `inbound` in arrival order; messages queued on
/// `outbound` are serialized and written. A ping is sent every
/// `keepalive.interval`; if nothing at all is received within
/// `keepalive.timeout` of an outstanding ping the link is declared dead.
///
/// The loop never waits on `inbound`. Frames the consumer cannot take yet are
/// held in a backlog of at most [`INBOUND_BACKLOG`]; past that a frame is
/// answered with an ERROR and dropped. Outbound draining and keep-alive carry
/// on regardless.
///
/// Returns `Ok(())` only when it ended because of shutdown (a Close frame has
/// been sent) or because every outbound sender was dropped.
pub async fn run_link(
    ws: WsStream,
    mut outbound: mpsc::Receiver<AgentMessage>,
    inbound: mpsc::Sender<String>,
    keepalive: KeepAlive,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), LinkError> {
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval_at(Instant::now() + keepalive.interval, keepalive.interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;
    let mut backlog: VecDeque<String> = VecDeque::new();

    loop {
        let deadline = pong_deadline;
        let keepalive_expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            frame = read.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(LinkError::Transport(e.to_string())),
                    None => return Err(LinkError::Closed),
                };
                pong_deadline = None;
                match frame {
                    Message::Text(text) => {
                        let text = text.as_str().to_owned();
                        if !backlog.is_empty() {
                            if backlog.len() < INBOUND_BACKLOG {
                                backlog.push_back(text);
                            } else {
                                warn!(backlog = backlog.len(), "command backlog full, refusing frame");
                                write_message(&mut write, &AgentMessage::error(BUSY_MESSAGE)).await?;
                            }
                            continue;
                        }
                        match inbound.try_send(text) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(text)) => backlog.push_back(text),
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                debug!("command consumer gone, dropping frame");
                            }
                        }
                    }
                    Message::Close(_) => return Err(LinkError::Closed),
                    Message::Binary(_) => debug!("ignoring binary frame"),
                    // Pings are answered by tungstenite; pongs only reset the deadline.
                    _ => {}
                }
            }
            permit = inbound.reserve(), if !backlog.is_empty() => {
                match (permit, backlog.pop_front()) {
                    (Ok(permit), Some(text)) => permit.send(text),
                    (Ok(_), None) => {}
                    (Err(_), _) => {
                        debug!(dropped = backlog.len() + 1, "command consumer gone, dropping backlog");
                        backlog.clear();
                    }
                }
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    return Ok(());
                };
                write_message(&mut write, &msg).await?;
            }
            _ = ping.tick() => {
                write
                    .send(Message::Ping(Default::default()))
                    .await
                    .map_err(|e| LinkError::Transport(e.to_string()))?;
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + keepalive.timeout);
                }
            }
            _ = keepalive_expired => {
                return Err(LinkError::KeepAliveTimeout(keepalive.timeout));
            }
        }
    }
}

async fn write_message<S>(write: &mut S, msg: &AgentMessage) -> Result<(), LinkError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| LinkError::Transport(e.to_string())),
        Err(e) => {
            warn!(kind = msg.kind(), error = %e, "failed to serialize outbound message");
            Ok(())
        }
    }
}
