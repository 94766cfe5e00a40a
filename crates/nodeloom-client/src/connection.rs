//! The one duplex connection.
//!
//! [`ConnectionManager`] owns a single WebSocket, reconnects on a fixed
//! delay forever, and publishes lifecycle transitions and inbound frames on
//! a broadcast channel. It is connection-agnostic of its consumers: domain
//! stores subscribe to [`LinkEvent`]s and route frames by stream name
//! themselves.
//!
//! Delivery rules:
//!
//! - `send` is rejected (never buffered) while the link is not open —
//!   callers re-issue state after reconnect via the resync protocol.
//! - A malformed inbound payload is a transport fault: the connection is
//!   closed and the retry loop takes over; the bad frame is not delivered.
//! - Exactly one reconnect timer exists at any time: the whole lifecycle is
//!   a single run loop, so a fresh attempt structurally supersedes any
//!   pending delay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nodeloom_types::Frame;

use crate::constants::{DEFAULT_WS_URL, LINK_EVENT_BUFFER, RECONNECT_DELAY};

/// Errors surfaced synchronously by [`ConnectionManager::send`].
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The link is not open; the frame was rejected, not buffered.
    #[error("not connected")]
    NotConnected,
    /// The payload could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Events published to consumers: lifecycle transitions plus every inbound
/// frame. Handlers see events in subscription order per receiver.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Open,
    Closed,
    Frame(Frame),
}

/// Transport configuration.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { url: DEFAULT_WS_URL.to_string(), reconnect_delay: RECONNECT_DELAY }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }
}

/// Owns the one duplex connection and its retry loop.
#[derive(Clone)]
pub struct ConnectionManager {
    cfg: ConnectionConfig,
    events: broadcast::Sender<LinkEvent>,
    state: Arc<Mutex<LinkState>>,
    /// Writer half of the live connection; `None` while disconnected.
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    started: Arc<AtomicBool>,
    token: CancellationToken,
}

impl ConnectionManager {
    pub fn new(cfg: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(LINK_EVENT_BUFFER);
        Self {
            cfg,
            events,
            state: Arc::new(Mutex::new(LinkState::Disconnected)),
            outbound: Arc::new(Mutex::new(None)),
            started: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
        }
    }

    /// Subscribe to lifecycle events and inbound frames.
    ///
    /// Subscribe before calling [`connect`](Self::connect) to observe the
    /// first `Open`.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Start the connection run loop. Idempotent — later calls are no-ops;
    /// the loop itself retries indefinitely on the fixed delay.
    pub fn connect(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(run(
            self.cfg.clone(),
            self.events.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.outbound),
            self.token.clone(),
        ));
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Serialize `{stream, data}` and transmit it.
    ///
    /// Fails with [`LinkError::NotConnected`] unless the link is open; a
    /// frame is never queued across a disconnect.
    pub fn send(&self, stream: &str, data: serde_json::Value) -> Result<(), LinkError> {
        let frame = Frame::new(stream, data);
        let text = serde_json::to_string(&frame)?;
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(LinkError::NotConnected);
        };
        tx.send(Message::Text(text)).map_err(|_| LinkError::NotConnected)
    }

    /// Deterministic teardown: close the socket if open and stop retrying.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

/// The connection lifecycle: connect, pump, tear down, wait, repeat.
async fn run(
    cfg: ConnectionConfig,
    events: broadcast::Sender<LinkEvent>,
    state: Arc<Mutex<LinkState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    token: CancellationToken,
) {
    loop {
        *state.lock() = LinkState::Connecting;
        let attempt = tokio::select! {
            _ = token.cancelled() => break,
            attempt = connect_async(cfg.url.as_str()) => attempt,
        };
        let ws = match attempt {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!("connect to {} failed: {e}", cfg.url);
                *state.lock() = LinkState::Disconnected;
                if retry_delay(&cfg, &token).await {
                    continue;
                }
                break;
            }
        };

        info!("connection open: {}", cfg.url);
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *outbound.lock() = Some(tx);
        *state.lock() = LinkState::Open;
        let _ = events.send(LinkEvent::Open);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    *state.lock() = LinkState::Closing;
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                queued = rx.recv() => {
                    // rx stays live while `outbound` holds the sender.
                    if let Some(msg) = queued {
                        if let Err(e) = sink.send(msg).await {
                            warn!("send failed, closing: {e}");
                            break;
                        }
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            let _ = events.send(LinkEvent::Frame(frame));
                        }
                        Err(e) => {
                            error!("malformed inbound frame, closing connection: {e}");
                            break;
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        error!("unexpected binary frame, closing connection");
                        break;
                    }
                    // Ping/pong and the close handshake are handled by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("transport error: {e}");
                        break;
                    }
                    None => {
                        info!("connection closed by server");
                        break;
                    }
                },
            }
        }

        outbound.lock().take();
        *state.lock() = LinkState::Disconnected;
        let _ = events.send(LinkEvent::Closed);

        if token.is_cancelled() || !retry_delay(&cfg, &token).await {
            break;
        }
    }

    outbound.lock().take();
    *state.lock() = LinkState::Disconnected;
}

/// Wait out the fixed reconnect delay. Returns false when shutdown wins.
async fn retry_delay(cfg: &ConnectionConfig, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(cfg.reconnect_delay) => true,
    }
}
