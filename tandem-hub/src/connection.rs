//! Per-connection plumbing: stable handles, outbound queues and the
//! WebSocket driver loop.
//!
//! ```text
//!  socket ──read──► driver loop ──dispatch──► Hub / Session
//!    ▲                  │ ping timer
//!    │                  ▼
//!  writer task ◄── outbound queue ◄── ConnectionHandle::send (non-blocking)
//! ```
//!
//! Sessions never touch sockets. They hold a `ConnectionHandle` that
//! pushes frames onto an unbounded queue drained by a writer task, so a
//! slow peer never stalls dispatch. When the writer dies, the queue closes
//! and the next send fails, which tears the connection down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::hub::Hub;

/// Opaque, stable identity of a connection within a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Arc<Vec<u8>>),
    Ping,
    Close,
}

/// The transport rejected a frame. Terminal for that connection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Connection {0} is not open")]
pub struct TransportSendError(pub ConnectionId);

/// Sending half of a connection, owned by the session it is registered in.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer drains.
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { id, outbound }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the writer side is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a binary frame without waiting on the socket.
    pub fn send(&self, frame: Arc<Vec<u8>>) -> Result<(), TransportSendError> {
        self.push(Outbound::Binary(frame))
    }

    /// Queue a liveness ping.
    pub fn ping(&self) -> Result<(), TransportSendError> {
        self.push(Outbound::Ping)
    }

    /// Ask the writer to close the socket. No-op if it already has.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    fn push(&self, frame: Outbound) -> Result<(), TransportSendError> {
        if !self.is_open() {
            return Err(TransportSendError(self.id));
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportSendError(self.id))
    }
}

/// Outcome of a liveness tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// Peer answered the last ping; send another.
    Ping,
    /// No answer since the last ping.
    Unresponsive,
}

/// Ping/pong bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct Liveness {
    pong_received: bool,
}

impl Liveness {
    pub fn new() -> Self {
        Self { pong_received: true }
    }

    /// Record a pong from the peer.
    pub fn acknowledge(&mut self) {
        self.pong_received = true;
    }

    /// Called once per heartbeat interval.
    pub fn tick(&mut self) -> Heartbeat {
        if !self.pong_received {
            return Heartbeat::Unresponsive;
        }
        self.pong_received = false;
        Heartbeat::Ping
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Session name addressed by a request path: leading `/` stripped, query ignored.
pub fn session_name_from_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or_default();
    path.strip_prefix('/').unwrap_or(path).to_string()
}

/// Drive one accepted WebSocket until it closes.
///
/// Registers the connection in `name`'s session, dispatches inbound
/// binary frames in arrival order and checks liveness every
/// `ping_interval`. Pings from the peer are answered by the WebSocket
/// layer itself. Always deregisters before returning.
pub async fn serve_connection(hub: Arc<Hub>, ws: WebSocket, name: String) {
    let id = hub.next_connection_id();
    let (handle, mut outbound_rx) = ConnectionHandle::new(id);
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                Outbound::Binary(data) => Message::Binary(data.to_vec().into()),
                Outbound::Ping => Message::Ping(Vec::new().into()),
                Outbound::Close => {
                    let _ = ws_sender.close().await;
                    break;
                }
            };
            if let Err(e) = ws_sender.send(message).await {
                log::debug!("Write to {id} failed: {e}");
                break;
            }
        }
    });

    let session = hub.connect(&name, handle.clone()).await;
    log::info!("{id} joined session '{name}'");

    let period = ping_period(hub.config().ping_interval);
    let mut heartbeat = heartbeat_timer(period);
    let mut liveness = Liveness::new();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        // Decode failures are logged by the hub; the connection stays up.
                        let _ = hub.dispatch(&session, id, &data).await;
                    }
                    Some(Ok(Message::Pong(_))) => liveness.acknowledge(),
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("{id} closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket error on {id}: {e}");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                match liveness.tick() {
                    Heartbeat::Ping => {
                        if handle.ping().is_err() {
                            break;
                        }
                    }
                    Heartbeat::Unresponsive => {
                        log::warn!("{id} did not answer ping within {period:?}, closing");
                        break;
                    }
                }
            }

            _ = &mut writer => {
                log::debug!("Writer for {id} stopped");
                break;
            }
        }
    }

    hub.close(&session, id).await;
}

fn ping_period(configured: Duration) -> Duration {
    configured.max(Duration::from_millis(1))
}

/// Heartbeat timer whose first tick is one period out. Ticks missed while the
/// loop was busy are not replayed back to back.
fn heartbeat_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}
