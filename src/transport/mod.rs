//! Transports that move protocol frames to and from the server.
//!
//! | Module      | Purpose                                               |
//! |-------------|-------------------------------------------------------|
//! | `ws`        | WebSocket transport with automatic reconnection       |
//! | `tcp`       | Plain TCP transport, newline-delimited, single-shot   |
//! | `heartbeat` | Liveness bookkeeping shared by transports             |
//!
//! A transport runs as one background task and talks to its owner through
//! two queues: an event stream going up and an outbound text queue going
//! down. Every terminal failure is reported as a `Disconnected` event
//! carrying the same reason as any `Error` or `Timeout` event that preceded
//! it, so owners can treat `Disconnected` as the single source of truth for
//! "this session ended and here is why".

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{ConnectionTarget, Protocol, ServerSettings};
use crate::error::Result;
use crate::protocol::InboundFrame;

pub mod heartbeat;
pub mod tcp;
pub mod ws;

/// Queue depth for both directions of a transport.
pub(crate) const QUEUE_DEPTH: usize = 64;

/// Lifecycle and traffic events reported by a running transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An attempt to reach the server has started.
    Connecting,
    /// The link is up and frames can flow.
    Connected,
    /// The link was lost and another attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// A protocol frame arrived.
    Message(InboundFrame),
    /// Something went wrong; a `Disconnected` with the same reason follows
    /// if the session ends over it.
    Error { reason: String, will_reconnect: bool },
    /// A timeout elapsed; same follow-up rule as `Error`.
    Timeout { reason: String, will_reconnect: bool },
    /// The session is over. This is the last event for the session unless
    /// `will_reconnect` is set, in which case `Reconnecting` follows.
    Disconnected {
        reason: String,
        will_reconnect: bool,
        url: String,
    },
}

/// Timing knobs a transport needs, cut down from the full server settings.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl From<&ServerSettings> for TransportSettings {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            ping_interval: settings.ping_interval(),
            ping_timeout: settings.ping_timeout(),
        }
    }
}

/// A running transport: its queues plus the task that drives it.
pub struct TransportHandle {
    session_id: Uuid,
    url: String,
    events: mpsc::Receiver<TransportEvent>,
    outbound: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    pub fn new(
        session_id: Uuid,
        url: String,
        events: mpsc::Receiver<TransportEvent>,
        outbound: mpsc::Sender<String>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            session_id,
            url,
            events,
            outbound,
            task,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Split the handle into the pieces its owner wires up separately.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<TransportEvent>,
        mpsc::Sender<String>,
        JoinHandle<()>,
    ) {
        (self.events, self.outbound, self.task)
    }
}

/// Opens transports for connection targets. Swapped out in tests.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        target: &ConnectionTarget,
        settings: &TransportSettings,
    ) -> Result<TransportHandle>;
}

/// Factory that picks the real transport for the target protocol.
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(
        &self,
        target: &ConnectionTarget,
        settings: &TransportSettings,
    ) -> Result<TransportHandle> {
        match target.protocol {
            Protocol::Ws => ws::WsTransport::open(target, settings).await,
            Protocol::Tcp => tcp::TcpTransport::open(target, settings).await,
        }
    }
}
