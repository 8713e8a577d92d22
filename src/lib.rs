//! Groundlink - connection manager for a flight control server
//!
//! Groundlink keeps a ground station talking to its server: it dials the
//! configured transport, runs the post-connect handshake that fills the
//! world model, watches the link's health and classifies every way the
//! session can end so the operator hears about each incident exactly once.
//!
//! ## Components
//!
//! - **Connection**: session lifecycle, one live session at a time
//! - **Transport**: WebSocket (self-reconnecting) and TCP (single-shot)
//! - **Channel**: request/response correlation and push subscriptions
//! - **Bootstrap**: the handshake that loads server state after connect
//! - **Launcher**: optional supervision of a server process on this host
//! - **Model**: client-side copy of the server's world state

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod launcher;
pub mod model;
pub mod notices;
pub mod protocol;
pub mod skew;
pub mod transport;

pub use bootstrap::{BootstrapReport, StepOutcome};
pub use channel::{MessageChannel, ServerChannel};
pub use config::{ConnectionTarget, LocalServerSettings, Protocol, ServerSettings};
pub use connection::{ConnectionState, ServerConnection};
pub use error::{GroundlinkError, Result};
pub use model::WorldModel;
pub use notices::{LogNotifier, Notice, Notifier, Severity};
pub use transport::{
    DefaultTransportFactory, TransportEvent, TransportFactory, TransportHandle, TransportSettings,
};
