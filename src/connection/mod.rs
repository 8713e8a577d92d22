//! Connection lifecycle management.
//!
//! A [`ServerConnection`] owns at most one live session at a time: the
//! transport task, the event pump, the request channel binding, the model
//! subscriptions and, when configured, a local server process. Opening a
//! connection towards a new target tears the previous session down
//! completely before anything new is dialed, and remote disconnections are
//! funneled through one classifier so the user hears about each incident
//! exactly once.

pub mod classifier;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bootstrap::{self, BootstrapContext, BootstrapReport, SessionGate};
use crate::channel::{MessageChannel, ServerChannel, Subscription};
use crate::config::{ConnectionTarget, ServerSettings};
use crate::error::{GroundlinkError, Result};
use crate::launcher::{LaunchOptions, LocalServerSupervisor};
use crate::model::{BeaconInfo, ClockInfo, ConnectionInfo, DockInfo, WorldModel};
use crate::notices::{Notice, Notifier};
use crate::protocol;
use crate::transport::{TransportEvent, TransportFactory, TransportSettings};

use self::classifier::{classify_disconnect, should_mark_inactive, DisconnectVerdict};

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        write!(f, "{name}")
    }
}

struct ActiveSession {
    session_id: Uuid,
    target: ConnectionTarget,
    transport_task: JoinHandle<()>,
    pump: JoinHandle<()>,
    subscriptions: Vec<Subscription>,
}

struct Core {
    channel: Arc<ServerChannel>,
    model: Arc<WorldModel>,
    notifier: Arc<dyn Notifier>,
    factory: Arc<dyn TransportFactory>,
    launcher: LocalServerSupervisor,
    state: watch::Sender<ConnectionState>,
    active: Mutex<Option<ActiveSession>>,
    bootstrap: Mutex<Option<JoinHandle<BootstrapReport>>>,
    epoch: Arc<AtomicU64>,
}

/// Manager for the connection to one server at a time.
pub struct ServerConnection {
    core: Arc<Core>,
}

impl ServerConnection {
    pub fn new(
        channel: Arc<ServerChannel>,
        model: Arc<WorldModel>,
        notifier: Arc<dyn Notifier>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            core: Arc::new(Core {
                channel,
                model,
                notifier,
                factory,
                launcher: LocalServerSupervisor::new(),
                state,
                active: Mutex::new(None),
                bootstrap: Mutex::new(None),
                epoch: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Open a connection to the server described by the settings.
    ///
    /// Opening towards the URL we are already connected to is a no-op;
    /// opening towards a different URL tears the old session down first and
    /// only dials once that teardown has finished. Errors in the settings
    /// come back to the caller directly, while everything that happens to
    /// the session afterwards is reported through the notifier and the
    /// state watch.
    pub async fn open(&self, settings: &ServerSettings) -> Result<()> {
        let target = ConnectionTarget::from_settings(settings)?;
        let core = &self.core;
        let mut active = core.active.lock().await;

        if active.is_some() {
            let stale = *core.state.borrow() == ConnectionState::Disconnected;
            if !stale {
                match active.as_ref() {
                    Some(session) if session.target.url == target.url => {
                        debug!(url = %target.url, "Already connected to this server");
                        return Ok(());
                    }
                    Some(session) => {
                        info!(old = %session.target.url, new = %target.url, "Switching servers");
                        core.state.send_replace(ConnectionState::Disconnecting);
                        core.notify_verdict(&classify_disconnect("io client disconnect", false));
                    }
                    None => {}
                }
            }
            if let Some(old) = active.take() {
                core.teardown(old).await;
            }
        }

        if settings.local.enabled {
            let options = local_launch_options(settings)?;
            let exit = core.launcher.ensure_running(options).await?;
            let watcher = Arc::clone(core);
            tokio::spawn(async move {
                // terminate() drops the sender without a message, so this
                // only fires when the process dies on its own
                if let Ok(message) = exit.await {
                    error!("{message}");
                    watcher.notifier.notify(Notice::error(message));
                    watcher.disconnect_all(false).await;
                }
            });
        }

        core.epoch.fetch_add(1, Ordering::SeqCst);
        let gate = SessionGate::new(Arc::clone(&core.epoch));

        core.model.set_connecting_url(Some(target.url.clone())).await;
        core.state.send_replace(ConnectionState::Connecting);
        info!(url = %target.url, "Connecting to server");

        let transport_settings = TransportSettings::from(settings);
        let handle = match core.factory.open(&target, &transport_settings).await {
            Ok(handle) => handle,
            Err(e) => {
                core.model.set_connecting_url(None).await;
                core.launcher.terminate().await;
                core.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let session_id = handle.session_id();
        let (events, outbound, transport_task) = handle.into_parts();
        core.channel.bind(outbound).await;
        let subscriptions = install_model_subscriptions(core);

        let pump = {
            let core = Arc::clone(core);
            let target = target.clone();
            let skew_warning_ms = settings.clock_skew_warning_ms as i64;
            tokio::spawn(pump_events(core, events, gate, skew_warning_ms, target))
        };

        *active = Some(ActiveSession {
            session_id,
            target,
            transport_task,
            pump,
            subscriptions,
        });
        Ok(())
    }

    /// Close the connection and tear the session down. Idempotent; also
    /// stops a local server that was left running without a session.
    pub async fn close(&self) {
        self.core.disconnect_all(true).await;
    }

    /// Watch receiver that follows every state change.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.core.state.borrow()
    }

    /// The channel requests should go through. Usable whenever the state is
    /// connected; requests at other times fail cleanly.
    pub fn channel(&self) -> Arc<dyn MessageChannel> {
        self.core.channel.clone()
    }

    pub fn model(&self) -> Arc<WorldModel> {
        Arc::clone(&self.core.model)
    }

    pub async fn current_url(&self) -> Option<String> {
        if self.current_state() == ConnectionState::Disconnected {
            return None;
        }
        self.core
            .active
            .lock()
            .await
            .as_ref()
            .map(|session| session.target.url.clone())
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        if self.current_state() == ConnectionState::Disconnected {
            return None;
        }
        self.core
            .active
            .lock()
            .await
            .as_ref()
            .map(|session| session.session_id)
    }

    /// Wait for the handshake of the current session and return its report.
    /// Returns `None` when no handshake is running.
    pub async fn wait_bootstrap(&self) -> Option<BootstrapReport> {
        let handle = self.core.bootstrap.lock().await.take()?;
        handle.await.ok()
    }
}

impl Core {
    fn notify_verdict(&self, verdict: &DisconnectVerdict) {
        match verdict.severity {
            Some(severity) => self
                .notifier
                .notify(Notice::new(severity, verdict.message.clone())),
            None => debug!("{}", verdict.message),
        }
    }

    /// Tear everything down, optionally telling the user why.
    async fn disconnect_all(&self, user_initiated: bool) {
        let mut active = self.active.lock().await;
        let session = match active.take() {
            Some(session) => session,
            None => {
                // no session, but a local server may still be up
                self.launcher.terminate().await;
                return;
            }
        };

        let was_live = *self.state.borrow() != ConnectionState::Disconnected;
        if was_live {
            self.state.send_replace(ConnectionState::Disconnecting);
            if user_initiated {
                self.notify_verdict(&classify_disconnect("io client disconnect", false));
            }
        }
        self.teardown(session).await;
    }

    /// Take a session apart. Both session tasks are fully stopped before
    /// the shared pieces are reset, so nothing from the old session can run
    /// once this returns.
    async fn teardown(&self, session: ActiveSession) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        for subscription in session.subscriptions {
            subscription.unsubscribe();
        }
        session.pump.abort();
        session.transport_task.abort();
        let _ = session.pump.await;
        let _ = session.transport_task.await;

        self.channel.unbind().await;
        // a handshake still in flight keeps running detached; the epoch
        // bump above keeps it inert
        let _ = self.bootstrap.lock().await.take();
        self.launcher.terminate().await;
        self.model.clear_server_state().await;

        let connecting = self.model.connecting_url().await;
        if should_mark_inactive(&session.target.url, connecting.as_deref()) {
            self.model.set_connecting_url(None).await;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!(url = %session.target.url, "Session closed");
    }

    /// Reset shared state after the transport ended on its own.
    ///
    /// Runs on the pump task, so it must never touch the active-session
    /// lock; the stale entry left behind is recognized by `open` and
    /// `close` through the disconnected state.
    async fn finalize_remote_disconnect(&self, url: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.channel.unbind().await;
        let _ = self.bootstrap.lock().await.take();
        self.launcher.terminate().await;
        self.model.clear_server_state().await;

        let connecting = self.model.connecting_url().await;
        if should_mark_inactive(url, connecting.as_deref()) {
            self.model.set_connecting_url(None).await;
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

async fn pump_events(
    core: Arc<Core>,
    mut events: mpsc::Receiver<TransportEvent>,
    gate: SessionGate,
    skew_warning_ms: i64,
    target: ConnectionTarget,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connecting => {
                core.state.send_replace(ConnectionState::Connecting);
            }
            TransportEvent::Connected => {
                core.state.send_replace(ConnectionState::Connected);
                core.notifier
                    .notify(Notice::info(format!("Connected to {}", target.url)));

                let channel: Arc<dyn MessageChannel> = core.channel.clone();
                let context = BootstrapContext {
                    channel,
                    model: Arc::clone(&core.model),
                    notifier: Arc::clone(&core.notifier),
                    gate: gate.clone(),
                    state: core.state.subscribe(),
                    skew_warning_ms,
                };
                let handle = tokio::spawn(bootstrap::run(context));
                // a reconnect can land while the previous handshake is
                // still going; only one may write to the model
                if let Some(old) = core.bootstrap.lock().await.replace(handle) {
                    old.abort();
                }
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                core.state.send_replace(ConnectionState::Connecting);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before next attempt");
            }
            TransportEvent::Message(frame) => {
                core.channel.dispatch(frame).await;
            }
            TransportEvent::Error {
                reason,
                will_reconnect,
            }
            | TransportEvent::Timeout {
                reason,
                will_reconnect,
            } => {
                // advisory only; if the session ends over this, the
                // matching disconnect event carries the same reason
                if will_reconnect {
                    core.state.send_replace(ConnectionState::Connecting);
                    debug!(reason = %reason, "Transport attempt failed, it will retry");
                } else {
                    warn!(reason = %reason, "Transport error");
                }
            }
            TransportEvent::Disconnected {
                reason,
                will_reconnect,
                url,
            } => {
                let verdict = classify_disconnect(&reason, will_reconnect);
                core.notify_verdict(&verdict);
                if will_reconnect {
                    core.state.send_replace(ConnectionState::Connecting);
                    core.channel.fail_pending("connection reset").await;
                } else {
                    core.finalize_remote_disconnect(&url).await;
                    break;
                }
            }
        }
    }
}

fn local_launch_options(settings: &ServerSettings) -> Result<LaunchOptions> {
    let program = settings.local.binary_path.clone().ok_or_else(|| {
        GroundlinkError::Config(
            "Local server launch requested without a binary path".to_string(),
        )
    })?;
    let mut args = settings.local.args.clone();
    args.push("--port".to_string());
    args.push(settings.port.to_string());
    Ok(LaunchOptions {
        program,
        args,
        startup_grace: settings.local.startup_grace(),
    })
}

/// Push updates for the entity maps arrive as notifications with the same
/// shape as the poll responses, so one handler per type keeps the model
/// current between handshakes.
fn install_model_subscriptions(core: &Arc<Core>) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();

    let model = Arc::clone(&core.model);
    subscriptions.push(core.channel.subscribe(
        protocol::CONN_INF,
        Arc::new(move |frame| {
            match protocol::parse_status_map::<ConnectionInfo>(&frame.body) {
                Ok(entries) => {
                    for (id, info) in entries {
                        model.upsert_connection(id, info);
                    }
                }
                Err(e) => debug!(error = %e, "Bad connection update"),
            }
        }),
    ));

    let model = Arc::clone(&core.model);
    subscriptions.push(core.channel.subscribe(
        protocol::CLK_INF,
        Arc::new(move |frame| {
            match protocol::parse_status_map::<ClockInfo>(&frame.body) {
                Ok(entries) => {
                    for (id, info) in entries {
                        model.upsert_clock(id, info);
                    }
                }
                Err(e) => debug!(error = %e, "Bad clock update"),
            }
        }),
    ));

    let model = Arc::clone(&core.model);
    subscriptions.push(core.channel.subscribe(
        protocol::DOCK_INF,
        Arc::new(move |frame| {
            match protocol::parse_status_map::<DockInfo>(&frame.body) {
                Ok(entries) => {
                    for (id, info) in entries {
                        model.upsert_dock(id, info);
                    }
                }
                Err(e) => debug!(error = %e, "Bad docking station update"),
            }
        }),
    ));

    let model = Arc::clone(&core.model);
    subscriptions.push(core.channel.subscribe(
        protocol::BCN_INF,
        Arc::new(move |frame| {
            match protocol::parse_status_map::<BeaconInfo>(&frame.body) {
                Ok(entries) => {
                    for (id, info) in entries {
                        model.upsert_beacon(id, info);
                    }
                }
                Err(e) => debug!(error = %e, "Bad beacon update"),
            }
        }),
    ));

    subscriptions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalServerSettings;
    use std::path::PathBuf;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
    }

    #[test]
    fn test_local_launch_options() {
        let mut settings = ServerSettings::default();
        settings.local = LocalServerSettings {
            enabled: true,
            binary_path: None,
            args: vec!["--quiet".to_string()],
            startup_grace_ms: 2000,
        };
        assert!(local_launch_options(&settings).is_err());

        settings.local.binary_path = Some(PathBuf::from("/opt/server"));
        let options = local_launch_options(&settings).unwrap();
        assert_eq!(options.program, PathBuf::from("/opt/server"));
        assert_eq!(
            options.args,
            vec![
                "--quiet".to_string(),
                "--port".to_string(),
                "5000".to_string()
            ]
        );
    }
}
