//! Handshake that runs after every successful connect.
//!
//! The first three steps are mandatory: without the server version, the
//! connection list and the clock list the session is not usable, so any of
//! them failing aborts the rest of the handshake. Everything after that is
//! best effort. The clock skew measurement deliberately runs last, when the
//! request pipeline has quieted down and round trips are short.
//!
//! Every step re-checks the session gate before touching the model, so a
//! handshake that outlives its session cannot leak stale data into the next
//! one.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::connection::ConnectionState;
use crate::error::{GroundlinkError, Result};
use crate::model::WorldModel;
use crate::notices::{Notice, Notifier};
use crate::protocol;
use crate::skew::{format_clock_skew, measure_clock_skew, SkewMethod};

/// Extensions probed during the handshake. Whichever of these the server
/// has loaded become feature flags on the world model.
pub const OPTIONAL_EXTENSIONS: &[&str] = &[
    "dock",
    "lps",
    "mission",
    "show",
    "timecode",
    "virtual_uavs",
];

/// Tells a running handshake whether its session is still the current one.
#[derive(Debug, Clone)]
pub struct SessionGate {
    current: Arc<AtomicU64>,
    epoch: u64,
}

impl SessionGate {
    /// Capture the current epoch; the gate stays live until it changes.
    pub fn new(current: Arc<AtomicU64>) -> Self {
        let epoch = current.load(Ordering::SeqCst);
        Self { current, epoch }
    }

    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StepOutcome {
    Success,
    Failed(String),
    #[default]
    Skipped,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }
}

/// What happened in each step of one handshake run.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub version: StepOutcome,
    pub connections: StepOutcome,
    pub clocks: StepOutcome,
    pub docks: StepOutcome,
    pub beacons: StepOutcome,
    pub extensions: StepOutcome,
    pub license: StepOutcome,
    pub show_sync: StepOutcome,
    pub device_tree: StepOutcome,
    pub clock_skew: StepOutcome,
}

impl BootstrapReport {
    /// True when the mandatory steps all came through.
    pub fn ready(&self) -> bool {
        self.version.is_success() && self.connections.is_success() && self.clocks.is_success()
    }
}

/// Everything a handshake run needs from the connection that spawned it.
pub struct BootstrapContext {
    pub channel: Arc<dyn MessageChannel>,
    pub model: Arc<WorldModel>,
    pub notifier: Arc<dyn Notifier>,
    pub gate: SessionGate,
    pub state: watch::Receiver<ConnectionState>,
    pub skew_warning_ms: i64,
}

/// Notices are only worth showing while this session is still current and
/// the link is actually up; during a silent reconnect or a teardown they
/// would just confuse.
fn can_surface(ctx: &BootstrapContext) -> bool {
    ctx.gate.is_live() && *ctx.state.borrow() == ConnectionState::Connected
}

fn fail_mandatory(ctx: &BootstrapContext, message: &str, error: &GroundlinkError) -> StepOutcome {
    warn!(error = %error, "{message}");
    if can_surface(ctx) {
        ctx.notifier.notify(Notice::error(message.to_string()));
    }
    StepOutcome::Failed(error.to_string())
}

/// Run the whole handshake, returning what happened per step.
pub async fn run(ctx: BootstrapContext) -> BootstrapReport {
    let mut report = BootstrapReport::default();

    // 1. server version
    if !ctx.gate.is_live() {
        return report;
    }
    match ctx.channel.system_version().await {
        Ok(version) => {
            info!(version = %version, "Server version received");
            if ctx.gate.is_live() {
                ctx.model.set_version(Some(version)).await;
            }
            report.version = StepOutcome::Success;
        }
        Err(e) => {
            report.version = fail_mandatory(
                &ctx,
                "Failed to retrieve the version number of the server",
                &e,
            );
            return report;
        }
    }

    // 2. connection list
    if !ctx.gate.is_live() {
        return report;
    }
    match load_connections(&ctx).await {
        Ok(()) => report.connections = StepOutcome::Success,
        Err(e) => {
            report.connections = fail_mandatory(
                &ctx,
                "Failed to retrieve the list of connections from the server",
                &e,
            );
            return report;
        }
    }

    // 3. clock list
    if !ctx.gate.is_live() {
        return report;
    }
    match load_clocks(&ctx).await {
        Ok(()) => report.clocks = StepOutcome::Success,
        Err(e) => {
            report.clocks = fail_mandatory(
                &ctx,
                "Failed to retrieve the list of clocks from the server",
                &e,
            );
            return report;
        }
    }

    // 4. docking stations, if any exist
    if !ctx.gate.is_live() {
        return report;
    }
    report.docks = match load_docks(&ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(error = %e, "Docking station info unavailable");
            StepOutcome::Failed(e.to_string())
        }
    };

    // 5. beacons, if any exist
    if !ctx.gate.is_live() {
        return report;
    }
    report.beacons = match load_beacons(&ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(error = %e, "Beacon info unavailable");
            StepOutcome::Failed(e.to_string())
        }
    };

    // 6. extension probes, each one on its own
    if !ctx.gate.is_live() {
        return report;
    }
    for name in OPTIONAL_EXTENSIONS.iter().copied() {
        match ctx.channel.is_extension_loaded(name).await {
            Ok(true) => {
                if ctx.gate.is_live() {
                    ctx.model.add_feature(name).await;
                }
            }
            Ok(false) => {}
            Err(e) => debug!(extension = name, error = %e, "Extension probe failed"),
        }
    }
    report.extensions = StepOutcome::Success;

    // 7. license info
    if !ctx.gate.is_live() {
        return report;
    }
    match ctx.channel.license_info().await {
        Ok(license) => {
            if ctx.gate.is_live() {
                ctx.model.set_license(Some(license)).await;
            }
            report.license = StepOutcome::Success;
        }
        Err(e) => {
            debug!(error = %e, "License info unavailable");
            report.license = StepOutcome::Failed(e.to_string());
        }
    }

    // 8. upload our show settings when the server can take them
    if !ctx.gate.is_live() {
        return report;
    }
    report.show_sync = sync_show_settings(&ctx).await;

    // 9. device tree subscription, fire and forget
    if !ctx.gate.is_live() {
        return report;
    }
    report.device_tree = match ctx
        .channel
        .send_forget(json!({"type": protocol::DEV_LISTSUB, "paths": []}).into())
        .await
    {
        Ok(()) => StepOutcome::Success,
        Err(e) => {
            debug!(error = %e, "Device tree subscription failed");
            StepOutcome::Failed(e.to_string())
        }
    };

    // 10. clock skew, last so the pipeline is quiet
    if !ctx.gate.is_live() {
        return report;
    }
    report.clock_skew = match measure_clock_skew(ctx.channel.as_ref(), SkewMethod::Threshold).await
    {
        Ok(sample) => {
            debug!(
                skew_ms = sample.skew_ms,
                round_trip_ms = sample.round_trip_ms(),
                "Clock skew measured"
            );
            if ctx.gate.is_live() {
                ctx.model.set_clock_skew_ms(Some(sample.skew_ms)).await;
            }
            maybe_warn_about_skew(&ctx, sample.skew_ms);
            StepOutcome::Success
        }
        Err(e) => {
            debug!(error = %e, "Clock skew measurement failed");
            StepOutcome::Failed(e.to_string())
        }
    };

    info!(ready = report.ready(), "Handshake finished");
    report
}

async fn load_connections(ctx: &BootstrapContext) -> Result<()> {
    let ids = ctx.channel.connection_ids().await?;
    if ids.is_empty() {
        if ctx.gate.is_live() {
            ctx.model.replace_connections(Vec::new());
        }
        return Ok(());
    }
    let info = ctx.channel.connection_info(&ids).await?;
    if ctx.gate.is_live() {
        ctx.model.replace_connections(info);
    }
    Ok(())
}

async fn load_clocks(ctx: &BootstrapContext) -> Result<()> {
    let ids = ctx.channel.clock_ids().await?;
    if ids.is_empty() {
        if ctx.gate.is_live() {
            ctx.model.replace_clocks(Vec::new());
        }
        return Ok(());
    }
    let info = ctx.channel.clock_info(&ids).await?;
    if ctx.gate.is_live() {
        ctx.model.replace_clocks(info);
    }
    Ok(())
}

async fn load_docks(ctx: &BootstrapContext) -> Result<StepOutcome> {
    let ids = ctx.channel.object_ids("dock").await?;
    if ids.is_empty() {
        return Ok(StepOutcome::Skipped);
    }
    let info = ctx.channel.dock_info(&ids).await?;
    if ctx.gate.is_live() {
        ctx.model.replace_docks(info);
    }
    Ok(StepOutcome::Success)
}

async fn load_beacons(ctx: &BootstrapContext) -> Result<StepOutcome> {
    let ids = ctx.channel.object_ids("beacon").await?;
    if ids.is_empty() {
        return Ok(StepOutcome::Skipped);
    }
    let info = ctx.channel.beacon_info(&ids).await?;
    if ctx.gate.is_live() {
        ctx.model.replace_beacons(info);
    }
    match ctx.channel.beacon_properties(&ids).await {
        Ok(properties) => {
            if ctx.gate.is_live() {
                for (id, props) in properties {
                    ctx.model.set_beacon_properties(id, props);
                }
            }
        }
        Err(e) => debug!(error = %e, "Beacon properties unavailable"),
    }
    Ok(StepOutcome::Success)
}

async fn sync_show_settings(ctx: &BootstrapContext) -> StepOutcome {
    if !ctx.model.has_feature("show").await {
        return StepOutcome::Skipped;
    }
    let settings = match ctx.model.local_show_settings().await {
        Some(settings) => settings,
        None => return StepOutcome::Skipped,
    };
    match ctx
        .channel
        .send_message(json!({"type": protocol::SHOW_CFG, "configuration": settings}).into())
        .await
    {
        Ok(_) => {
            if ctx.gate.is_live() {
                ctx.model.mark_show_synced(true);
            }
            StepOutcome::Success
        }
        Err(e) => {
            warn!(error = %e, "Failed to upload show configuration");
            StepOutcome::Failed(e.to_string())
        }
    }
}

fn maybe_warn_about_skew(ctx: &BootstrapContext, skew_ms: i64) {
    if skew_ms.abs() <= ctx.skew_warning_ms {
        return;
    }
    // no point nagging while the user already has the sync dialog open
    if ctx.model.time_sync_dialog_open() {
        return;
    }
    if !can_surface(ctx) {
        return;
    }
    let direction = if skew_ms > 0 { "ahead of" } else { "behind" };
    ctx.notifier.notify(
        Notice::warning(format!(
            "The server clock is {direction} yours by {}",
            format_clock_skew(Some(skew_ms))
        ))
        .persistent()
        .with_action("Show details", "time-sync"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_gate_expires_on_new_epoch() {
        let counter = Arc::new(AtomicU64::new(0));
        let gate = SessionGate::new(Arc::clone(&counter));
        assert!(gate.is_live());

        let clone = gate.clone();
        counter.fetch_add(1, Ordering::SeqCst);
        assert!(!gate.is_live());
        assert!(!clone.is_live());

        let fresh = SessionGate::new(counter);
        assert!(fresh.is_live());
    }

    #[test]
    fn test_report_ready_requires_mandatory_steps() {
        let mut report = BootstrapReport::default();
        assert!(!report.ready());

        report.version = StepOutcome::Success;
        report.connections = StepOutcome::Success;
        report.clocks = StepOutcome::Success;
        assert!(report.ready());

        report.clocks = StepOutcome::Failed("nope".to_string());
        assert!(!report.ready());
    }

    #[test]
    fn test_step_outcome_defaults_to_skipped() {
        assert_eq!(StepOutcome::default(), StepOutcome::Skipped);
        assert!(!StepOutcome::Skipped.is_success());
        assert!(StepOutcome::Success.is_success());
    }
}
