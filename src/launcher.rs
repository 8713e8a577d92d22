//! Supervision of an optional server process on the local machine.
//!
//! When the configured target is the local host, the connection can start
//! the server binary itself before dialing. The supervisor owns that child
//! process: it forwards the child's log output into our own logs, reports
//! the exit through a oneshot so the connection can react, and kills the
//! child when the session ends.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GroundlinkError, Result};

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Exits within this window are reported as startup failures.
    pub startup_grace: Duration,
}

struct RunningServer {
    wait_task: JoinHandle<()>,
    log_tasks: Vec<JoinHandle<()>>,
}

/// Owns at most one local server process at a time.
#[derive(Default)]
pub struct LocalServerSupervisor {
    inner: Mutex<Option<RunningServer>>,
}

impl LocalServerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the local server unless one is already running.
    ///
    /// The returned receiver resolves with a human-readable message when the
    /// process exits on its own; it stays silent when [`terminate`] kills
    /// the process.
    ///
    /// [`terminate`]: Self::terminate
    pub async fn ensure_running(&self, options: LaunchOptions) -> Result<oneshot::Receiver<String>> {
        let mut slot = self.inner.lock().await;
        if let Some(running) = slot.as_ref() {
            if !running.wait_task.is_finished() {
                return Err(GroundlinkError::LocalServer(
                    "A local server is already running".to_string(),
                ));
            }
        }

        info!(program = %options.program.display(), "Starting local server");
        let mut child = Command::new(&options.program)
            .args(&options.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GroundlinkError::LocalServer(format!("The local server failed to start: {e}"))
            })?;

        let started_at = Instant::now();
        let mut log_tasks = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(tokio::spawn(forward_logs(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(tokio::spawn(forward_logs(stderr)));
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let grace = options.startup_grace;
        let wait_task = tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let died_during_startup = started_at.elapsed() < grace;
                    let _ = exit_tx.send(exit_message(status.code(), died_during_startup));
                }
                Err(e) => {
                    let _ = exit_tx.send(format!("Lost track of the local server: {e}"));
                }
            }
        });

        *slot = Some(RunningServer {
            wait_task,
            log_tasks,
        });
        Ok(exit_rx)
    }

    /// Kill the local server if one is running. Safe to call repeatedly.
    pub async fn terminate(&self) {
        let running = self.inner.lock().await.take();
        if let Some(running) = running {
            running.wait_task.abort();
            for task in &running.log_tasks {
                task.abort();
            }
            // aborting the wait task drops the child handle, and the child
            // was spawned with kill_on_drop
            let _ = running.wait_task.await;
            for task in running.log_tasks {
                let _ = task.await;
            }
            info!("Local server stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        match self.inner.lock().await.as_ref() {
            Some(running) => !running.wait_task.is_finished(),
            None => false,
        }
    }
}

async fn forward_logs<R>(reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        emit_log(&line);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedLogLine<'a> {
    pub severity: LogSeverity,
    pub module: &'a str,
    pub message: &'a str,
}

/// Parse a `LEVEL:module.path:message` line as emitted by the server.
///
/// Only the last segment of the dotted module path is kept; the full path
/// repeats the server's package layout and adds nothing for a reader.
pub fn parse_log_line(line: &str) -> Option<ParsedLogLine<'_>> {
    let mut parts = line.splitn(3, ':');
    let level = parts.next()?;
    let module_path = parts.next()?;
    let message = parts.next()?;
    let severity = translate_severity(level.trim())?;
    let module_path = module_path.trim();
    let module = module_path.rsplit('.').next().unwrap_or(module_path);
    Some(ParsedLogLine {
        severity,
        module,
        message: message.trim_start(),
    })
}

fn translate_severity(level: &str) -> Option<LogSeverity> {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" | "TRACE" => Some(LogSeverity::Debug),
        "INFO" => Some(LogSeverity::Info),
        "WARN" | "WARNING" => Some(LogSeverity::Warning),
        "ERROR" | "CRITICAL" | "FATAL" => Some(LogSeverity::Error),
        _ => None,
    }
}

fn emit_log(line: &str) {
    match parse_log_line(line) {
        Some(parsed) => match parsed.severity {
            LogSeverity::Debug => debug!(module = parsed.module, "{}", parsed.message),
            LogSeverity::Info => info!(module = parsed.module, "{}", parsed.message),
            LogSeverity::Warning => warn!(module = parsed.module, "{}", parsed.message),
            LogSeverity::Error => error!(module = parsed.module, "{}", parsed.message),
        },
        None => info!("{}", line),
    }
}

fn exit_message(code: Option<i32>, died_during_startup: bool) -> String {
    let status = match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    if died_during_startup {
        format!("The local server failed to start ({status})")
    } else {
        format!("The local server exited unexpectedly ({status})")
    }
}
