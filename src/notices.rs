//! User-facing notices emitted by the connection machinery.
//!
//! The connection layer never renders anything itself; it hands `Notice`
//! values to a `Notifier` capability injected at construction. The default
//! `LogNotifier` forwards them to the tracing subscriber.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// An optional action attached to a notice, e.g. a "show details" button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeAction {
    pub label: String,
    pub command: String,
}

/// A single user-facing notice.
///
/// Persistent notices represent ongoing conditions and must not auto-dismiss.
#[derive(Debug, Clone)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
    pub persistent: bool,
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            persistent: false,
            action: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    /// Mark the notice as persistent
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Attach an action to the notice
    pub fn with_action(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.action = Some(NoticeAction {
            label: label.into(),
            command: command.into(),
        });
        self
    }
}

/// Dispatch capability for user-facing notices.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Notifier that forwards notices to the tracing subscriber.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.severity {
            Severity::Info => info!(persistent = notice.persistent, "{}", notice.message),
            Severity::Warning => warn!(persistent = notice.persistent, "{}", notice.message),
            Severity::Error => error!(persistent = notice.persistent, "{}", notice.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_builders() {
        let notice = Notice::warning("Server clock is off")
            .persistent()
            .with_action("Show details", "time-sync");
        assert_eq!(notice.severity, Severity::Warning);
        assert!(notice.persistent);
        assert_eq!(notice.action.as_ref().unwrap().command, "time-sync");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
    }
}
