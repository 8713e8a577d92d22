//! Maps transport disconnect reasons to user-facing verdicts.
//!
//! The wording matters: a user who closed the connection themselves should
//! not be shouted at, while a link that died underneath them deserves a
//! warning. A severity of `None` means no notice at all is shown.

use crate::notices::Severity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectVerdict {
    pub severity: Option<Severity>,
    pub message: String,
}

/// Decide how loudly a disconnection should be reported.
pub fn classify_disconnect(reason: &str, will_reconnect: bool) -> DisconnectVerdict {
    match reason {
        // the server ended the session on purpose, it will have said why
        // through its own channels
        "io server disconnect" => DisconnectVerdict {
            severity: None,
            message: "Disconnected by the server".to_string(),
        },
        "io client disconnect" => DisconnectVerdict {
            severity: Some(Severity::Info),
            message: "Disconnected from server".to_string(),
        },
        "ping timeout" | "transport close" => DisconnectVerdict {
            severity: Some(Severity::Warning),
            message: "Connection to server lost".to_string(),
        },
        other => DisconnectVerdict {
            severity: Some(if will_reconnect {
                Severity::Warning
            } else {
                Severity::Error
            }),
            message: format!("Connection to server lost: {other}"),
        },
    }
}

/// Whether a disconnect event for `event_url` should clear the marker that
/// says we are actively connecting to `current_url`.
///
/// Events from an older session may straggle in after the user has already
/// started connecting somewhere else; those must not touch the marker.
pub fn should_mark_inactive(event_url: &str, current_url: Option<&str>) -> bool {
    current_url == Some(event_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_initiated_disconnect_is_silent() {
        let verdict = classify_disconnect("io server disconnect", false);
        assert_eq!(verdict.severity, None);
    }

    #[test]
    fn test_client_initiated_disconnect_is_informational() {
        let verdict = classify_disconnect("io client disconnect", false);
        assert_eq!(verdict.severity, Some(Severity::Info));
        assert_eq!(verdict.message, "Disconnected from server");
    }

    #[test]
    fn test_lost_link_is_a_warning() {
        for reason in ["ping timeout", "transport close"] {
            let verdict = classify_disconnect(reason, true);
            assert_eq!(verdict.severity, Some(Severity::Warning));
            assert_eq!(verdict.message, "Connection to server lost");
        }
    }

    #[test]
    fn test_unknown_reason_severity_depends_on_recovery() {
        let recovering = classify_disconnect("transport error: broken pipe", true);
        assert_eq!(recovering.severity, Some(Severity::Warning));

        let terminal = classify_disconnect("transport error: broken pipe", false);
        assert_eq!(terminal.severity, Some(Severity::Error));
        assert!(terminal.message.contains("broken pipe"));
    }

    #[test]
    fn test_should_mark_inactive_requires_matching_url() {
        assert!(should_mark_inactive("ws://a:1", Some("ws://a:1")));
        assert!(!should_mark_inactive("ws://a:1", Some("ws://b:2")));
        assert!(!should_mark_inactive("ws://a:1", None));
    }
}
