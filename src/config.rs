//! Configuration for groundlink

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::error::{GroundlinkError, Result};

/// Default configuration file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("groundlink")
        .join("config.toml")
}

/// Transport protocol used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ws,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ws => write!(f, "ws"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = GroundlinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" => Ok(Protocol::Ws),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(GroundlinkError::Config(format!(
                "Unsupported protocol: {}",
                other
            ))),
        }
    }
}

/// Settings for the connection to one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Transport protocol
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    /// Server host name or address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Connection attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Liveness probe interval in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub ping_interval_ms: u64,

    /// Liveness probe timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Clock skew above which a warning is raised, in milliseconds
    #[serde(default = "default_skew_warning_ms")]
    pub clock_skew_warning_ms: u64,

    /// Local server process settings
    #[serde(default)]
    pub local: LocalServerSettings,
}

fn default_protocol() -> Protocol {
    Protocol::Ws
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_skew_warning_ms() -> u64 {
    1000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: 5000,
            ping_interval_ms: 5000,
            ping_timeout_ms: 5000,
            clock_skew_warning_ms: 1000,
            local: LocalServerSettings::default(),
        }
    }
}

impl ServerSettings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| GroundlinkError::Config(format!("Invalid configuration: {}", e)))
    }

    /// Save settings to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            GroundlinkError::Config(format!("Failed to serialize configuration: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Settings for an optionally managed local server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalServerSettings {
    /// Whether a local server should be launched before connecting
    #[serde(default)]
    pub enabled: bool,

    /// Path to the server binary
    #[serde(default)]
    pub binary_path: Option<PathBuf>,

    /// Extra CLI arguments passed to the server
    #[serde(default)]
    pub args: Vec<String>,

    /// Time the process gets to come up before an exit counts as "never started"
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

fn default_startup_grace_ms() -> u64 {
    2000
}

impl Default for LocalServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            binary_path: None,
            args: Vec::new(),
            startup_grace_ms: 2000,
        }
    }
}

impl LocalServerSettings {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

/// Resolved connection target, immutable for the duration of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub url: String,
}

impl ConnectionTarget {
    /// Derive the target from settings.
    ///
    /// Fails with a configuration error when the host is empty, the port is
    /// zero or the resulting URL does not parse. Configuration errors are
    /// fatal; no transport is created and no retry is attempted.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let host = settings.host.trim();
        if host.is_empty() {
            return Err(GroundlinkError::Config(
                "Server host must not be empty".into(),
            ));
        }
        if settings.port == 0 {
            return Err(GroundlinkError::Config(
                "Server port must not be zero".into(),
            ));
        }

        let url = format!("{}://{}:{}", settings.protocol, host, settings.port);
        let parsed = Url::parse(&url)
            .map_err(|e| GroundlinkError::Config(format!("Invalid server address {}: {}", url, e)))?;
        if parsed.host_str().is_none() {
            return Err(GroundlinkError::Config(format!(
                "Invalid server address {}: missing host",
                url
            )));
        }

        Ok(Self {
            protocol: settings.protocol,
            host: host.to_string(),
            port: settings.port,
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = ServerSettings::default();
        assert_eq!(settings.protocol, Protocol::Ws);
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 5000);
        assert_eq!(settings.connect_timeout_ms, 5000);
        assert_eq!(settings.ping_interval_ms, 5000);
        assert_eq!(settings.ping_timeout_ms, 5000);
        assert_eq!(settings.clock_skew_warning_ms, 1000);
        assert!(!settings.local.enabled);
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("ws".parse::<Protocol>().unwrap(), Protocol::Ws);
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert!("udp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_target_derivation() {
        let mut settings = ServerSettings::default();
        settings.host = "ground.example.com".to_string();
        settings.port = 1234;

        let target = ConnectionTarget::from_settings(&settings).unwrap();
        assert_eq!(target.url, "ws://ground.example.com:1234");

        settings.protocol = Protocol::Tcp;
        let target = ConnectionTarget::from_settings(&settings).unwrap();
        assert_eq!(target.url, "tcp://ground.example.com:1234");
    }

    #[test]
    fn test_target_rejects_bad_settings() {
        let mut settings = ServerSettings::default();
        settings.host = "".to_string();
        assert!(ConnectionTarget::from_settings(&settings).is_err());

        settings.host = "bad host".to_string();
        assert!(ConnectionTarget::from_settings(&settings).is_err());

        settings.host = "localhost".to_string();
        settings.port = 0;
        assert!(ConnectionTarget::from_settings(&settings).is_err());
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut settings = ServerSettings::default();
        settings.host = "10.0.0.7".to_string();
        settings.port = 5001;
        settings.local.enabled = true;
        settings.local.binary_path = Some(PathBuf::from("/usr/bin/flightd"));
        settings.local.args = vec!["--verbose".to_string()];

        settings.save(&path).unwrap();
        let loaded = ServerSettings::load(&path).unwrap();
        assert_eq!(loaded.host, "10.0.0.7");
        assert_eq!(loaded.port, 5001);
        assert!(loaded.local.enabled);
        assert_eq!(loaded.local.args, vec!["--verbose".to_string()]);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let loaded: ServerSettings = toml::from_str("host = \"10.1.1.1\"").unwrap();
        assert_eq!(loaded.host, "10.1.1.1");
        assert_eq!(loaded.port, 5000);
        assert_eq!(loaded.ping_interval_ms, 5000);
    }
}
