//! Link configuration and logging setup

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ble::fragment::WIRE_HEADER_LENGTH;
use crate::ble::timer::TimerKind;
use crate::LinkError;

/// Default fragment size: a 185 byte ATT MTU minus the 3 byte ATT header
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 182;

/// Default number of completed message ids remembered per lane
pub const DEFAULT_RECEIVED_HISTORY: usize = 32;

/// Tunables of a [`Connection`](crate::ble::Connection)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Handshake must finish within this window
    pub connection_complete_timeout_ms: u64,
    /// Silent reconnection window after the link drops
    pub reconnection_timeout_ms: u64,
    /// Per-fragment ack wait before retransmitting
    pub ack_timeout_ms: u64,
    pub notify_disconnection_timeout_ms: u64,
    pub disconnection_timeout_ms: u64,
    /// Quiet period after an inbound burst before our own fragments resume
    pub resume_delay_ms: u64,
    /// Largest fragment handed to the transport, header included
    pub max_fragment_size: usize,
    pub received_history: usize,
    pub enable_logging: bool,
    pub log_level: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connection_complete_timeout_ms: 10_000,
            reconnection_timeout_ms: 30_000,
            ack_timeout_ms: 1_000,
            notify_disconnection_timeout_ms: 5_000,
            disconnection_timeout_ms: 4_000,
            resume_delay_ms: 1_500,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            received_history: DEFAULT_RECEIVED_HISTORY,
            enable_logging: false,
            log_level: None,
        }
    }
}

impl LinkConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, LinkError> {
        let config: LinkConfig = serde_json::from_slice(bytes)
            .map_err(|e| LinkError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML/JSON/YAML file, with `BLUELINK_*` environment overrides
    #[cfg(feature = "config-file")]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, LinkError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("BLUELINK"))
            .build()
            .map_err(|e| LinkError::Configuration(e.to_string()))?;
        let config: LinkConfig = settings
            .try_deserialize()
            .map_err(|e| LinkError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        let timeouts = [
            ("connection_complete_timeout_ms", self.connection_complete_timeout_ms),
            ("reconnection_timeout_ms", self.reconnection_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("notify_disconnection_timeout_ms", self.notify_disconnection_timeout_ms),
            ("disconnection_timeout_ms", self.disconnection_timeout_ms),
            ("resume_delay_ms", self.resume_delay_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(LinkError::Configuration(format!("{} must be positive", name)));
        }
        if self.max_fragment_size <= WIRE_HEADER_LENGTH {
            return Err(LinkError::Configuration(format!(
                "max_fragment_size must exceed the {} byte fragment header",
                WIRE_HEADER_LENGTH
            )));
        }
        if self.received_history == 0 {
            return Err(LinkError::Configuration(
                "received_history must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self, kind: TimerKind) -> Duration {
        let ms = match kind {
            TimerKind::ConnectionComplete => self.connection_complete_timeout_ms,
            TimerKind::Reconnection => self.reconnection_timeout_ms,
            TimerKind::MessageAck | TimerKind::DataAck => self.ack_timeout_ms,
            TimerKind::NotifyDisconnection => self.notify_disconnection_timeout_ms,
            TimerKind::Disconnection => self.disconnection_timeout_ms,
            TimerKind::Resume => self.resume_delay_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Install a fmt subscriber if logging is enabled. Later calls are no-ops.
pub fn init_logging(config: &LinkConfig) {
    if config.enable_logging {
        let _ = tracing_subscriber::fmt()
            .with_max_level(parse_log_level(config.log_level.as_deref()))
            .try_init();
    }
}

pub fn parse_log_level(level: Option<&str>) -> tracing::Level {
    match level {
        Some("trace") => tracing::Level::TRACE,
        Some("debug") => tracing::Level::DEBUG,
        Some("info") => tracing::Level::INFO,
        Some("warn") => tracing::Level::WARN,
        Some("error") => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.timeout(TimerKind::Reconnection), Duration::from_secs(30));
        assert_eq!(config.timeout(TimerKind::Resume), Duration::from_millis(1500));
        assert_eq!(config.timeout(TimerKind::DataAck), config.timeout(TimerKind::MessageAck));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = LinkConfig::from_json(br#"{"ack_timeout_ms": 250, "log_level": "debug"}"#).unwrap();
        assert_eq!(config.ack_timeout_ms, 250);
        assert_eq!(config.reconnection_timeout_ms, 30_000);
        assert_eq!(parse_log_level(config.log_level.as_deref()), tracing::Level::DEBUG);
    }

    #[test]
    fn test_rejects_unusable_values() {
        assert!(matches!(
            LinkConfig::from_json(br#"{"ack_timeout_ms": 0}"#),
            Err(LinkError::Configuration(_))
        ));
        let config = LinkConfig {
            max_fragment_size: WIRE_HEADER_LENGTH,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(LinkConfig::from_json(b"not json").is_err());
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        assert_eq!(parse_log_level(Some("verbose")), tracing::Level::INFO);
        assert_eq!(parse_log_level(None), tracing::Level::INFO);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_from_toml_file() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "reconnection_timeout_ms = 5000").unwrap();
        writeln!(file, "max_fragment_size = 64").unwrap();

        let config = LinkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reconnection_timeout_ms, 5_000);
        assert_eq!(config.max_fragment_size, 64);
        assert_eq!(config.ack_timeout_ms, 1_000);
    }
}
