//! Settings sections. Every section deserializes with defaults for missing keys.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use herald_core::ids::InstanceId;
use herald_core::rate_limit::RateLimitConfig;

use crate::errors::{Result, SettingsError};
use crate::loader::herald_home;

/// Minimum scheduled-message poll interval.
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;

/// Minimum WebSocket ping interval.
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeraldSettings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    /// Initial rate-limit policy; runtime updates are not written back.
    pub dispatch: RateLimitConfig,
    pub poller: PollerSettings,
    pub notifications: NotificationSettings,
    pub transport: TransportSettings,
    pub logging: LoggingSettings,
}

impl HeraldSettings {
    /// Clamp correctable values and reject the rest.
    pub fn validate(&mut self) -> Result<()> {
        let clamped = self.dispatch.clamped();
        if clamped != self.dispatch {
            warn!(
                configured = ?self.dispatch,
                effective = ?clamped,
                "rate limit below enforced minimums, clamping"
            );
            self.dispatch = clamped;
        }

        if self.poller.interval_secs < MIN_POLL_INTERVAL_SECS {
            warn!(
                configured = self.poller.interval_secs,
                "poll interval below minimum, clamping"
            );
            self.poller.interval_secs = MIN_POLL_INTERVAL_SECS;
        }

        if self.server.heartbeat_interval_ms < MIN_HEARTBEAT_INTERVAL_MS {
            warn!(
                configured = self.server.heartbeat_interval_ms,
                "heartbeat interval below minimum, clamping"
            );
            self.server.heartbeat_interval_ms = MIN_HEARTBEAT_INTERVAL_MS;
        }
        // A client must get at least two pings before it can be reaped.
        let min_timeout = self.server.heartbeat_interval_ms.saturating_mul(2);
        if self.server.client_timeout_ms < min_timeout {
            warn!(
                configured = self.server.client_timeout_ms,
                effective = min_timeout,
                "client timeout shorter than two heartbeats, clamping"
            );
            self.server.client_timeout_ms = min_timeout;
        }

        if self.transport.bridge_url.trim().is_empty() {
            return Err(SettingsError::InvalidValue("transport.bridgeUrl is empty".into()));
        }

        if parse_level(&self.logging.level).is_none() {
            return Err(SettingsError::InvalidValue(format!(
                "logging.level {:?} is not a log level",
                self.logging.level
            )));
        }
        for (module, level) in &self.logging.modules {
            if parse_level(level).is_none() {
                return Err(SettingsError::InvalidValue(format!(
                    "logging.modules.{module} {level:?} is not a log level"
                )));
            }
        }
        Ok(())
    }
}

/// Observer server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// WebSocket heartbeat ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Clients silent for longer than this are reaped.
    pub client_timeout_ms: u64,
    /// Capacity of the broadcast channel feeding observers.
    pub broadcast_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 90_000,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database file. Defaults to `~/.herald/database/herald.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DatabaseSettings {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| herald_home().join("database/herald.db"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

/// Admin notification policy. Also mutable at runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub admin_recipient: Option<String>,
    /// Instance used to send notifications. Falls back to the instance of the
    /// message being reported.
    pub instance_id: Option<InstanceId>,
}

impl NotificationSettings {
    /// The recipient to notify, when notifications are switched on and one is set.
    pub fn active_recipient(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.admin_recipient
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

/// HTTP sidecar bridge hosting the transport driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    pub bridge_url: String,
    pub request_timeout_ms: u64,
    /// Buffered transport events per instance before the bridge callback blocks.
    pub event_buffer: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bridge_url: "http://127.0.0.1:3100".to_string(),
            request_timeout_ms: 30_000,
            event_buffer: 64,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Per-module level overrides, e.g. `{"herald_dispatch": "debug"}`.
    pub modules: BTreeMap<String, String>,
    /// Persist WARN and above to a SQLite log database.
    pub persist: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            persist: true,
            db_path: None,
        }
    }
}

impl LoggingSettings {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| herald_home().join("database/herald-logs.db"))
    }
}

/// Parse a level name (`trace`..`error`, case-insensitive).
pub fn parse_level(raw: &str) -> Option<tracing::Level> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = HeraldSettings::default();
        assert_eq!(settings.server.port, 9091);
        assert_eq!(settings.server.heartbeat_interval_ms, 30_000);
        assert_eq!(settings.poller.interval_secs, 60);
        assert!(settings.poller.enabled);
        assert_eq!(settings.dispatch, RateLimitConfig::default());
        assert!(!settings.notifications.enabled);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn defaults_validate() {
        let mut settings = HeraldSettings::default();
        settings.validate().unwrap();
    }

    #[test]
    fn validate_clamps_dispatch_and_poller() {
        let mut settings = HeraldSettings::default();
        settings.dispatch.messages_per_batch = 0;
        settings.dispatch.delay_between_batches = 10;
        settings.poller.interval_secs = 0;
        settings.validate().unwrap();
        assert_eq!(settings.dispatch.messages_per_batch, 1);
        assert_eq!(settings.dispatch.delay_between_batches, 5_000);
        assert_eq!(settings.poller.interval_secs, 1);
    }

    #[test]
    fn validate_clamps_heartbeat_and_client_timeout() {
        let mut settings = HeraldSettings::default();
        settings.server.heartbeat_interval_ms = 0;
        settings.server.client_timeout_ms = 0;
        settings.validate().unwrap();
        assert_eq!(settings.server.heartbeat_interval_ms, MIN_HEARTBEAT_INTERVAL_MS);
        assert_eq!(settings.server.client_timeout_ms, 2_000);

        let mut settings = HeraldSettings::default();
        settings.server.client_timeout_ms = 45_000;
        settings.validate().unwrap();
        assert_eq!(settings.server.heartbeat_interval_ms, 30_000);
        assert_eq!(settings.server.client_timeout_ms, 60_000);
    }

    #[test]
    fn validate_rejects_bad_log_level() {
        let mut settings = HeraldSettings::default();
        settings.logging.level = "loud".into();
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));

        let mut settings = HeraldSettings::default();
        settings.logging.modules.insert("herald_store".into(), "chatty".into());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_bridge() {
        let mut settings = HeraldSettings::default();
        settings.transport.bridge_url = "  ".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn notification_recipient_requires_enabled() {
        let mut n = NotificationSettings {
            enabled: false,
            admin_recipient: Some("15550199".into()),
            instance_id: None,
        };
        assert!(n.active_recipient().is_none());
        n.enabled = true;
        assert_eq!(n.active_recipient(), Some("15550199"));
        n.admin_recipient = Some("   ".into());
        assert!(n.active_recipient().is_none());
    }

    #[test]
    fn camel_case_wire_names() {
        let json = serde_json::to_value(HeraldSettings::default()).unwrap();
        assert_eq!(json["server"]["heartbeatIntervalMs"], 30_000);
        assert_eq!(json["dispatch"]["messagesPerBatch"], 10);
        assert_eq!(json["transport"]["bridgeUrl"], "http://127.0.0.1:3100");
        assert_eq!(json["poller"]["intervalSecs"], 60);
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level("DEBUG"), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level("warn"), Some(tracing::Level::WARN));
        assert!(parse_level("verbose").is_none());
    }
}
