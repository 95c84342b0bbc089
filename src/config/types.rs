use std::str::FromStr;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::device::connection::DriverSettings;
use crate::device::constants::{CONNECT_DEADLINE, EVENT_HOLD, SCAN_PERIOD};
use crate::error::ConfigError;

fn default_scan_timeout() -> u64 {
    SCAN_PERIOD
}

fn default_event_hold() -> u64 {
    EVENT_HOLD
}

fn default_connect_timeout() -> Option<u64> {
    Some(CONNECT_DEADLINE)
}

fn default_log_level() -> String {
    String::from("info")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_event_hold")]
    pub event_hold_ms: u64,
    /// `null` disables the timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub preferred_address: Option<String>,
}

impl Config {
    pub fn log_level(&self) -> Result<log::LevelFilter, ConfigError> {
        log::LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            scan_period: Duration::from_millis(self.scan_timeout_ms),
            event_hold: Duration::from_millis(self.event_hold_ms),
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan_timeout_ms: default_scan_timeout(),
            event_hold_ms: default_event_hold(),
            connect_timeout_ms: default_connect_timeout(),
            log_level: default_log_level(),
            preferred_address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"preferredAddress": "AA:BB:CC:DD:EE:FF"}"#).unwrap();
        assert_eq!(config.scan_timeout_ms, 10_000);
        assert_eq!(config.event_hold_ms, 3_000);
        assert_eq!(config.connect_timeout_ms, Some(15_000));
        assert_eq!(config.preferred_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(config.driver_settings(), DriverSettings::default());
    }

    #[test]
    fn null_connect_timeout_disables_it() {
        let config: Config = serde_json::from_str(r#"{"connectTimeoutMs": null, "scanTimeoutMs": 2500}"#).unwrap();
        let settings = config.driver_settings();
        assert_eq!(settings.connect_timeout, None);
        assert_eq!(settings.scan_period, Duration::from_millis(2500));
    }

    #[test]
    fn log_level_is_validated() {
        let mut config = Config::default();
        assert_eq!(config.log_level().unwrap(), log::LevelFilter::Info);

        config.log_level = String::from("debug");
        assert_eq!(config.log_level().unwrap(), log::LevelFilter::Debug);

        config.log_level = String::from("loud");
        assert!(matches!(config.log_level(), Err(ConfigError::InvalidLogLevel(level)) if level == "loud"));
    }

    #[test]
    fn serializes_camel_case() {
        let content = serde_json::to_string(&Config::default()).unwrap();
        assert!(content.contains("\"scanTimeoutMs\":10000"));
        assert!(content.contains("\"connectTimeoutMs\":15000"));
        assert!(content.contains("\"preferredAddress\":null"));
    }
}
