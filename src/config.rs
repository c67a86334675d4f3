//! Engine configuration.
//!
//! Resolved in three layers: built-in defaults, then overrides stored in
//! `local_settings` under the `kitchen` category, then `KDS_*` environment
//! variables. A bad override is logged and skipped, never fatal.

use chrono::Duration as ChronoDuration;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db;
use crate::handoff_cache::SETTINGS_CATEGORY;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: String,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            poll_interval_secs: 5,
            timeout_secs: 15,
        }
    }
}

impl RestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cross-context bus channel; messages on other channels are dropped.
    pub channel_name: String,
    pub origin: String,
    pub retry: RetryPolicy,
    pub handoff_retention_hours: i64,
    pub rest: Option<RestConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_name: "kds-sync".to_string(),
            origin: "kds".to_string(),
            retry: RetryPolicy::default(),
            handoff_retention_hours: 24,
            rest: None,
        }
    }
}

impl EngineConfig {
    pub fn handoff_retention(&self) -> ChronoDuration {
        ChronoDuration::hours(self.handoff_retention_hours.max(0))
    }

    /// Defaults, then stored settings, then environment.
    pub fn load(conn: &Connection) -> Self {
        let mut config = Self::default();
        config.apply_settings(&db::get_category(conn, SETTINGS_CATEGORY));
        config.apply_env_overrides();
        config
    }

    /// Apply `local_settings` key/value pairs. Unknown keys are ignored.
    pub fn apply_settings(&mut self, settings: &[(String, String)]) {
        for (key, value) in settings {
            self.apply_one(key, value, "settings");
        }
    }

    pub fn apply_env_overrides(&mut self) {
        for (var, key) in ENV_KEYS {
            if let Ok(value) = std::env::var(var) {
                self.apply_one(key, &value, var);
            }
        }
    }

    fn apply_one(&mut self, key: &str, value: &str, source: &str) {
        let value = value.trim();
        match key {
            "channel_name" => {
                if value.is_empty() {
                    warn!(source, "Ignoring empty channel name");
                } else {
                    self.channel_name = value.to_string();
                }
            }
            "origin" => {
                if !value.is_empty() {
                    self.origin = value.to_string();
                }
            }
            "max_retries" => set_parsed(&mut self.retry.max_retries, key, value, source),
            "retry_base_ms" => set_parsed(&mut self.retry.base_delay_ms, key, value, source),
            "retry_max_ms" => set_parsed(&mut self.retry.max_delay_ms, key, value, source),
            "handoff_retention_hours" => {
                let mut hours = self.handoff_retention_hours;
                set_parsed(&mut hours, key, value, source);
                if hours < 0 {
                    warn!(source, key, value, "Ignoring negative retention");
                } else {
                    self.handoff_retention_hours = hours;
                }
            }
            "rest_url" => {
                if value.is_empty() {
                    self.rest = None;
                } else {
                    self.rest.get_or_insert_with(RestConfig::default).base_url =
                        value.trim_end_matches('/').to_string();
                }
            }
            "rest_key" => {
                self.rest.get_or_insert_with(RestConfig::default).api_key = value.to_string();
            }
            "poll_interval_secs" => {
                let rest = self.rest.get_or_insert_with(RestConfig::default);
                set_parsed(&mut rest.poll_interval_secs, key, value, source);
            }
            "rest_timeout_secs" => {
                let rest = self.rest.get_or_insert_with(RestConfig::default);
                set_parsed(&mut rest.timeout_secs, key, value, source);
            }
            _ => debug!(source, key, "Unknown config key"),
        }
    }

    /// REST settings are usable only with both a URL and a key.
    pub fn rest_ready(&self) -> Option<&RestConfig> {
        self.rest
            .as_ref()
            .filter(|r| !r.base_url.is_empty() && !r.api_key.is_empty())
    }
}

const ENV_KEYS: [(&str, &str); 8] = [
    ("KDS_CHANNEL", "channel_name"),
    ("KDS_MAX_RETRIES", "max_retries"),
    ("KDS_RETRY_BASE_MS", "retry_base_ms"),
    ("KDS_RETRY_MAX_MS", "retry_max_ms"),
    ("KDS_HANDOFF_RETENTION_HOURS", "handoff_retention_hours"),
    ("KDS_REST_URL", "rest_url"),
    ("KDS_REST_KEY", "rest_key"),
    ("KDS_POLL_INTERVAL_SECS", "poll_interval_secs"),
];

fn set_parsed<T: FromStr>(slot: &mut T, key: &str, value: &str, source: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(source, key, value, "Ignoring invalid config value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for (var, _) in ENV_KEYS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.channel_name, "kds-sync");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.handoff_retention(), ChronoDuration::hours(24));
        assert!(config.rest_ready().is_none());
    }

    #[test]
    fn test_settings_override_defaults() {
        let mut config = EngineConfig::default();
        config.apply_settings(&[
            ("max_retries".into(), "5".into()),
            ("retry_base_ms".into(), "100".into()),
            ("rest_url".into(), "https://db.example.test/".into()),
            ("rest_key".into(), "anon".into()),
        ]);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        let rest = config.rest_ready().expect("rest configured");
        assert_eq!(rest.base_url, "https://db.example.test");
        assert_eq!(rest.poll_interval_secs, 5);
    }

    #[test]
    fn test_invalid_values_are_skipped() {
        let mut config = EngineConfig::default();
        config.apply_settings(&[
            ("max_retries".into(), "many".into()),
            ("handoff_retention_hours".into(), "-3".into()),
            ("channel_name".into(), "  ".into()),
            ("mystery".into(), "1".into()),
        ]);
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_layers_settings_then_env() {
        clear_env();
        let db = db::open_in_memory().expect("db");
        {
            let conn = db.conn.lock().unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "max_retries", "6").unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "channel_name", "from-db").unwrap();
        }
        std::env::set_var("KDS_CHANNEL", "from-env");
        std::env::set_var("KDS_POLL_INTERVAL_SECS", "2");

        let config = {
            let conn = db.conn.lock().unwrap();
            EngineConfig::load(&conn)
        };
        clear_env();

        assert_eq!(config.channel_name, "from-env");
        assert_eq!(config.retry.max_retries, 6);
        assert_eq!(config.rest.as_ref().map(|r| r.poll_interval_secs), Some(2));
        // No URL or key yet.
        assert!(config.rest_ready().is_none());
    }

    #[test]
    #[serial]
    fn test_bad_env_value_keeps_previous() {
        clear_env();
        std::env::set_var("KDS_RETRY_MAX_MS", "soon");
        let mut config = EngineConfig::default();
        config.apply_env_overrides();
        clear_env();
        assert_eq!(config.retry.max_delay_ms, 4_000);
    }
}
