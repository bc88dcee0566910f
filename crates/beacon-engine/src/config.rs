//! Environment-backed runtime configuration for the sync engine.

use std::env;
use std::time::Duration;

use beacon_core::RetryPolicy;
use thiserror::Error;
use url::Url;

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PONG_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_INPUT_THROTTLE_MS: u64 = 100;
const DEFAULT_TYPING_EXPIRY_MS: u64 = 2_000;
const DEFAULT_RECENT_SEND_TTL_MS: u64 = 10_000;
const DEFAULT_DRAFT_EXPIRY_DAYS: u32 = 7;

/// Runtime configuration used by the engine services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// WebSocket base, e.g. `wss://chat.example.com`. The connection manager
    /// appends `/ws/chat/?token=…&user_id=…`.
    pub ws_base: String,
    /// REST API base, e.g. `https://chat.example.com/api`.
    pub api_base: String,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub idle_timeout_ms: u64,
    pub input_throttle_ms: u64,
    pub typing_expiry_ms: u64,
    pub recent_send_ttl_ms: u64,
    pub draft_expiry_days: u32,
}

impl EngineConfig {
    /// Build a configuration with default tunables for the given endpoints.
    pub fn new(
        ws_base: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            ws_base: ws_base.into(),
            api_base: api_base.into(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            pong_timeout_ms: DEFAULT_PONG_TIMEOUT_MS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            input_throttle_ms: DEFAULT_INPUT_THROTTLE_MS,
            typing_expiry_ms: DEFAULT_TYPING_EXPIRY_MS,
            recent_send_ttl_ms: DEFAULT_RECENT_SEND_TTL_MS,
            draft_expiry_days: DEFAULT_DRAFT_EXPIRY_DAYS,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from `BEACON_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let ws_base = required_trimmed("BEACON_WS_URL", &mut lookup)?;
        let api_base = required_trimmed("BEACON_API_URL", &mut lookup)?;

        let config = Self {
            ws_base,
            api_base,
            heartbeat_interval_ms: parse_u64(
                "BEACON_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
                &mut lookup,
            )?,
            pong_timeout_ms: parse_u64(
                "BEACON_PONG_TIMEOUT_MS",
                DEFAULT_PONG_TIMEOUT_MS,
                &mut lookup,
            )?,
            reconnect_base_delay_ms: parse_u64(
                "BEACON_RECONNECT_BASE_DELAY_MS",
                DEFAULT_RECONNECT_BASE_DELAY_MS,
                &mut lookup,
            )?,
            reconnect_max_delay_ms: parse_u64(
                "BEACON_RECONNECT_MAX_DELAY_MS",
                DEFAULT_RECONNECT_MAX_DELAY_MS,
                &mut lookup,
            )?,
            reconnect_max_attempts: parse_u32(
                "BEACON_RECONNECT_MAX_ATTEMPTS",
                DEFAULT_RECONNECT_MAX_ATTEMPTS,
                &mut lookup,
            )?,
            idle_timeout_ms: parse_u64(
                "BEACON_IDLE_TIMEOUT_MS",
                DEFAULT_IDLE_TIMEOUT_MS,
                &mut lookup,
            )?,
            input_throttle_ms: parse_u64(
                "BEACON_INPUT_THROTTLE_MS",
                DEFAULT_INPUT_THROTTLE_MS,
                &mut lookup,
            )?,
            typing_expiry_ms: parse_u64(
                "BEACON_TYPING_EXPIRY_MS",
                DEFAULT_TYPING_EXPIRY_MS,
                &mut lookup,
            )?,
            recent_send_ttl_ms: parse_u64(
                "BEACON_RECENT_SEND_TTL_MS",
                DEFAULT_RECENT_SEND_TTL_MS,
                &mut lookup,
            )?,
            draft_expiry_days: parse_u32(
                "BEACON_DRAFT_EXPIRY_DAYS",
                DEFAULT_DRAFT_EXPIRY_DAYS,
                &mut lookup,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn input_throttle(&self) -> Duration {
        Duration::from_millis(self.input_throttle_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn recent_send_ttl(&self) -> Duration {
        Duration::from_millis(self.recent_send_ttl_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reconnect_base_delay_ms,
            self.reconnect_max_delay_ms,
            self.reconnect_max_attempts,
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_url("BEACON_WS_URL", &self.ws_base, &["ws", "wss"])?;
        validate_url("BEACON_API_URL", &self.api_base, &["http", "https"])?;

        for (key, value) in [
            ("BEACON_HEARTBEAT_INTERVAL_MS", self.heartbeat_interval_ms),
            ("BEACON_PONG_TIMEOUT_MS", self.pong_timeout_ms),
            ("BEACON_RECONNECT_BASE_DELAY_MS", self.reconnect_base_delay_ms),
            ("BEACON_RECONNECT_MAX_DELAY_MS", self.reconnect_max_delay_ms),
            ("BEACON_IDLE_TIMEOUT_MS", self.idle_timeout_ms),
            ("BEACON_TYPING_EXPIRY_MS", self.typing_expiry_ms),
            ("BEACON_RECENT_SEND_TTL_MS", self.recent_send_ttl_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }

        if self.reconnect_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BEACON_RECONNECT_MAX_ATTEMPTS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(())
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required {key}")]
    MissingValue { key: &'static str },
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn required_trimmed<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingValue { key })
}

fn parse_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_u32<F>(key: &'static str, default: u32, lookup: &mut F) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u32>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn validate_url(key: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = Url::parse(value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.to_owned(),
        reason: err.to_string(),
    })?;

    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: format!("scheme must be one of {schemes:?}"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_endpoints_and_defaults() {
        let cfg = config_from_pairs(&[
            ("BEACON_WS_URL", "wss://chat.example.com"),
            ("BEACON_API_URL", "https://chat.example.com/api"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.ws_base, "wss://chat.example.com");
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.pong_timeout_ms, 10_000);
        assert_eq!(cfg.reconnect_max_attempts, 10);
        assert_eq!(cfg.idle_timeout_ms, 300_000);
        assert_eq!(cfg.typing_expiry_ms, 2_000);
        assert_eq!(cfg.recent_send_ttl_ms, 10_000);
        assert_eq!(cfg.draft_expiry_days, 7);
    }

    #[test]
    fn rejects_missing_endpoints() {
        let err = config_from_pairs(&[("BEACON_API_URL", "https://chat.example.com")])
            .expect_err("missing ws url should fail");
        assert_eq!(err, ConfigError::MissingValue { key: "BEACON_WS_URL" });
    }

    #[test]
    fn rejects_http_scheme_for_websocket_endpoint() {
        let err = config_from_pairs(&[
            ("BEACON_WS_URL", "https://chat.example.com"),
            ("BEACON_API_URL", "https://chat.example.com"),
        ])
        .expect_err("http scheme should fail for ws endpoint");

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "BEACON_WS_URL",
                ..
            }
        ));
    }

    #[test]
    fn applies_tuning_overrides() {
        let cfg = config_from_pairs(&[
            ("BEACON_WS_URL", "ws://127.0.0.1:9000"),
            ("BEACON_API_URL", "http://127.0.0.1:9000"),
            ("BEACON_HEARTBEAT_INTERVAL_MS", "5000"),
            ("BEACON_RECONNECT_MAX_ATTEMPTS", "3"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.heartbeat_interval_ms, 5_000);
        assert_eq!(cfg.retry_policy().max_attempts(), 3);
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[
            ("BEACON_WS_URL", "ws://127.0.0.1:9000"),
            ("BEACON_API_URL", "http://127.0.0.1:9000"),
            ("BEACON_IDLE_TIMEOUT_MS", "soon"),
        ])
        .expect_err("invalid idle timeout should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "BEACON_IDLE_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_heartbeat() {
        let err = config_from_pairs(&[
            ("BEACON_WS_URL", "ws://127.0.0.1:9000"),
            ("BEACON_API_URL", "http://127.0.0.1:9000"),
            ("BEACON_HEARTBEAT_INTERVAL_MS", "0"),
        ])
        .expect_err("zero heartbeat should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "BEACON_HEARTBEAT_INTERVAL_MS",
                ..
            }
        ));
    }
}
