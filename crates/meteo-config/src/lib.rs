//! Process configuration. "Environment variables / config" is declared
//! out of scope by the platform's own design (an external collaborator
//! concern) — this crate just hands the rest of the binary a plain,
//! already-parsed struct, read once at startup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpReceiverConfig {
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpReceiverConfig {
    pub bind: Option<String>,
    /// Reject NB-IoT uplinks whose HMAC doesn't validate, instead of the
    /// original's log-and-process-anyway behaviour. Defaults to `true`.
    pub strict_hmac: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttReceiverConfig {
    pub broker_url: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReceiversConfig {
    pub http: Option<HttpReceiverConfig>,
    pub udp: Option<UdpReceiverConfig>,
    pub mqtt: Option<MqttReceiverConfig>,
}

/// Per-vendor polling parameters for the periodic-download scheduler
/// (C7). Stations themselves (period, watermark) are registry data
/// read from C4, not config; this is only the platform-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub weatherlink_v2_requests_per_second: Option<f64>,
    pub meteo_france_requests_per_minute: Option<f64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            weatherlink_v2_requests_per_second: Some(10.0),
            meteo_france_requests_per_minute: Some(50.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: Option<DatabaseConfig>,
    pub receivers: Option<ReceiversConfig>,
    pub polling: Option<PollingConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

impl AppConfig {
    /// Loads from `METEO_CONFIG` (TOML), defaulting to `config.toml` in
    /// the working directory; falls back to defaults if neither exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("METEO_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        let cfg = if Path::new(&path).exists() {
            let s = fs::read_to_string(&path)?;
            toml::from_str::<AppConfig>(&s)?
        } else {
            AppConfig::default()
        };
        Ok(cfg)
    }

    pub fn database_url(&self) -> Result<String, ConfigError> {
        self.database
            .as_ref()
            .map(|d| d.url.clone())
            .ok_or(ConfigError::Missing("database.url"))
    }

    pub fn http_bind(&self) -> String {
        self.receivers
            .as_ref()
            .and_then(|r| r.http.as_ref())
            .and_then(|h| h.bind.clone())
            .unwrap_or_else(|| "0.0.0.0:5887".to_string())
    }

    pub fn udp_bind(&self) -> String {
        self.receivers
            .as_ref()
            .and_then(|r| r.udp.as_ref())
            .and_then(|u| u.bind.clone())
            .unwrap_or_else(|| "0.0.0.0:5888".to_string())
    }

    pub fn mqtt_broker_url(&self) -> Option<String> {
        self.receivers.as_ref().and_then(|r| r.mqtt.as_ref()).and_then(|m| m.broker_url.clone())
    }

    pub fn strict_hmac(&self) -> bool {
        self.receivers.as_ref().and_then(|r| r.udp.as_ref()).and_then(|u| u.strict_hmac).unwrap_or(true)
    }

    pub fn polling(&self) -> PollingConfig {
        self.polling.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_match_the_published_ports() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.http_bind(), "0.0.0.0:5887");
        assert_eq!(cfg.udp_bind(), "0.0.0.0:5888");
    }

    #[test]
    fn hmac_verification_is_strict_unless_explicitly_relaxed() {
        let cfg = AppConfig::default();
        assert!(cfg.strict_hmac());

        let toml_src = r#"
            [receivers.udp]
            strict_hmac = false
        "#;
        let relaxed: AppConfig = toml::from_str(toml_src).unwrap();
        assert!(!relaxed.strict_hmac());
    }

    #[test]
    fn parses_a_minimal_toml_document() {
        let toml_src = r#"
            [database]
            url = "postgres://meteo@localhost/meteo"

            [receivers.http]
            bind = "0.0.0.0:8080"
        "#;
        let cfg: AppConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.database_url().unwrap(), "postgres://meteo@localhost/meteo");
        assert_eq!(cfg.http_bind(), "0.0.0.0:8080");
    }
}
