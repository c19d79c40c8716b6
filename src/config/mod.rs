//! Configuration management

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sip: SipConfig,
    pub redis: RedisConfig,
    pub facade: FacadeConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from an optional TOML file layered under
    /// `GBGATE__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let file = path.unwrap_or("gbgate.toml");
        config::Config::builder()
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix("GBGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Address written into the shared store as the owner of a device session.
    pub fn advertise_addr(&self) -> String {
        self.server
            .advertise_addr
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.sip.sip_ip, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub advertise_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            advertise_addr: None,
        }
    }
}

/// Static signaling parameters, immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    /// Platform SIP ID used in From/Contact and the SDP origin
    pub serial: String,
    pub realm: String,
    /// "udp" or "tcp"
    pub network: String,
    pub listen_address: String,
    pub sip_ip: String,
    pub sip_port: u16,
    pub media_ip: String,
    pub media_port: u16,
    pub audio_enable: bool,
    /// Session lifetime used when a REGISTER carries no Expires header (seconds)
    pub default_expires: u64,
    pub keepalive_interval_secs: u64,
    pub bye_timeout_secs: u64,
    pub user_agent: String,
}

impl SipConfig {
    pub fn default_expires(&self) -> Duration {
        Duration::from_secs(self.default_expires)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn bye_timeout(&self) -> Duration {
        Duration::from_secs(self.bye_timeout_secs)
    }

    pub fn is_tcp(&self) -> bool {
        self.network.eq_ignore_ascii_case("tcp")
    }

    pub fn transport_name(&self) -> &'static str {
        if self.is_tcp() {
            "TCP"
        } else {
            "UDP"
        }
    }

    /// `sip:<serial>@<sip_ip>:<sip_port>`
    pub fn local_uri(&self) -> String {
        format!("sip:{}@{}:{}", self.serial, self.sip_ip, self.sip_port)
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            serial: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            network: "udp".to_string(),
            listen_address: "0.0.0.0:5060".to_string(),
            sip_ip: "127.0.0.1".to_string(),
            sip_port: 5060,
            media_ip: "127.0.0.1".to_string(),
            media_port: 9000,
            audio_enable: false,
            default_expires: 3600,
            keepalive_interval_secs: 300,
            bye_timeout_secs: 10,
            user_agent: "gbgate".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// When disabled an in-process store is used (single instance only)
    pub enabled: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            enabled: true,
        }
    }
}

/// External collaborators reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    pub media_server_url: String,
    pub device_registry_url: Option<String>,
    pub static_passwords: std::collections::HashMap<String, String>,
    pub default_password: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            media_server_url: "http://localhost:1985/api/v1/gb28181".to_string(),
            device_registry_url: None,
            static_passwords: Default::default(),
            default_password: None,
            request_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sip.realm, "3402000000");
        assert_eq!(config.sip.bye_timeout(), Duration::from_secs(10));
        assert_eq!(config.sip.keepalive_interval(), Duration::from_secs(300));
        assert_eq!(config.advertise_addr(), "127.0.0.1:8080");
        assert!(!config.sip.is_tcp());
    }

    #[test]
    fn test_local_uri() {
        let sip = SipConfig::default();
        assert_eq!(sip.local_uri(), "sip:34020000002000000001@127.0.0.1:5060");
    }
}
