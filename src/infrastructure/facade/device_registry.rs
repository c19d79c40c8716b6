//! Device identity lookup
//!
//! Resolves the shared secret a device uses for digest authentication.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::domain::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredential {
    pub device_id: String,
    pub password: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Fails with `DeviceUnknown` when the device has no identity.
    async fn lookup(&self, device_id: &str) -> Result<DeviceCredential>;
}

/// Secrets from configuration.
pub struct StaticDeviceRegistry {
    passwords: HashMap<String, String>,
    default_password: Option<String>,
}

impl StaticDeviceRegistry {
    pub fn new(passwords: HashMap<String, String>, default_password: Option<String>) -> Self {
        Self {
            passwords,
            default_password,
        }
    }
}

#[async_trait]
impl DeviceRegistry for StaticDeviceRegistry {
    async fn lookup(&self, device_id: &str) -> Result<DeviceCredential> {
        let password = self
            .passwords
            .get(device_id)
            .or(self.default_password.as_ref())
            .ok_or_else(|| GatewayError::DeviceUnknown(device_id.to_string()))?;

        Ok(DeviceCredential {
            device_id: device_id.to_string(),
            password: password.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RegistryResponse {
    #[serde(default)]
    code: serde_json::Value,
    #[serde(default)]
    message: Option<String>,
    data: Option<DeviceMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceMeta {
    #[serde(default)]
    group_key: String,
    #[serde(default)]
    sn: String,
    #[serde(default)]
    device_key: String,
    #[serde(default)]
    device_token: String,
}

/// Device backend reached over HTTP:
/// `GET {base}/api/device/meta/getByDeviceKey?deviceKey={id}`
pub struct HttpDeviceRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDeviceRegistry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Parameter(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl DeviceRegistry for HttpDeviceRegistry {
    async fn lookup(&self, device_id: &str) -> Result<DeviceCredential> {
        let url = format!("{}/api/device/meta/getByDeviceKey", self.base_url);
        let unknown = |reason: String| {
            debug!(device_id = %device_id, "Device lookup failed: {}", reason);
            GatewayError::DeviceUnknown(device_id.to_string())
        };

        let response: RegistryResponse = self
            .client
            .get(&url)
            .query(&[("deviceKey", device_id)])
            .send()
            .await
            .map_err(|e| unknown(e.to_string()))?
            .error_for_status()
            .map_err(|e| unknown(e.to_string()))?
            .json()
            .await
            .map_err(|e| unknown(e.to_string()))?;

        let meta = response.data.ok_or_else(|| {
            unknown(format!(
                "code={} message={}",
                response.code,
                response.message.unwrap_or_default()
            ))
        })?;
        if meta.device_token.is_empty() {
            return Err(unknown("empty device token".to_string()));
        }

        debug!(
            device_id = %device_id,
            device_key = %meta.device_key,
            group_key = %meta.group_key,
            sn = %meta.sn,
            "Device identity resolved"
        );
        Ok(DeviceCredential {
            device_id: device_id.to_string(),
            password: meta.device_token,
        })
    }
}
