//! Media-server channel allocation
//!
//! The media server hands out the numeric stream identifier that becomes the
//! SSRC of an INVITE.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{GatewayError, Result};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaAllocator: Send + Sync {
    /// Allocate (or look up) the media channel for `channel_id`.
    async fn create_channel(&self, channel_id: &str) -> Result<u32>;
}

#[derive(Debug, Deserialize)]
struct CreateChannelResponse {
    #[serde(default)]
    code: i32,
    data: Option<CreateChannelData>,
}

#[derive(Debug, Deserialize)]
struct CreateChannelData {
    query: ChannelQuery,
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    #[serde(default)]
    id: String,
    #[serde(default)]
    rtp_port: u32,
    #[serde(default)]
    ssrc: u32,
}

/// SRS GB28181 API:
/// `GET {url}?action=create_channel&stream=[stream]&port_mode=fixed&app=live&id={channel}`
pub struct SrsMediaAllocator {
    url: String,
    client: reqwest::Client,
}

impl SrsMediaAllocator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::MediaServer(format!("http client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl MediaAllocator for SrsMediaAllocator {
    async fn create_channel(&self, channel_id: &str) -> Result<u32> {
        let response: CreateChannelResponse = self
            .client
            .get(&self.url)
            .query(&[
                ("action", "create_channel"),
                ("stream", "[stream]"),
                ("port_mode", "fixed"),
                ("app", "live"),
                ("id", channel_id),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::MediaServer(e.to_string()))?
            .json()
            .await
            .map_err(|e| GatewayError::MediaServer(e.to_string()))?;

        let query = response
            .data
            .map(|d| d.query)
            .filter(|q| q.ssrc != 0)
            .ok_or_else(|| {
                warn!(channel_id = %channel_id, code = response.code, "Media channel allocation failed");
                GatewayError::MediaServer(format!("create_channel returned code {}", response.code))
            })?;

        debug!(
            channel_id = %channel_id,
            media_id = %query.id,
            rtp_port = query.rtp_port,
            ssrc = query.ssrc,
            "Media channel allocated"
        );
        Ok(query.ssrc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shape() {
        let body = r#"{"code":0,"data":{"query":{"id":"ch1","ip":"10.0.0.5","rtmp_port":1935,"app":"live","stream":"ch1","rtp_port":9000,"ssrc":1234}}}"#;
        let parsed: CreateChannelResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.unwrap().query.ssrc, 1234);
    }
}
