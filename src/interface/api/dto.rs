//! Operator API request and response types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{codes, GatewayError};

/// Response envelope shared by every operator endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultCommon {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResultCommon {
    pub fn success(data: impl Serialize) -> Self {
        Self {
            code: codes::SUCCESS.to_string(),
            message: String::new(),
            data: serde_json::to_value(data).ok(),
        }
    }

    pub fn fail(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            data: None,
        }
    }

    /// Failure envelope for `error`; `fallback` is the operation's own code.
    pub fn from_error(error: &GatewayError, fallback: &'static str) -> Self {
        let message = match error {
            GatewayError::DeviceOffline(_) | GatewayError::SessionExpired(_) => {
                "device not online".to_string()
            }
            other => other.to_string(),
        };
        Self::fail(error.code(fallback), message)
    }

    pub fn is_success(&self) -> bool {
        self.code == codes::SUCCESS
    }
}

/// `?id=..&channel=..[&startTime=..&endTime=..]`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelParams {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub channel: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl ChannelParams {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.id.trim().is_empty() || self.channel.trim().is_empty() {
            return Err(GatewayError::Parameter(
                "parameter error,(id,channel required)".to_string(),
            ));
        }
        Ok(())
    }

    /// Unparseable times count as 0, which selects live play.
    pub fn range(&self) -> (i64, i64) {
        let parse = |v: &Option<String>| {
            v.as_deref()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0)
        };
        (parse(&self.start_time), parse(&self.end_time))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceParams {
    #[serde(default)]
    pub id: String,
}

/// Body of `POST /addSession`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSessionRequest {
    #[serde(alias = "DeviceID", alias = "deviceID")]
    pub device_id: String,
    #[serde(alias = "From")]
    pub from: String,
    #[serde(alias = "Addr")]
    pub addr: String,
    /// Seconds; 3600 when absent
    pub expires: Option<u64>,
    #[serde(alias = "CSeq")]
    pub cseq: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub device_id: String,
    pub owner: Option<String>,
    pub local: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let ok = serde_json::to_value(ResultCommon::success("invited")).unwrap();
        assert_eq!(ok["code"], "200");
        assert_eq!(ok["data"], "invited");

        let failed = ResultCommon::from_error(
            &GatewayError::DeviceOffline("34020000001320000001".into()),
            codes::INVITE_FAILED,
        );
        assert_eq!(failed.code, "11002");
        assert_eq!(failed.message, "device not online");
        assert!(failed.data.is_none());
    }

    #[test]
    fn test_channel_params() {
        let params = ChannelParams {
            id: "d".into(),
            channel: "c".into(),
            start_time: Some("1700000000".into()),
            end_time: Some("x".into()),
        };
        assert!(params.validate().is_ok());
        assert_eq!(params.range(), (1_700_000_000, 0));
        assert!(ChannelParams::default().validate().is_err());
    }
}
