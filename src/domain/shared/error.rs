//! Gateway errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No credentials presented; normal protocol flow
    #[error("Authentication challenge required")]
    AuthChallengeRequired,

    #[error("Digest response mismatch for {0}")]
    AuthMismatch(String),

    /// Identity lookup failed; treated as a re-challenge
    #[error("Unknown device: {0}")]
    DeviceUnknown(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Device not online: {0}")]
    DeviceOffline(String),

    #[error("Device {device_id} is registered on {owner}")]
    OwnedElsewhere { device_id: String, owner: String },

    #[error("Channel already invited: {0}")]
    AlreadyInvited(String),

    #[error("Signaling failure: {0}")]
    Signaling(String),

    #[error("Decode failure: {0}")]
    Decode(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Media server error: {0}")]
    MediaServer(String),

    #[error("Shared store error: {0}")]
    Store(String),
}

impl GatewayError {
    /// Errors that answer a REGISTER with a fresh challenge rather than a failure.
    pub fn is_rechallenge(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthChallengeRequired
                | GatewayError::AuthMismatch(_)
                | GatewayError::DeviceUnknown(_)
        )
    }

    /// Operator-facing failure code. `fallback` is the code of the
    /// operation that failed (invite, bye or query).
    pub fn code(&self, fallback: &'static str) -> &'static str {
        match self {
            GatewayError::Parameter(_) => codes::PARAMETER,
            GatewayError::DeviceOffline(_) | GatewayError::SessionExpired(_) => codes::NOT_ONLINE,
            GatewayError::OwnedElsewhere { .. } => codes::OWNED_ELSEWHERE,
            _ => fallback,
        }
    }
}

/// Operator response codes
pub mod codes {
    pub const SUCCESS: &str = "200";
    pub const PARAMETER: &str = "10001";
    pub const INVITE_FAILED: &str = "11001";
    pub const NOT_ONLINE: &str = "11002";
    pub const BYE_FAILED: &str = "11003";
    pub const QUERY_FAILED: &str = "11004";
    pub const OWNED_ELSEWHERE: &str = "11005";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rechallenge_classification() {
        assert!(GatewayError::AuthChallengeRequired.is_rechallenge());
        assert!(GatewayError::AuthMismatch("a".into()).is_rechallenge());
        assert!(GatewayError::DeviceUnknown("a".into()).is_rechallenge());
        assert!(!GatewayError::Parameter("a".into()).is_rechallenge());
    }

    #[test]
    fn test_operator_codes() {
        assert_eq!(GatewayError::Parameter("id".into()).code(codes::INVITE_FAILED), "10001");
        assert_eq!(GatewayError::DeviceOffline("d".into()).code(codes::BYE_FAILED), "11002");
        assert_eq!(GatewayError::Timeout("bye".into()).code(codes::BYE_FAILED), "11003");
        assert_eq!(
            GatewayError::OwnedElsewhere { device_id: "d".into(), owner: "10.0.0.2:8080".into() }
                .code(codes::INVITE_FAILED),
            "11005"
        );
    }
}
