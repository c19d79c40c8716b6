//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! Nonces are not remembered: any instance can verify a response to a
//! challenge issued by another instance, the device's secret being the
//! only shared state.

use super::message::{SipError, SipRequest};
use crate::domain::{GatewayError, Result};
use crate::infrastructure::facade::DeviceRegistry;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Authentication challenge
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
}

impl AuthChallenge {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            nonce: Self::generate_nonce(),
            algorithm: "MD5".to_string(),
            qop: None,
        }
    }

    fn generate_nonce() -> String {
        let mut rng = rand::thread_rng();
        let random_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        hex::encode(random_bytes)
    }

    /// Format as WWW-Authenticate header value
    pub fn to_header_value(&self) -> String {
        if let Some(qop) = &self.qop {
            format!(
                r#"Digest realm="{}", nonce="{}", algorithm={}, qop="{}""#,
                self.realm, self.nonce, self.algorithm, qop
            )
        } else {
            format!(
                r#"Digest realm="{}", nonce="{}", algorithm={}"#,
                self.realm, self.nonce, self.algorithm
            )
        }
    }
}

/// Parsed Authorization header
#[derive(Debug, Clone)]
pub struct AuthorizationHeader {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

impl AuthorizationHeader {
    pub fn parse(auth_value: &str) -> std::result::Result<Self, SipError> {
        let params = Self::parse_digest_params(auth_value);
        let required = |name: &str| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| SipError::Authentication(format!("Missing {} in Authorization", name)))
        };

        Ok(Self {
            username: required("username")?,
            realm: required("realm")?,
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
            nc: params.get("nc").cloned(),
            cnonce: params.get("cnonce").cloned(),
        })
    }

    fn parse_digest_params(auth_value: &str) -> HashMap<String, String> {
        let trimmed = auth_value.trim();
        let digest_str = match trimmed.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("digest ") => &trimmed[7..],
            _ => trimmed,
        };

        digest_str
            .split(',')
            .filter_map(|part| {
                let (key, value) = part.trim().split_once('=')?;
                Some((
                    key.trim().to_ascii_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                ))
            })
            .collect()
    }
}

/// Expected digest response.
///
/// `MD5(HA1:nonce:HA2)`, or `MD5(HA1:nonce:nc:cnonce:qop:HA2)` when a qop
/// was negotiated.
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    let digest = match qop {
        Some(qop_value) => md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1,
            nonce,
            nc.unwrap_or("00000001"),
            cnonce.unwrap_or(""),
            qop_value,
            ha2
        )),
        None => md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)),
    };
    format!("{:x}", digest)
}

/// Challenges REGISTER requests and checks their digest against the
/// device's secret from the registry.
pub struct DigestAuthenticator {
    realm: String,
    registry: Arc<dyn DeviceRegistry>,
}

impl DigestAuthenticator {
    pub fn new(realm: &str, registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            realm: realm.to_string(),
            registry,
        }
    }

    pub fn create_challenge(&self) -> AuthChallenge {
        let challenge = AuthChallenge::new(&self.realm);
        debug!("Created auth challenge with nonce: {}", challenge.nonce);
        challenge
    }

    /// Verify the credentials of `device_id` on a request.
    ///
    /// `AuthChallengeRequired`, `AuthMismatch` and `DeviceUnknown` all call
    /// for a fresh challenge; `Parameter` means the request is unusable.
    pub async fn verify_request(&self, request: &SipRequest, device_id: &str) -> Result<()> {
        let mut authorizations = request.authorizations();
        let auth_value = match authorizations.len() {
            0 => return Err(GatewayError::AuthChallengeRequired),
            1 => authorizations.remove(0),
            n => {
                warn!(device_id = %device_id, "Rejecting REGISTER with {} Authorization headers", n);
                return Err(GatewayError::Parameter(
                    "multiple Authorization headers".to_string(),
                ));
            }
        };

        let auth = AuthorizationHeader::parse(&auth_value).map_err(|e| {
            warn!(device_id = %device_id, "Malformed Authorization header: {}", e);
            GatewayError::AuthMismatch(device_id.to_string())
        })?;

        let credential = self.registry.lookup(device_id).await.map_err(|e| {
            warn!(device_id = %device_id, "Device lookup failed: {}", e);
            GatewayError::DeviceUnknown(device_id.to_string())
        })?;

        // HA1 always binds our own realm, whatever the header claims
        let expected = calculate_response(
            &auth.username,
            &credential.password,
            &self.realm,
            &auth.nonce,
            &request.method_name(),
            &auth.uri,
            auth.qop.as_deref(),
            auth.nc.as_deref(),
            auth.cnonce.as_deref(),
        );

        if expected.as_bytes() != auth.response.as_bytes() {
            warn!(device_id = %device_id, "Authentication failed: response mismatch");
            return Err(GatewayError::AuthMismatch(device_id.to_string()));
        }

        info!(device_id = %device_id, "Authentication successful");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::facade::{DeviceCredential, MockDeviceRegistry};
    use crate::infrastructure::protocols::sip::builder::RequestBuilder;
    use crate::infrastructure::protocols::sip::message::SipMethod;

    fn register(authorizations: &[String]) -> SipRequest {
        let mut builder = RequestBuilder::new(SipMethod::Register, "sip:34020000002000000001@3402000000")
            .via("UDP", "192.168.1.64", 5060, "z9hG4bK-1")
            .from("<sip:34020000001320000001@3402000000>;tag=1")
            .to("<sip:34020000001320000001@3402000000>")
            .call_id("reg-1")
            .cseq(2);
        for value in authorizations {
            builder = builder.header("Authorization", value.clone());
        }
        builder.build().unwrap()
    }

    fn authorization(password: &str) -> String {
        authorization_in("3402000000", password)
    }

    fn authorization_in(realm: &str, password: &str) -> String {
        let response = calculate_response(
            "34020000001320000001",
            password,
            realm,
            "0a4f113b",
            "REGISTER",
            "sip:34020000002000000001@3402000000",
            None,
            None,
            None,
        );
        format!(
            r#"Digest username="34020000001320000001", realm="{}", nonce="0a4f113b", uri="sip:34020000002000000001@3402000000", response="{}", algorithm=MD5"#,
            realm, response
        )
    }

    fn registry(password: &'static str) -> Arc<dyn DeviceRegistry> {
        let mut registry = MockDeviceRegistry::new();
        registry.expect_lookup().returning(move |id| {
            Ok(DeviceCredential {
                device_id: id.to_string(),
                password: password.to_string(),
            })
        });
        Arc::new(registry)
    }

    #[test]
    fn test_challenge_header() {
        let challenge = AuthChallenge::new("3402000000");
        let value = challenge.to_header_value();
        assert!(value.starts_with(r#"Digest realm="3402000000", nonce=""#));
        assert!(value.ends_with("algorithm=MD5"));
        assert_eq!(challenge.nonce.len(), 32);
        assert_ne!(challenge.nonce, AuthChallenge::new("3402000000").nonce);
    }

    #[test]
    fn test_parse_authorization() {
        let auth = AuthorizationHeader::parse(&authorization("12345678")).unwrap();
        assert_eq!(auth.username, "34020000001320000001");
        assert_eq!(auth.nonce, "0a4f113b");
        assert!(AuthorizationHeader::parse("Digest username=\"x\"").is_err());
    }

    #[test]
    fn test_known_vector() {
        // RFC 2617 section 3.5
        let response = calculate_response(
            "Mufasa",
            "Circle Of Life",
            "testrealm@host.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "GET",
            "/dir/index.html",
            Some("auth"),
            Some("00000001"),
            Some("0a4f113b"),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[tokio::test]
    async fn test_verify_outcomes() {
        let auth = DigestAuthenticator::new("3402000000", registry("12345678"));
        let device = "34020000001320000001";

        assert_eq!(
            auth.verify_request(&register(&[]), device).await,
            Err(GatewayError::AuthChallengeRequired)
        );
        assert!(auth
            .verify_request(&register(&[authorization("12345678")]), device)
            .await
            .is_ok());
        assert_eq!(
            auth.verify_request(&register(&[authorization("wrong")]), device).await,
            Err(GatewayError::AuthMismatch(device.to_string()))
        );
        assert!(matches!(
            auth.verify_request(
                &register(&[authorization("12345678"), authorization("12345678")]),
                device
            )
            .await,
            Err(GatewayError::Parameter(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_realm_is_rejected() {
        let auth = DigestAuthenticator::new("3402000000", registry("12345678"));
        let device = "34020000001320000001";

        // Correct password, but hashed against a realm we never offered
        let forged = authorization_in("4401000000", "12345678");
        assert_eq!(
            auth.verify_request(&register(&[forged]), device).await,
            Err(GatewayError::AuthMismatch(device.to_string()))
        );
    }

    #[tokio::test]
    async fn test_unknown_device_is_rechallenged() {
        let mut registry = MockDeviceRegistry::new();
        registry
            .expect_lookup()
            .returning(|id| Err(GatewayError::DeviceUnknown(id.to_string())));
        let auth = DigestAuthenticator::new("3402000000", Arc::new(registry));

        let err = auth
            .verify_request(&register(&[authorization("x")]), "34020000001320000001")
            .await
            .unwrap_err();
        assert!(err.is_rechallenge());
    }
}
