/// REGISTER handling: digest challenge, session upsert, de-registration
use async_trait::async_trait;
use chrono::Utc;
use rsip::Header;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::auth::DigestAuthenticator;
use super::builder::ResponseBuilder;
use super::handler::{originator, DeviceEvents, SipHandler};
use super::message::{HeaderAccess, SipError, SipRequest, SipResponse};
use super::rport::resolve_send_addr;
use crate::config::SipConfig;
use crate::domain::{Device, GatewayError};
use crate::infrastructure::persistence::SessionStore;

/// GB28181 time sync format for the `Date` header of a REGISTER 200
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

pub struct Registrar {
    config: Arc<SipConfig>,
    auth: Arc<DigestAuthenticator>,
    sessions: Arc<SessionStore>,
    events: Arc<dyn DeviceEvents>,
}

impl Registrar {
    pub fn new(
        config: Arc<SipConfig>,
        auth: Arc<DigestAuthenticator>,
        sessions: Arc<SessionStore>,
        events: Arc<dyn DeviceEvents>,
    ) -> Self {
        Self {
            config,
            auth,
            sessions,
            events,
        }
    }

    fn challenge(&self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let challenge = self.auth.create_challenge();
        ResponseBuilder::unauthorized()
            .header(Header::Other(
                "WWW-Authenticate".to_string(),
                challenge.to_header_value(),
            ))
            .build_for_request(request)
    }

    fn expires(&self, request: &SipRequest) -> Duration {
        request
            .expires()
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_expires())
    }

    async fn register(
        &self,
        request: &SipRequest,
        source: SocketAddr,
        device_id: String,
        from_uri: String,
        expires: Duration,
    ) -> Result<(), GatewayError> {
        let addr = match request.via() {
            Some(via) => resolve_send_addr(&via, source),
            None => source.to_string(),
        };
        let device = Device::new(device_id.as_str(), from_uri, addr, expires);
        if let Some(previous) = self.sessions.peek(&device_id) {
            device.adopt(&previous).await;
        }

        let device = self.sessions.store(device, expires).await?;
        info!(
            device_id = %device_id,
            addr = %device.addr,
            expires = expires.as_secs(),
            "Device registered"
        );
        self.events.on_registered(device);
        Ok(())
    }
}

#[async_trait]
impl SipHandler for Registrar {
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<Option<SipResponse>, SipError> {
        debug!("Handling REGISTER request from {}", source);

        let Some((device_id, from_uri)) = originator(&request) else {
            warn!("REGISTER without a usable From header from {}", source);
            return ResponseBuilder::new(400).build_for_request(&request).map(Some);
        };

        match self.auth.verify_request(&request, &device_id).await {
            Ok(()) => {}
            Err(e) if e.is_rechallenge() => {
                debug!(device_id = %device_id, "Challenging REGISTER: {}", e);
                return self.challenge(&request).map(Some);
            }
            Err(e) => {
                warn!(device_id = %device_id, "Rejecting REGISTER: {}", e);
                return ResponseBuilder::new(400).build_for_request(&request).map(Some);
            }
        }

        let expires = self.expires(&request);
        if expires.is_zero() {
            info!(device_id = %device_id, "Device unregistered");
            self.sessions.remove(&device_id).await;
        } else if let Err(e) = self
            .register(&request, source, device_id.clone(), from_uri, expires)
            .await
        {
            warn!(device_id = %device_id, "Failed to store session: {}", e);
            return ResponseBuilder::server_internal_error()
                .build_for_request(&request)
                .map(Some);
        }

        let date = Utc::now().format(DATE_FORMAT).to_string();
        ResponseBuilder::ok()
            .header(Header::Expires(expires.as_secs().to_string().into()))
            .header(Header::Other("Date".to_string(), date))
            .build_for_request(&request)
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::facade::{DeviceCredential, MockDeviceRegistry};
    use crate::infrastructure::persistence::{DistributedRouter, MemoryStore};
    use crate::infrastructure::protocols::sip::auth::calculate_response;
    use crate::infrastructure::protocols::sip::builder::RequestBuilder;
    use crate::infrastructure::protocols::sip::handler::MockDeviceEvents;
    use crate::infrastructure::protocols::sip::message::SipMethod;

    const DEVICE: &str = "34020000001320000001";
    const URI: &str = "sip:34020000002000000001@3402000000";

    fn source() -> SocketAddr {
        "203.0.113.9:40000".parse().unwrap()
    }

    fn register(expires: u64, authorization: Option<String>) -> SipRequest {
        let mut builder = RequestBuilder::new(SipMethod::Register, URI)
            .via("UDP", "192.168.1.64", 5060, "z9hG4bK-reg")
            .from(format!("<sip:{}@3402000000>;tag=1", DEVICE))
            .to(format!("<sip:{}@3402000000>", DEVICE))
            .call_id("reg-1")
            .cseq(1)
            .header("Expires", expires.to_string());
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        builder.build().unwrap()
    }

    fn authorization(password: &str) -> String {
        let nonce = "0123456789abcdef";
        let response = calculate_response(
            DEVICE, password, "3402000000", nonce, "REGISTER", URI, None, None, None,
        );
        format!(
            "Digest username=\"{}\", realm=\"3402000000\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            DEVICE, nonce, URI, response
        )
    }

    fn registrar(events: MockDeviceEvents) -> (Registrar, Arc<SessionStore>) {
        let mut registry = MockDeviceRegistry::new();
        registry.expect_lookup().returning(|id| {
            Ok(DeviceCredential {
                device_id: id.to_string(),
                password: "12345678".to_string(),
            })
        });
        let config = Arc::new(SipConfig::default());
        let auth = Arc::new(DigestAuthenticator::new(&config.realm, Arc::new(registry)));
        let router = Arc::new(DistributedRouter::new(Arc::new(MemoryStore::new()), "10.0.0.1:8080"));
        let sessions = Arc::new(SessionStore::new(router));
        (
            Registrar::new(config, auth, sessions.clone(), Arc::new(events)),
            sessions,
        )
    }

    #[tokio::test]
    async fn test_register_without_credentials_is_challenged() {
        let (registrar, sessions) = registrar(MockDeviceEvents::new());
        let response = registrar
            .handle_request(register(3600, None), source())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.status_code(), 401);
        let challenge = response.header("www-authenticate").unwrap();
        assert!(challenge.contains("realm=\"3402000000\""));
        assert!(challenge.contains("nonce=\""));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_register_with_wrong_password_is_rechallenged() {
        let (registrar, sessions) = registrar(MockDeviceEvents::new());
        let response = registrar
            .handle_request(register(3600, Some(authorization("wrong"))), source())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.status_code(), 401);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_register_success_stores_session() {
        let mut events = MockDeviceEvents::new();
        events.expect_on_registered().times(1).return_const(());
        let (registrar, sessions) = registrar(events);

        let response = registrar
            .handle_request(register(600, Some(authorization("12345678"))), source())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header("expires").as_deref(), Some("600"));
        assert!(response.header("date").is_some());

        let device = sessions.get(DEVICE).await.unwrap();
        assert_eq!(device.addr, "192.168.1.64:5060");
        assert_eq!(device.from, format!("sip:{}@3402000000", DEVICE));
        assert_eq!(device.expires, Duration::from_secs(600));
        assert!(device.channel(DEVICE).await.is_some());
    }

    #[tokio::test]
    async fn test_expires_zero_unregisters() {
        let mut events = MockDeviceEvents::new();
        events.expect_on_registered().times(1).return_const(());
        let (registrar, sessions) = registrar(events);

        registrar
            .handle_request(register(600, Some(authorization("12345678"))), source())
            .await
            .unwrap();
        assert!(sessions.exist(DEVICE).await);

        let response = registrar
            .handle_request(register(0, Some(authorization("12345678"))), source())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), 200);
        assert!(!sessions.exist(DEVICE).await);
    }

    #[tokio::test]
    async fn test_multiple_authorization_headers_rejected() {
        let (registrar, sessions) = registrar(MockDeviceEvents::new());
        let request = RequestBuilder::new(SipMethod::Register, URI)
            .via("UDP", "192.168.1.64", 5060, "z9hG4bK-reg2")
            .from(format!("<sip:{}@3402000000>;tag=1", DEVICE))
            .to(format!("<sip:{}@3402000000>", DEVICE))
            .call_id("reg-2")
            .cseq(1)
            .header("Authorization", authorization("12345678"))
            .header("Authorization", authorization("12345678"))
            .build()
            .unwrap();

        let response = registrar
            .handle_request(request, source())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), 400);
        assert!(sessions.is_empty());
    }
}
