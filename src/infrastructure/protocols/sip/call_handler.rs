/// Handlers for in-session requests from devices: OPTIONS, BYE, ACK and the
/// INVITE rejection
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

use super::builder::ResponseBuilder;
use super::handler::{originator, DeviceEvents, SipHandler};
use super::message::{HeaderAccess, SipError, SipRequest, SipResponse};
use crate::domain::Device;
use crate::infrastructure::persistence::SessionStore;

/// Valid session of the request's originator
async fn session_of(sessions: &SessionStore, request: &SipRequest) -> Option<Arc<Device>> {
    let (device_id, _) = originator(request)?;
    sessions.get(&device_id).await
}

/// OPTIONS keepalive: 200 while the device holds a valid session
pub struct OptionsHandler {
    sessions: Arc<SessionStore>,
}

impl OptionsHandler {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl SipHandler for OptionsHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _source: SocketAddr,
    ) -> Result<Option<SipResponse>, SipError> {
        let status = match session_of(&self.sessions, &request).await {
            Some(_) => 200,
            None => 401,
        };
        ResponseBuilder::new(status).build_for_request(&request).map(Some)
    }
}

/// BYE sent by a device to end a stream it was asked for
pub struct ByeHandler {
    sessions: Arc<SessionStore>,
    events: Arc<dyn DeviceEvents>,
}

impl ByeHandler {
    pub fn new(sessions: Arc<SessionStore>, events: Arc<dyn DeviceEvents>) -> Self {
        Self { sessions, events }
    }
}

#[async_trait]
impl SipHandler for ByeHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _source: SocketAddr,
    ) -> Result<Option<SipResponse>, SipError> {
        let Some(device) = session_of(&self.sessions, &request).await else {
            return ResponseBuilder::unauthorized()
                .build_for_request(&request)
                .map(Some);
        };

        if let Some(call_id) = request.call_id() {
            info!(device_id = %device.device_id, call_id = %call_id, "Device ended dialog");
            self.events.on_peer_bye(device, call_id).await;
        }
        ResponseBuilder::ok().build_for_request(&request).map(Some)
    }
}

/// ACK has no response
pub struct AckHandler;

#[async_trait]
impl SipHandler for AckHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<Option<SipResponse>, SipError> {
        debug!(
            call_id = ?request.call_id(),
            "ACK received from {}", source
        );
        Ok(None)
    }
}

/// Devices may not open dialogs towards the gateway
pub struct InviteRejectHandler;

#[async_trait]
impl SipHandler for InviteRejectHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<Option<SipResponse>, SipError> {
        info!("Rejecting inbound INVITE from {}", source);
        ResponseBuilder::new(405)
            .header(rsip::Header::Other(
                "Allow".to_string(),
                "REGISTER, MESSAGE, OPTIONS, BYE, ACK".to_string(),
            ))
            .build_for_request(&request)
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::{DistributedRouter, MemoryStore};
    use crate::infrastructure::protocols::sip::builder::RequestBuilder;
    use crate::infrastructure::protocols::sip::handler::MockDeviceEvents;
    use crate::infrastructure::protocols::sip::message::SipMethod;
    use std::time::Duration;

    const DEVICE: &str = "34020000001320000001";

    fn source() -> SocketAddr {
        "192.168.1.64:5060".parse().unwrap()
    }

    fn request(method: SipMethod, device: &str) -> SipRequest {
        RequestBuilder::new(method, "sip:34020000002000000001@3402000000")
            .via("UDP", "192.168.1.64", 5060, "z9hG4bK-in")
            .from(format!("<sip:{}@3402000000>;tag=7", device))
            .to("<sip:34020000002000000001@3402000000>;tag=8")
            .call_id("dialog-1")
            .cseq(4)
            .build()
            .unwrap()
    }

    async fn sessions() -> Arc<SessionStore> {
        let router = Arc::new(DistributedRouter::new(Arc::new(MemoryStore::new()), "10.0.0.1:8080"));
        let sessions = Arc::new(SessionStore::new(router));
        sessions
            .store(
                Device::new(DEVICE, "sip:34020000001320000001@3402000000", "192.168.1.64:5060", Duration::from_secs(3600)),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        sessions
    }

    #[tokio::test]
    async fn test_options_requires_session() {
        let handler = OptionsHandler::new(sessions().await);

        let known = handler
            .handle_request(request(SipMethod::Options, DEVICE), source())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(known.status_code(), 200);

        let unknown = handler
            .handle_request(request(SipMethod::Options, "34020000001320000099"), source())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unknown.status_code(), 401);
    }

    #[tokio::test]
    async fn test_peer_bye_is_forwarded() {
        let mut events = MockDeviceEvents::new();
        events
            .expect_on_peer_bye()
            .withf(|device, call_id| device.device_id == DEVICE && call_id == "dialog-1")
            .times(1)
            .return_const(());
        let handler = ByeHandler::new(sessions().await, Arc::new(events));

        let response = handler
            .handle_request(request(SipMethod::Bye, DEVICE), source())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), 200);
    }

    #[tokio::test]
    async fn test_bye_without_session_is_unauthorized() {
        let mut events = MockDeviceEvents::new();
        events.expect_on_peer_bye().never();
        let handler = ByeHandler::new(sessions().await, Arc::new(events));

        let response = handler
            .handle_request(request(SipMethod::Bye, "34020000001320000099"), source())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), 401);
    }

    #[tokio::test]
    async fn test_ack_has_no_response_and_invite_is_rejected() {
        let ack = AckHandler
            .handle_request(request(SipMethod::Ack, DEVICE), source())
            .await
            .unwrap();
        assert!(ack.is_none());

        let invite = InviteRejectHandler
            .handle_request(request(SipMethod::Invite, DEVICE), source())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invite.status_code(), 405);
    }
}
