//! SIP message handlers

use super::manscdp::ManscdpMessage;
use super::message::{header_uri, HeaderAccess, SipError, SipRequest, SipResponse};
use crate::domain::{device::uri_user, Device};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

/// Trait for handling inbound SIP requests
#[async_trait]
pub trait SipHandler: Send + Sync {
    /// Handle a request received from `source`. `None` sends nothing back
    /// (ACK).
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<Option<SipResponse>, SipError>;
}

/// What inbound handlers hand over to the device state machine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceEvents: Send + Sync {
    /// A device (re)registered. Must not block the REGISTER response.
    fn on_registered(&self, device: Arc<Device>);

    async fn on_manscdp(&self, device: Arc<Device>, message: ManscdpMessage);

    /// The device hung up the dialog identified by `call_id`.
    async fn on_peer_bye(&self, device: Arc<Device>, call_id: String);
}

/// `(device_id, from_uri)` of the request's originator
pub fn originator(request: &SipRequest) -> Option<(String, String)> {
    let from = request.from_header()?;
    let uri = header_uri(&from);
    let device_id = uri_user(uri)?;
    Some((device_id.to_string(), uri.to_string()))
}
