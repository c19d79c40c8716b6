/// MESSAGE handler for MANSCDP bodies (keepalive, catalog, record info)
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::builder::ResponseBuilder;
use super::handler::{originator, DeviceEvents, SipHandler};
use super::manscdp::{self, CONTENT_TYPE};
use super::message::{HeaderAccess, SipError, SipRequest, SipResponse};
use crate::infrastructure::persistence::SessionStore;

pub struct MessageHandler {
    sessions: Arc<SessionStore>,
    events: Arc<dyn DeviceEvents>,
}

impl MessageHandler {
    pub fn new(sessions: Arc<SessionStore>, events: Arc<dyn DeviceEvents>) -> Self {
        Self { sessions, events }
    }

    fn is_manscdp(request: &SipRequest) -> bool {
        request
            .content_type()
            .map(|ct| {
                ct.split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .eq_ignore_ascii_case(CONTENT_TYPE)
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl SipHandler for MessageHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _source: SocketAddr,
    ) -> Result<Option<SipResponse>, SipError> {
        let device = match originator(&request) {
            Some((device_id, _)) => self.sessions.get(&device_id).await,
            None => None,
        };
        let Some(device) = device else {
            return ResponseBuilder::unauthorized()
                .build_for_request(&request)
                .map(Some);
        };

        if !Self::is_manscdp(&request) {
            debug!(
                device_id = %device.device_id,
                content_type = ?request.content_type(),
                "Unsupported MESSAGE content type"
            );
            return ResponseBuilder::new(415).build_for_request(&request).map(Some);
        }

        let message = match manscdp::decode(request.body()) {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %device.device_id, "Undecodable MESSAGE body: {}", e);
                return ResponseBuilder::new(400).build_for_request(&request).map(Some);
            }
        };

        self.events.on_manscdp(device, message).await;
        ResponseBuilder::ok().build_for_request(&request).map(Some)
    }
}
