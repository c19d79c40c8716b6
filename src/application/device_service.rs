//! Device and channel state machine
//!
//! Catalog queries, stream INVITEs and the two BYE paths. Every request
//! draws its CSeq from the shared store so instances addressing the same
//! device never reuse a sequence number.

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::catalog::CatalogAssembler;
use crate::config::SipConfig;
use crate::domain::{Channel, ChannelInfo, Device, Dialog, GatewayError, Result};
use crate::infrastructure::facade::MediaAllocator;
use crate::infrastructure::persistence::SessionStore;
use crate::infrastructure::protocols::sip::builder::{new_branch, new_call_id, new_tag};
use crate::infrastructure::protocols::sip::manscdp::{self, ManscdpMessage, ManscdpResponse};
use crate::infrastructure::protocols::sip::{
    DeviceEvents, HeaderAccess, InviteOffer, PlayMode, ProvisionalHandler, RequestBuilder,
    SipClient, SipError, SipMethod, SipRequest, SipResponse,
};

/// Whether an invite honours the per-channel guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteMode {
    /// At most one INVITE per channel; a stale dialog is torn down first
    Guarded,
    /// Skips the guard and the dialog record (diagnostic override)
    Unguarded,
}

fn signaling(e: SipError) -> GatewayError {
    GatewayError::Signaling(e.to_string())
}

fn expect_ok(method: SipMethod, response: &SipResponse) -> Result<()> {
    match response.status_code() {
        200 => Ok(()),
        code => Err(GatewayError::Signaling(format!("{} answered {}", method, code))),
    }
}

#[derive(Clone)]
pub struct DeviceService {
    config: Arc<SipConfig>,
    sessions: Arc<SessionStore>,
    client: Arc<dyn SipClient>,
    media: Arc<dyn MediaAllocator>,
    catalogs: Arc<CatalogAssembler>,
    bye_timeout: Duration,
}

impl DeviceService {
    pub fn new(
        config: Arc<SipConfig>,
        sessions: Arc<SessionStore>,
        client: Arc<dyn SipClient>,
        media: Arc<dyn MediaAllocator>,
    ) -> Self {
        Self {
            bye_timeout: config.bye_timeout(),
            config,
            sessions,
            client,
            media,
            catalogs: Arc::new(CatalogAssembler::default()),
        }
    }

    pub fn with_bye_timeout(mut self, timeout: Duration) -> Self {
        self.bye_timeout = timeout;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Valid local session, or the reason there is none.
    pub async fn online(&self, device_id: &str) -> Result<Arc<Device>> {
        if let Some(device) = self.sessions.get(device_id).await {
            return Ok(device);
        }
        let router = self.sessions.router();
        match router.get_route(device_id).await {
            Some(owner) if owner != router.instance_addr() => Err(GatewayError::OwnedElsewhere {
                device_id: device_id.to_string(),
                owner,
            }),
            _ => Err(GatewayError::DeviceOffline(device_id.to_string())),
        }
    }

    /// Online device and one of its channels. A channel the device never
    /// reported is answered like an offline device.
    pub async fn find_channel(
        &self,
        device_id: &str,
        channel_id: &str,
    ) -> Result<(Arc<Device>, Arc<Channel>)> {
        let device = self.online(device_id).await?;
        let channel = device
            .channel(channel_id)
            .await
            .ok_or_else(|| GatewayError::DeviceOffline(format!("{} channel {}", device_id, channel_id)))?;
        Ok((device, channel))
    }

    fn target_uri(device: &Device, user: &str) -> String {
        format!("sip:{}@{}", user, device.from_host())
    }

    /// Headers shared by every request the gateway originates.
    fn outbound(&self, method: SipMethod, uri: &str, cseq: u32) -> RequestBuilder {
        RequestBuilder::new(method, uri)
            .via(
                self.config.transport_name(),
                &self.config.sip_ip,
                self.config.sip_port,
                &new_branch(),
            )
            .cseq(cseq)
            .max_forwards(70)
            .user_agent(self.config.user_agent.as_str())
    }

    /// Send a catalog query to `device`.
    pub async fn query(&self, device: &Device) -> Result<()> {
        let cseq = self.sessions.router().next_cseq(device).await;
        let uri = Self::target_uri(device, &device.device_id);
        let request = self
            .outbound(SipMethod::Message, &uri, cseq)
            .from(format!("<{}>;tag={}", self.config.local_uri(), new_tag()))
            .to(format!("<{}>", uri))
            .call_id(new_call_id())
            .content_type(manscdp::CONTENT_TYPE)
            .body(manscdp::catalog_query(cseq, &device.device_id).into_bytes())
            .build()
            .map_err(signaling)?;

        let response = self
            .client
            .request(request, &device.addr, None)
            .await
            .map_err(signaling)?;
        expect_ok(SipMethod::Message, &response)?;
        debug!(device_id = %device.device_id, cseq, "Catalog query accepted");
        Ok(())
    }

    pub async fn query_device(&self, device_id: &str) -> Result<()> {
        let device = self.online(device_id).await?;
        self.query(&device).await
    }

    /// Catalog query on a detached task; failures are only logged.
    pub fn spawn_query(&self, device: Arc<Device>) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.query(&device).await {
                warn!(device_id = %device.device_id, "Catalog query failed: {}", e);
            }
        });
    }

    /// Start a live (`start == 0`) or playback stream. Returns the stream path.
    pub async fn invite(
        &self,
        device_id: &str,
        channel_id: &str,
        start: i64,
        end: i64,
        mode: InviteMode,
    ) -> Result<String> {
        let (device, channel) = self.find_channel(device_id, channel_id).await?;

        if mode == InviteMode::Guarded {
            if !channel.guard().try_begin() {
                debug!(device_id = %device_id, channel_id = %channel_id, "Channel already invited");
                return Err(GatewayError::AlreadyInvited(channel_id.to_string()));
            }
            // Reclaim a dialog an earlier invite may have left behind
            if let Err(e) = self.bye_persisted(&device, channel_id).await {
                debug!(channel_id = %channel_id, "No stale dialog reclaimed: {}", e);
            }
        }

        let play = PlayMode::from_range(start, end);
        counter!("gb_invites_total").increment(1);
        match self.send_invite(&device, &channel, play).await {
            Ok(dialog) => {
                if mode == InviteMode::Guarded {
                    channel.guard().complete();
                    self.sessions
                        .router()
                        .add_channel_info(channel_id, ChannelInfo::from_dialog(&dialog))
                        .await;
                }
                let stream_path = play.stream_path(channel_id);
                info!(
                    device_id = %device_id,
                    channel_id = %channel_id,
                    call_id = %dialog.call_id,
                    "Stream {} started",
                    stream_path
                );
                Ok(stream_path)
            }
            Err(e) => {
                if mode == InviteMode::Guarded {
                    channel.guard().rollback();
                }
                counter!("gb_invites_failed").increment(1);
                warn!(device_id = %device_id, channel_id = %channel_id, "Invite failed: {}", e);
                Err(e)
            }
        }
    }

    async fn send_invite(&self, device: &Device, channel: &Channel, play: PlayMode) -> Result<Dialog> {
        let allocated = self.media.create_channel(channel.id()).await?;
        let ssrc = play.ssrc(allocated);
        let offer = InviteOffer {
            serial: &self.config.serial,
            channel_id: channel.id(),
            media_ip: &self.config.media_ip,
            media_port: self.config.media_port,
            mode: play,
            ssrc: &ssrc,
        };

        let cseq = self.sessions.router().next_cseq(device).await;
        let uri = Self::target_uri(device, channel.id());
        let request = self
            .outbound(SipMethod::Invite, &uri, cseq)
            .from(format!("<{}>;tag={}", self.config.local_uri(), new_tag()))
            .to(format!("<{}>", uri))
            .call_id(new_call_id())
            .contact(format!("<{}>", self.config.local_uri()))
            .header("Subject", offer.subject())
            .content_type("APPLICATION/SDP")
            .body(offer.to_sdp().into_bytes())
            .build()
            .map_err(signaling)?;

        let channel_id = channel.id().to_string();
        let on_provisional: ProvisionalHandler = Box::new(move |response: &SipResponse| {
            debug!(channel_id = %channel_id, "INVITE progress {}", response.status_code());
        });
        let response = self
            .client
            .request(request.clone(), &device.addr, Some(on_provisional))
            .await
            .map_err(signaling)?;
        expect_ok(SipMethod::Invite, &response)?;

        let dialog = Dialog {
            call_id: response
                .call_id()
                .or_else(|| request.call_id())
                .unwrap_or_default(),
            from_header: response.from_header().unwrap_or_default(),
            to_header: response.to_header().unwrap_or_default(),
            from_tag: response.from_tag().unwrap_or_default(),
            to_tag: response.to_tag().unwrap_or_default(),
        };
        self.ack(device, &uri, &dialog, cseq).await;
        channel.set_dialog(dialog.clone());
        Ok(dialog)
    }

    async fn ack(&self, device: &Device, uri: &str, dialog: &Dialog, cseq: u32) {
        let ack = self
            .outbound(SipMethod::Ack, uri, cseq)
            .from(dialog.from_header.as_str())
            .to(dialog.to_header.as_str())
            .call_id(dialog.call_id.as_str())
            .build();
        let result = match ack {
            Ok(ack) => self.client.send(ack, &device.addr).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(device_id = %device.device_id, call_id = %dialog.call_id, "ACK failed: {}", e);
        }
    }

    fn bye_request(&self, uri: &str, cseq: u32, call_id: &str, from: String, to: String) -> Result<SipRequest> {
        self.outbound(SipMethod::Bye, uri, cseq)
            .from(from)
            .to(to)
            .call_id(call_id)
            .build()
            .map_err(signaling)
    }

    /// Tear down using the dialog held in memory by this process.
    pub async fn bye(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let (device, channel) = self.find_channel(device_id, channel_id).await?;
        let dialog = channel
            .clear_dialog()
            .ok_or_else(|| GatewayError::Signaling(format!("no active dialog on {}", channel_id)))?;
        channel.guard().reset();
        self.sessions.router().take_channel_info(channel_id).await;

        let cseq = self.sessions.router().next_cseq(&device).await;
        let uri = Self::target_uri(&device, channel_id);
        let request = self.bye_request(
            &uri,
            cseq,
            &dialog.call_id,
            dialog.from_header.clone(),
            dialog.to_header.clone(),
        )?;
        let response = self
            .client
            .request(request, &device.addr, None)
            .await
            .map_err(signaling)?;
        expect_ok(SipMethod::Bye, &response)?;
        counter!("gb_byes_total").increment(1);
        info!(device_id = %device_id, channel_id = %channel_id, call_id = %dialog.call_id, "Dialog closed");
        Ok(())
    }

    /// Tear down from the persisted dialog record. Works after a restart or
    /// on an instance other than the one that sent the INVITE.
    pub async fn bye2(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let (device, channel) = self.find_channel(device_id, channel_id).await?;
        let result = self.bye_persisted(&device, channel_id).await;
        channel.clear_dialog();
        channel.guard().reset();
        if result.is_ok() {
            counter!("gb_byes_total").increment(1);
            info!(device_id = %device_id, channel_id = %channel_id, "Dialog closed from record");
        }
        result
    }

    /// BYE built from the `sipc:` record, bounded by the bye deadline.
    /// Leaves the channel guard alone.
    async fn bye_persisted(&self, device: &Device, channel_id: &str) -> Result<()> {
        let info = self
            .sessions
            .router()
            .take_channel_info(channel_id)
            .await
            .ok_or_else(|| GatewayError::Signaling(format!("no dialog record for {}", channel_id)))?;

        let cseq = self.sessions.router().next_cseq(device).await;
        let uri = Self::target_uri(device, channel_id);
        let request = self.bye_request(
            &uri,
            cseq,
            &info.call_id,
            format!("<{}>;tag={}", self.config.local_uri(), info.from_tag),
            format!("<{}>;tag={}", uri, info.to_tag),
        )?;

        // Dropping the request future on timeout abandons the transaction
        match tokio::time::timeout(self.bye_timeout, self.client.request(request, &device.addr, None)).await {
            Err(_) => Err(GatewayError::Timeout(format!(
                "BYE for {} after {:?}",
                channel_id, self.bye_timeout
            ))),
            Ok(Err(e)) => Err(signaling(e)),
            Ok(Ok(response)) => expect_ok(SipMethod::Bye, &response),
        }
    }
}

#[async_trait]
impl DeviceEvents for DeviceService {
    fn on_registered(&self, device: Arc<Device>) {
        counter!("gb_registrations_total").increment(1);
        self.spawn_query(device);
    }

    async fn on_manscdp(&self, device: Arc<Device>, message: ManscdpMessage) {
        match message {
            ManscdpMessage::Notify { cmd_type, .. } => {
                debug!(device_id = %device.device_id, "Notify {}", cmd_type);
                if !device.has_catalog().await {
                    self.spawn_query(device);
                }
            }
            ManscdpMessage::Response(ManscdpResponse::Catalog { sn, sum_num, items, .. }) => {
                let Some(items) = self.catalogs.push(&device.device_id, sn, sum_num, items) else {
                    return;
                };
                info!(
                    device_id = %device.device_id,
                    sn,
                    channels = items.len(),
                    "Catalog received"
                );
                device.replace_channels(items).await;
            }
            ManscdpMessage::Response(ManscdpResponse::RecordInfo { sum_num, .. }) => {
                info!(device_id = %device.device_id, sum_num, "RecordInfo response not handled");
            }
            ManscdpMessage::Response(ManscdpResponse::Other { cmd_type, .. }) => {
                debug!(device_id = %device.device_id, "Ignoring {} response", cmd_type);
            }
            ManscdpMessage::Query { cmd_type, .. } => {
                debug!(device_id = %device.device_id, "Ignoring {} query", cmd_type);
            }
            ManscdpMessage::Other(root) => {
                debug!(device_id = %device.device_id, "Ignoring <{}> document", root);
            }
        }
    }

    async fn on_peer_bye(&self, device: Arc<Device>, call_id: String) {
        let Some(channel) = device.find_channel_by_call_id(&call_id).await else {
            debug!(device_id = %device.device_id, call_id = %call_id, "BYE for unknown dialog");
            return;
        };
        channel.clear_dialog();
        channel.guard().reset();
        self.sessions.router().take_channel_info(channel.id()).await;
        info!(
            device_id = %device.device_id,
            channel_id = %channel.id(),
            call_id = %call_id,
            "Dialog closed by device"
        );
    }
}
