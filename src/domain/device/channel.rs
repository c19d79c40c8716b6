//! Channel entity and dialog records

use super::invite_guard::{InviteGuard, InviteState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Dialog identifiers captured from the last successful INVITE.
///
/// The header values are kept verbatim so a BYE can be built with the
/// same From/To the device saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dialog {
    pub call_id: String,
    pub from_header: String,
    pub to_header: String,
    pub from_tag: String,
    pub to_tag: String,
}

/// Live per-channel call state.
///
/// Shared between successive catalog generations of the same channel so a
/// refresh never drops an active call.
#[derive(Debug, Default)]
pub struct ChannelLive {
    guard: InviteGuard,
    dialog: RwLock<Option<Dialog>>,
}

impl ChannelLive {
    pub fn guard(&self) -> &InviteGuard {
        &self.guard
    }

    pub fn dialog(&self) -> Option<Dialog> {
        self.dialog.read().ok().and_then(|d| d.clone())
    }

    pub fn set_dialog(&self, dialog: Dialog) {
        if let Ok(mut slot) = self.dialog.write() {
            *slot = Some(dialog);
        }
    }

    pub fn clear_dialog(&self) -> Option<Dialog> {
        self.dialog.write().ok().and_then(|mut d| d.take())
    }
}

/// One `<Item>` of a catalog response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub channel_id: String,
    pub parent_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parental: u8,
    pub safety_way: u8,
    pub register_way: u8,
    pub secrecy: u8,
    pub status: String,
}

/// An addressable video source under a device.
#[derive(Debug)]
pub struct Channel {
    pub meta: CatalogEntry,
    /// Key of the owning device in the session store
    pub device_id: String,
    live: Arc<ChannelLive>,
}

impl Channel {
    pub fn new(meta: CatalogEntry, device_id: impl Into<String>) -> Self {
        Self {
            meta,
            device_id: device_id.into(),
            live: Arc::new(ChannelLive::default()),
        }
    }

    /// The channel standing for the device's own stream.
    pub fn self_channel(device_id: &str) -> Self {
        let meta = CatalogEntry {
            channel_id: device_id.to_string(),
            parent_id: device_id.to_string(),
            status: "ON".to_string(),
            ..Default::default()
        };
        Self::new(meta, device_id)
    }

    /// A new catalog generation of this channel that keeps the live call state.
    pub(crate) fn with_live(meta: CatalogEntry, device_id: &str, live: Arc<ChannelLive>) -> Self {
        Self {
            meta,
            device_id: device_id.to_string(),
            live,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.channel_id
    }

    pub fn guard(&self) -> &InviteGuard {
        self.live.guard()
    }

    pub fn dialog(&self) -> Option<Dialog> {
        self.live.dialog()
    }

    pub fn set_dialog(&self, dialog: Dialog) {
        self.live.set_dialog(dialog)
    }

    pub fn clear_dialog(&self) -> Option<Dialog> {
        self.live.clear_dialog()
    }

    pub(crate) fn live(&self) -> Arc<ChannelLive> {
        self.live.clone()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            meta: self.meta.clone(),
            device_id: self.device_id.clone(),
            state: self.guard().state(),
            call_id: self.dialog().map(|d| d.call_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    #[serde(flatten)]
    pub meta: CatalogEntry,
    pub device_id: String,
    pub state: InviteState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// Persisted dialog record, stored under `sipc:<channel>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(rename = "fTag")]
    pub from_tag: String,
    #[serde(rename = "tTag")]
    pub to_tag: String,
}

impl ChannelInfo {
    pub const CALL_ID: &'static str = "callId";
    pub const FROM_TAG: &'static str = "fTag";
    pub const TO_TAG: &'static str = "tTag";

    pub fn from_dialog(dialog: &Dialog) -> Self {
        Self {
            call_id: dialog.call_id.clone(),
            from_tag: dialog.from_tag.clone(),
            to_tag: dialog.to_tag.clone(),
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (Self::CALL_ID.to_string(), self.call_id.clone()),
            (Self::FROM_TAG.to_string(), self.from_tag.clone()),
            (Self::TO_TAG.to_string(), self.to_tag.clone()),
        ]
    }

    /// Returns `None` when the hash has no call id.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let call_id = fields.get(Self::CALL_ID).filter(|v| !v.is_empty())?;
        Some(Self {
            call_id: call_id.clone(),
            from_tag: fields.get(Self::FROM_TAG).cloned().unwrap_or_default(),
            to_tag: fields.get(Self::TO_TAG).cloned().unwrap_or_default(),
        })
    }
}
