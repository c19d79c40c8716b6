//! Device and channel aggregate

pub mod channel;
pub mod entity;
pub mod invite_guard;

pub use channel::{CatalogEntry, Channel, ChannelInfo, ChannelSnapshot, Dialog};
pub use entity::{uri_host, uri_user, Device, DeviceSnapshot};
pub use invite_guard::{InviteGuard, InviteState};
