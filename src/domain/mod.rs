//! Domain layer - devices, channels and the rules around their sessions
//!
//! This layer contains:
//! - Entities: `Device` (one registered edge endpoint) and `Channel`
//! - Value Objects: `ChannelInfo` dialog records, `CatalogEntry`
//! - Concurrency primitives: `InviteGuard`

pub mod device;
pub mod shared;

// Re-export commonly used types
pub use device::{CatalogEntry, Channel, ChannelInfo, Device, Dialog, InviteGuard, InviteState};
pub use shared::{codes, GatewayError, Result};
