//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases.
//! It's responsible for:
//! - Driving the per-device and per-channel signaling state machine
//! - Joining catalogs that arrive in fragments
//! - Rebuilding sessions after a restart
//! - Periodic catalog refresh of every known device

pub mod catalog;
pub mod device_service;
pub mod recovery;
pub mod scheduler;

pub use catalog::{CatalogAssembler, CATALOG_FRAGMENT_WINDOW};
pub use device_service::{DeviceService, InviteMode};
pub use recovery::{recover, RecoveryReport, RECOVERY_BATCH};
pub use scheduler::KeepaliveScheduler;
