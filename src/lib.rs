//! gbgate - a GB28181 signaling gateway
//!
//! Authenticates video devices over SIP, tracks their sessions and channel
//! catalogs, and drives INVITE/BYE towards them on behalf of an operator API.
//! Session ownership and in-flight dialogs are mirrored into a shared store
//! so several instances can serve one device population.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::GatewayError;
pub use domain::shared::result::Result;
