//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Session persistence (shared store, distributed router, session store)
//! - Protocol implementations (SIP)
//! - External service integrations (device registry, media server)

pub mod facade;
pub mod persistence;
pub mod protocols;
