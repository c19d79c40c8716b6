//! Interface layer - External interfaces
//!
//! This layer handles:
//! - Operator REST endpoints
//! - Request/response formatting
//! - Metrics exposition

pub mod api;
