//! Shared kernel - error and result types used across layers

pub mod error;
pub mod result;

pub use error::{codes, GatewayError};
pub use result::Result;
