//! Operator HTTP API

pub mod device_handler;
pub mod dto;
pub mod metrics_handler;
pub mod router;

pub use device_handler::AppState;
pub use dto::ResultCommon;
pub use metrics_handler::{detached_handle, init_metrics};
pub use router::build_router;
