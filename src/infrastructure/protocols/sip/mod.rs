//! SIP signaling for GB28181 devices
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Inbound handlers      │
//! │ (REGISTER, MESSAGE, ..) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │  Server / client txns   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │      (UDP, TCP)         │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call_handler;
pub mod client;
pub mod handler;
pub mod manscdp;
pub mod message;
pub mod message_handler;
pub mod registrar;
pub mod rport;
pub mod sdp;
pub mod server;
pub mod transport;

pub use auth::{AuthChallenge, DigestAuthenticator};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use call_handler::{AckHandler, ByeHandler, InviteRejectHandler, OptionsHandler};
pub use client::{ProvisionalHandler, SipClient, TransactionClient};
pub use handler::{DeviceEvents, SipHandler};
pub use manscdp::{ManscdpMessage, ManscdpResponse};
pub use message::{HeaderAccess, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use message_handler::MessageHandler;
pub use registrar::Registrar;
pub use sdp::{InviteOffer, PlayMode};
pub use server::SipServer;
pub use transport::{TcpTransport, Transport, TransportProtocol, UdpTransport};
