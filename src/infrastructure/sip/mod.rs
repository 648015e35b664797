//! SIP signalling: transports, dispatch, registrar, dialogs, trunks

pub mod actions;
pub mod auth;
pub mod builder;
pub mod call_router;
pub mod dialog;
pub mod invite_client;
pub mod message;
pub mod registrar;
pub mod sdp;
pub mod server;
pub mod transport;
pub mod trunk_registrar;

pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use server::{SipHandler, SipServer};
