//! Skylark - a self-hosted, single-binary PBX
//!
//! Terminates SIP signalling, relays RTP media, and routes every inbound
//! call through a user-designed call-flow graph.

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::Result;
