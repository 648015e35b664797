//! Application layer - the call-flow engine and its SIP action boundary

pub mod actions;
pub mod context;
pub mod engine;

pub use actions::{CollectResult, PromptRef, RecordResult, RingOutcome, SipActions};
pub use context::CallContext;
pub use engine::FlowEngine;
