//! SIP action boundary
//!
//! The flow engine consumes this interface; the SIP layer implements it.
//! Nothing in the engine reaches into SIP or media types directly.

use std::path::{Path, PathBuf};

use crate::application::context::CallContext;
use crate::domain::ring_group::RingStrategy;
use crate::Result;

/// Outcome of ringing one or more targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOutcome {
    Answered,
    Busy,
    Dnd,
    NoAnswer,
    /// Nobody to ring. Folded into `no_answer` at the flow-edge level;
    /// the SIP layer still answers 503 on the wire.
    NoRegistrations,
}

impl RingOutcome {
    /// Flow edge label this outcome maps to.
    pub fn edge_label(&self) -> &'static str {
        match self {
            RingOutcome::Answered => "answered",
            RingOutcome::Busy => "busy",
            RingOutcome::Dnd => "dnd",
            RingOutcome::NoAnswer | RingOutcome::NoRegistrations => "no_answer",
        }
    }
}

/// What to play: a stored prompt, a file on disk, or TTS text
#[derive(Debug, Clone)]
pub enum PromptRef {
    Prompt(i64),
    File(PathBuf),
    Tts(String),
}

/// Result of `play_and_collect`
#[derive(Debug, Clone, Default)]
pub struct CollectResult {
    pub digits: String,
    pub timed_out: bool,
}

/// Result of `record_message`
#[derive(Debug, Clone)]
pub struct RecordResult {
    pub file_path: PathBuf,
    pub duration_secs: u32,
    pub packet_count: u64,
}

/// Actions the flow engine can ask of the SIP/media layers. Every call may
/// suspend for network I/O or user input and honours context cancellation.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SipActions: Send + Sync {
    /// Ring one extension's registered contacts.
    async fn ring_extension(
        &self,
        ctx: &CallContext,
        extension_id: i64,
        timeout_secs: u32,
    ) -> Result<RingOutcome>;

    /// Ring a set of extensions with the given strategy. The group id keys
    /// the round-robin rotation memory.
    async fn ring_group(
        &self,
        ctx: &CallContext,
        group_id: i64,
        extension_ids: &[i64],
        strategy: RingStrategy,
        timeout_secs: u32,
    ) -> Result<RingOutcome>;

    /// Ring an extension's follow-me legs per its configuration.
    async fn ring_follow_me(&self, ctx: &CallContext, extension_id: i64) -> Result<RingOutcome>;

    /// Play a prompt to completion.
    async fn play_prompt(&self, ctx: &CallContext, prompt: PromptRef) -> Result<()>;

    /// Play a prompt and collect DTMF digits.
    async fn play_and_collect(
        &self,
        ctx: &CallContext,
        prompt: Option<PromptRef>,
        initial_timeout_secs: u32,
        inter_digit_timeout_secs: u32,
        max_digits: usize,
        terminator: Option<char>,
    ) -> Result<CollectResult>;

    /// Play an optional greeting, then record the caller to `file_path`.
    async fn record_message(
        &self,
        ctx: &CallContext,
        greeting: Option<PromptRef>,
        max_duration_secs: u32,
        file_path: &Path,
    ) -> Result<RecordResult>;

    /// Send a message-summary NOTIFY to the extension's registered devices.
    async fn send_mwi(&self, extension_id: i64, new_count: u32, old_count: u32) -> Result<()>;

    /// Tear the call down.
    async fn hangup<'a>(
        &'a self,
        ctx: &'a CallContext,
        cause: &'a str,
        reason: Option<&'a str>,
    ) -> Result<()>;

    /// Blind transfer to a destination and leave the call.
    async fn blind_transfer(&self, ctx: &CallContext, destination: &str) -> Result<()>;

    /// Join a conference bridge; returns when the participant leaves.
    async fn join_conference(&self, ctx: &CallContext, bridge_id: i64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_edge_labels() {
        assert_eq!(RingOutcome::Answered.edge_label(), "answered");
        assert_eq!(RingOutcome::Busy.edge_label(), "busy");
        assert_eq!(RingOutcome::Dnd.edge_label(), "dnd");
        assert_eq!(RingOutcome::NoAnswer.edge_label(), "no_answer");
        // no_registrations folds into no_answer for edge selection
        assert_eq!(RingOutcome::NoRegistrations.edge_label(), "no_answer");
    }
}
