//! Voicemail boxes and recorded messages

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Voicemail box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicemailBox {
    pub id: i64,
    pub name: String,
    /// DTMF PIN for mailbox access
    pub pin: Option<String>,
    /// Custom greeting prompt, if recorded
    pub greeting_prompt_id: Option<i64>,
    /// Cap on a single message (seconds)
    pub max_message_secs: u32,
    /// Messages older than this are deleted by the retention sweep
    pub retention_days: u32,
    pub email_notify: bool,
    pub email_address: Option<String>,
    /// Extension that receives MWI NOTIFYs for this box
    pub notify_extension_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recorded voicemail message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicemailMessage {
    pub id: i64,
    pub box_id: i64,
    pub caller_id_name: Option<String>,
    pub caller_id_number: String,
    /// WAV file on disk
    pub file_path: String,
    pub duration_secs: u32,
    pub listened: bool,
    pub created_at: DateTime<Utc>,
}

impl VoicemailMessage {
    /// Whether the message has outlived its box's retention window.
    pub fn expired(&self, retention_days: u32, now: DateTime<Utc>) -> bool {
        retention_days > 0 && now - self.created_at > Duration::days(retention_days as i64)
    }
}

/// Message counts for MWI
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MessageCounts {
    pub new: u32,
    pub old: u32,
}

/// Repository for voicemail boxes and messages
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VoicemailRepository: Send + Sync {
    async fn create_box(&self, mailbox: &VoicemailBox) -> crate::Result<VoicemailBox>;

    async fn update_box(&self, mailbox: &VoicemailBox) -> crate::Result<()>;

    async fn delete_box(&self, id: i64) -> crate::Result<()>;

    async fn get_box(&self, id: i64) -> crate::Result<Option<VoicemailBox>>;

    async fn list_boxes(&self) -> crate::Result<Vec<VoicemailBox>>;

    async fn create_message(&self, message: &VoicemailMessage) -> crate::Result<VoicemailMessage>;

    async fn delete_message(&self, id: i64) -> crate::Result<()>;

    async fn mark_listened(&self, id: i64) -> crate::Result<()>;

    async fn messages_for_box(&self, box_id: i64) -> crate::Result<Vec<VoicemailMessage>>;

    /// New/old counts used for MWI NOTIFY bodies.
    async fn counts_for_box(&self, box_id: i64) -> crate::Result<MessageCounts>;

    /// Messages recorded before `cutoff`, for the retention sweep.
    async fn messages_older_than(
        &self,
        box_id: i64,
        cutoff: DateTime<Utc>,
    ) -> crate::Result<Vec<VoicemailMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(age_days: i64) -> VoicemailMessage {
        VoicemailMessage {
            id: 1,
            box_id: 9,
            caller_id_name: None,
            caller_id_number: "0400111222".into(),
            file_path: "voicemail/box_9/1.wav".into(),
            duration_secs: 12,
            listened: false,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn test_retention_expiry() {
        let now = Utc::now();
        assert!(message(31).expired(30, now));
        assert!(!message(29).expired(30, now));
        // retention 0 means keep forever
        assert!(!message(365).expired(0, now));
    }
}
