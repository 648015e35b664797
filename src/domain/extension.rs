//! Extension entity - a local dialable endpoint identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Follow-me ring strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowMeStrategy {
    /// Legs ring one after another
    Sequential,
    /// All legs ring at once
    Simultaneous,
}

/// One external leg of a follow-me configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowMeLeg {
    /// External number dialled for this leg
    pub number: String,
    /// Delay before this leg starts ringing (seconds)
    pub delay_secs: u32,
    /// Ring timeout for this leg (seconds)
    pub timeout_secs: u32,
    /// Require the answerer to press 1 before bridging
    pub confirm: bool,
}

/// Follow-me configuration for an extension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowMeConfig {
    pub enabled: bool,
    pub strategy: FollowMeStrategy,
    /// Legs in ring order
    pub legs: Vec<FollowMeLeg>,
}

impl Default for FollowMeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: FollowMeStrategy::Sequential,
            legs: Vec::new(),
        }
    }
}

/// Recording policy for calls touching this extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingPolicy {
    Never,
    Inbound,
    Outbound,
    Always,
}

/// Extension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub id: i64,
    /// Human dial string, e.g. "101"
    pub number: String,
    pub display_name: String,
    /// SIP auth username (unique)
    pub sip_username: String,
    /// Argon2id PHC string for the password
    pub password_hash: String,
    /// Precomputed md5(user:realm:password), for SIP digest verification
    pub ha1_md5: String,
    /// Precomputed sha256(user:realm:password)
    pub ha1_sha256: String,
    /// Ring timeout in seconds
    pub ring_timeout_secs: u32,
    pub do_not_disturb: bool,
    pub follow_me: FollowMeConfig,
    pub recording_policy: RecordingPolicy,
    /// Concurrent contact bindings allowed
    pub max_registrations: u32,
    /// Voicemail box owned by this extension, if any
    pub voicemail_box_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Extension {
    pub fn new(number: String, display_name: String, sip_username: String) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            number,
            display_name,
            sip_username,
            password_hash: String::new(),
            ha1_md5: String::new(),
            ha1_sha256: String::new(),
            ring_timeout_secs: 25,
            do_not_disturb: false,
            follow_me: FollowMeConfig::default(),
            recording_policy: RecordingPolicy::Never,
            max_registrations: 3,
            voicemail_box_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Effective per-target ring timeout given an outer budget.
    pub fn effective_ring_timeout(&self, outer_secs: u32) -> u32 {
        self.ring_timeout_secs.min(outer_secs)
    }
}

/// Repository for extensions
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ExtensionRepository: Send + Sync {
    async fn create(&self, extension: &Extension) -> crate::Result<Extension>;

    async fn update(&self, extension: &Extension) -> crate::Result<()>;

    async fn delete(&self, id: i64) -> crate::Result<()>;

    async fn get(&self, id: i64) -> crate::Result<Option<Extension>>;

    async fn get_by_number(&self, number: &str) -> crate::Result<Option<Extension>>;

    async fn get_by_sip_username(&self, username: &str) -> crate::Result<Option<Extension>>;

    async fn list(&self) -> crate::Result<Vec<Extension>>;

    /// Store a new password: Argon2id digest plus both HA1 variants,
    /// written together so digest auth and password checks never diverge.
    async fn set_password(
        &self,
        id: i64,
        password_hash: &str,
        ha1_md5: &str,
        ha1_sha256: &str,
    ) -> crate::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_extension_defaults() {
        let ext = Extension::new("101".into(), "Alice".into(), "alice".into());
        assert_eq!(ext.ring_timeout_secs, 25);
        assert_eq!(ext.max_registrations, 3);
        assert!(!ext.do_not_disturb);
        assert!(!ext.follow_me.enabled);
    }

    #[test]
    fn test_effective_ring_timeout() {
        let mut ext = Extension::new("101".into(), "Alice".into(), "alice".into());
        ext.ring_timeout_secs = 25;
        assert_eq!(ext.effective_ring_timeout(20), 20);
        assert_eq!(ext.effective_ring_timeout(30), 25);
    }

    #[test]
    fn test_follow_me_serde_roundtrip() {
        let config = FollowMeConfig {
            enabled: true,
            strategy: FollowMeStrategy::Simultaneous,
            legs: vec![FollowMeLeg {
                number: "0400111222".into(),
                delay_secs: 5,
                timeout_secs: 25,
                confirm: true,
            }],
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: FollowMeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.strategy, FollowMeStrategy::Simultaneous);
        assert_eq!(back.legs.len(), 1);
        assert!(back.legs[0].confirm);
    }
}
