//! Audio prompt entity - a playable WAV referenced by flow nodes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a prompt's file lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    /// Bundled with the binary, extracted under prompts/system/
    System,
    /// Uploaded by the operator, under prompts/custom/
    Custom,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::System => "system",
            PromptKind::Custom => "custom",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "system" => Some(PromptKind::System),
            "custom" => Some(PromptKind::Custom),
            _ => None,
        }
    }
}

/// Audio prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPrompt {
    pub id: i64,
    pub name: String,
    pub kind: PromptKind,
    /// File name relative to the kind subtree
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for prompts
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AudioPromptRepository: Send + Sync {
    async fn create(&self, prompt: &AudioPrompt) -> crate::Result<AudioPrompt>;

    async fn delete(&self, id: i64) -> crate::Result<()>;

    async fn get(&self, id: i64) -> crate::Result<Option<AudioPrompt>>;

    async fn get_by_name(&self, name: &str) -> crate::Result<Option<AudioPrompt>>;

    async fn list(&self) -> crate::Result<Vec<AudioPrompt>>;
}
