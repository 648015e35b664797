//! IVR menu - an audio menu collecting a single DTMF choice

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// IVR menu
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvrMenu {
    pub id: i64,
    pub name: String,
    /// Greeting prompt played before collecting input
    pub greeting_prompt_id: Option<i64>,
    /// Seconds to wait for the first digit
    pub input_timeout_secs: u32,
    /// Seconds allowed between digits
    pub inter_digit_timeout_secs: u32,
    /// Replays of the greeting before following the timeout edge
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IvrMenu {
    /// Digits a menu can route on.
    pub const VALID_CHOICES: [&'static str; 12] =
        ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "*", "#"];

    pub fn is_valid_choice(digit: &str) -> bool {
        Self::VALID_CHOICES.contains(&digit)
    }
}

/// Repository for IVR menus
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait IvrMenuRepository: Send + Sync {
    async fn create(&self, menu: &IvrMenu) -> crate::Result<IvrMenu>;

    async fn update(&self, menu: &IvrMenu) -> crate::Result<()>;

    async fn delete(&self, id: i64) -> crate::Result<()>;

    async fn get(&self, id: i64) -> crate::Result<Option<IvrMenu>>;

    async fn list(&self) -> crate::Result<Vec<IvrMenu>>;
}
