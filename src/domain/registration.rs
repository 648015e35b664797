//! Registration - a time-limited binding of an extension to a contact URI

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport the binding was created over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingTransport {
    Udp,
    Tcp,
    Tls,
}

impl BindingTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingTransport::Udp => "udp",
            BindingTransport::Tcp => "tcp",
            BindingTransport::Tls => "tls",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "udp" => Some(BindingTransport::Udp),
            "tcp" => Some(BindingTransport::Tcp),
            "tls" => Some(BindingTransport::Tls),
            _ => None,
        }
    }
}

/// Mobile push platform for a registration created by a softphone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPlatform {
    Ios,
    Android,
}

/// Contact binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub id: i64,
    pub extension_id: i64,
    /// Contact URI from the REGISTER
    pub contact: String,
    /// Instance id distinguishing devices of the same extension
    pub device_id: Option<String>,
    /// Observed source address
    pub source_ip: String,
    pub source_port: u16,
    pub transport: BindingTransport,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub push_token: Option<String>,
    pub push_platform: Option<PushPlatform>,
    pub created_at: DateTime<Utc>,
}

impl Registration {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Repository for contact bindings. The in-memory registrar cache is the
/// routing authority; this is the durable mirror.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RegistrationRepository: Send + Sync {
    /// Insert or refresh the binding for (extension, contact).
    async fn upsert(&self, registration: &Registration) -> crate::Result<Registration>;

    /// Remove a specific contact binding.
    async fn delete(&self, extension_id: i64, contact: &str) -> crate::Result<()>;

    /// Remove every binding for the extension.
    async fn delete_all(&self, extension_id: i64) -> crate::Result<()>;

    /// Active (unexpired) bindings for an extension.
    async fn active_for_extension(&self, extension_id: i64) -> crate::Result<Vec<Registration>>;

    /// All bindings for an extension, oldest first.
    async fn all_for_extension(&self, extension_id: i64) -> crate::Result<Vec<Registration>>;

    /// Delete rows whose expiry precedes `cutoff`; returns removed count.
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> crate::Result<u64>;

    /// Bindings carrying a push token for the extension.
    async fn push_targets(&self, extension_id: i64) -> crate::Result<Vec<Registration>>;
}
