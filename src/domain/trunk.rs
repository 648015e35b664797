//! Trunk configuration and live status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trunk type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrunkType {
    /// We register to the provider and refresh on a timer
    Register,
    /// Authenticated by source IP; health-checked with OPTIONS
    Ip,
}

impl TrunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrunkType::Register => "register",
            TrunkType::Ip => "ip",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "register" => Some(TrunkType::Register),
            "ip" => Some(TrunkType::Ip),
            _ => None,
        }
    }
}

/// Trunk transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrunkTransport {
    Udp,
    Tcp,
    Tls,
}

impl TrunkTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrunkTransport::Udp => "udp",
            TrunkTransport::Tcp => "tcp",
            TrunkTransport::Tls => "tls",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "udp" => Some(TrunkTransport::Udp),
            "tcp" => Some(TrunkTransport::Tcp),
            "tls" => Some(TrunkTransport::Tls),
            _ => None,
        }
    }
}

/// Trunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trunk {
    pub id: i64,
    pub name: String,
    pub trunk_type: TrunkType,
    pub host: String,
    pub port: u16,
    pub transport: TrunkTransport,

    // Credentials (register type); password is encrypted at rest
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_username: Option<String>,

    /// Registration expiry hint (seconds)
    pub register_expiry_secs: u32,

    /// Remote hosts accepted as this trunk (ip type)
    pub allowed_hosts: Vec<String>,

    /// Preferred codecs in order, e.g. ["PCMU", "PCMA"]
    pub codecs: Vec<String>,

    /// Concurrent call cap, 0 = unlimited
    pub max_channels: u32,
    pub caller_id_name: Option<String>,
    pub caller_id_number: Option<String>,
    /// Prefix stripped from dialled numbers before sending
    pub strip_prefix: Option<String>,
    /// Prefix added after stripping
    pub add_prefix: Option<String>,
    pub priority: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trunk {
    pub fn new(name: String, trunk_type: TrunkType, host: String) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name,
            trunk_type,
            host,
            port: 5060,
            transport: TrunkTransport::Udp,
            username: None,
            password: None,
            auth_username: None,
            register_expiry_secs: 3600,
            allowed_hosts: Vec::new(),
            codecs: vec!["PCMU".to_string(), "PCMA".to_string()],
            max_channels: 0,
            caller_id_name: None,
            caller_id_number: None,
            strip_prefix: None,
            add_prefix: None,
            priority: 100,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a source host is accepted for inbound on an IP trunk.
    pub fn accepts_host(&self, host: &str) -> bool {
        match self.trunk_type {
            TrunkType::Register => host == self.host,
            TrunkType::Ip => self.allowed_hosts.iter().any(|h| h == host),
        }
    }

    /// Apply strip/add prefix rules to a dialled number.
    pub fn format_number(&self, number: &str) -> String {
        let mut formatted = number.to_string();
        if let Some(ref prefix) = self.strip_prefix {
            if let Some(rest) = formatted.strip_prefix(prefix.as_str()) {
                formatted = rest.to_string();
            }
        }
        if let Some(ref prefix) = self.add_prefix {
            formatted = format!("{}{}", prefix, formatted);
        }
        formatted
    }
}

/// Live state of a trunk's registration machine. RAM-only; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrunkState {
    Idle,
    Sending,
    Registered,
    Failed,
    Stopped,
}

impl TrunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrunkState::Idle => "idle",
            TrunkState::Sending => "sending",
            TrunkState::Registered => "registered",
            TrunkState::Failed => "failed",
            TrunkState::Stopped => "stopped",
        }
    }
}

/// Publishable trunk status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TrunkStatus {
    pub trunk_id: i64,
    pub name: String,
    pub trunk_type: TrunkType,
    pub state: TrunkState,
    pub last_error: Option<String>,
    pub retry_attempt: u32,
    pub failed_at: Option<DateTime<Utc>>,
    pub registered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_options_at: Option<DateTime<Utc>>,
    pub options_healthy: bool,
}

impl TrunkStatus {
    pub fn new(trunk: &Trunk) -> Self {
        Self {
            trunk_id: trunk.id,
            name: trunk.name.clone(),
            trunk_type: trunk.trunk_type,
            state: TrunkState::Idle,
            last_error: None,
            retry_attempt: 0,
            failed_at: None,
            registered_at: None,
            expires_at: None,
            last_options_at: None,
            options_healthy: false,
        }
    }
}

/// Repository for trunks
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait TrunkRepository: Send + Sync {
    async fn create(&self, trunk: &Trunk) -> crate::Result<Trunk>;

    async fn update(&self, trunk: &Trunk) -> crate::Result<()>;

    async fn delete(&self, id: i64) -> crate::Result<()>;

    async fn get(&self, id: i64) -> crate::Result<Option<Trunk>>;

    async fn list(&self, enabled_only: bool) -> crate::Result<Vec<Trunk>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        let mut trunk = Trunk::new("carrier".into(), TrunkType::Register, "sip.carrier.net".into());
        trunk.strip_prefix = Some("0".into());
        trunk.add_prefix = Some("+61".into());
        assert_eq!(trunk.format_number("0400111222"), "+61400111222");
        // no strip match - only add applies
        assert_eq!(trunk.format_number("1300555000"), "+611300555000");
    }

    #[test]
    fn test_accepts_host() {
        let mut trunk = Trunk::new("peer".into(), TrunkType::Ip, "203.0.113.1".into());
        trunk.allowed_hosts = vec!["203.0.113.1".into(), "203.0.113.2".into()];
        assert!(trunk.accepts_host("203.0.113.2"));
        assert!(!trunk.accepts_host("198.51.100.9"));

        let reg = Trunk::new("carrier".into(), TrunkType::Register, "sip.carrier.net".into());
        assert!(reg.accepts_host("sip.carrier.net"));
        assert!(!reg.accepts_host("other.example.com"));
    }

    #[test]
    fn test_trunk_state_strings() {
        assert_eq!(TrunkState::Registered.as_str(), "registered");
        assert_eq!(TrunkState::Stopped.as_str(), "stopped");
        assert_eq!(TrunkType::from_str("ip"), Some(TrunkType::Ip));
        assert_eq!(TrunkType::from_str("peer"), None);
    }
}
