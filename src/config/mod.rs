//! Configuration management

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub media: MediaConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub udp_bind: SocketAddr,
    pub tcp_bind: SocketAddr,
    pub enable_tcp: bool,
    /// Enable TLS transport (SIPS)
    pub enable_tls: bool,
    pub tls_bind: SocketAddr,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    /// Digest realm presented in challenges
    pub realm: String,
    /// Cap on registration expiry granted to endpoints (seconds)
    pub max_register_expires: u32,
    /// Parse failures per minute before a warn is logged
    pub parse_failure_warn_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Advertised address for SDP connection lines
    pub public_ip: String,
    /// First RTP port (even)
    pub rtp_port_min: u16,
    /// Last RTP port (odd, inclusive)
    pub rtp_port_max: u16,
    /// Seconds without inbound packets before a session is torn down
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub recordings_dir: PathBuf,
    pub voicemail_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub greetings_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sip: SipConfig::default(),
            media: MediaConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            udp_bind: "0.0.0.0:5060".parse().unwrap(),
            tcp_bind: "0.0.0.0:5060".parse().unwrap(),
            enable_tcp: true,
            enable_tls: false,
            tls_bind: "0.0.0.0:5061".parse().unwrap(),
            tls_cert_path: "certs/server.crt".to_string(),
            tls_key_path: "certs/server.key".to_string(),
            realm: "skylark".to_string(),
            max_register_expires: 3600,
            parse_failure_warn_threshold: 60,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            public_ip: "127.0.0.1".to_string(),
            rtp_port_min: 10000,
            rtp_port_max: 10999,
            idle_timeout_secs: 30,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://skylark.db".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("recordings"),
            voicemail_dir: PathBuf::from("voicemail"),
            prompts_dir: PathBuf::from("prompts"),
            greetings_dir: PathBuf::from("greetings"),
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when absent.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.media.rtp_port_min % 2 != 0 {
            anyhow::bail!("rtp_port_min must be even");
        }
        if self.media.rtp_port_max <= self.media.rtp_port_min {
            anyhow::bail!("rtp_port_max must be greater than rtp_port_min");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sip.udp_bind.port(), 5060);
        assert_eq!(config.media.rtp_port_min, 10000);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let raw = r#"
            [sip]
            realm = "pbx.example.com"

            [media]
            rtp_port_min = 20000
            rtp_port_max = 20100
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.sip.realm, "pbx.example.com");
        assert_eq!(config.media.rtp_port_min, 20000);
        // untouched sections keep defaults
        assert_eq!(config.database.url, "sqlite://skylark.db");
    }

    #[test]
    fn test_validate_rejects_odd_port_base() {
        let mut config = Config::default();
        config.media.rtp_port_min = 10001;
        assert!(config.validate().is_err());
    }
}
