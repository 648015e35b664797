//! External collaborator interfaces
//!
//! The core never talks to SMTP, push gateways, or a secret store directly;
//! it goes through these traits. Each has a no-op default so the process
//! runs without the collaborator configured.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::Result;

/// Field-level encryptor used for trunk passwords in flight from the store.
pub trait FieldEncryptor: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Pass-through used when no encryptor is configured. Warns once.
pub struct PassthroughEncryptor {
    warned: AtomicBool,
}

impl PassthroughEncryptor {
    pub fn new() -> Self {
        Self {
            warned: AtomicBool::new(false),
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("no field encryptor configured; trunk passwords pass through unencrypted");
        }
    }
}

impl Default for PassthroughEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldEncryptor for PassthroughEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        self.warn_once();
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        self.warn_once();
        Ok(ciphertext.to_string())
    }
}

/// Fire-and-forget voicemail notification mail. Failures are logged by the
/// caller, never retried.
#[async_trait::async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_voicemail_notification(
        &self,
        to: &str,
        caller_id: &str,
        duration_secs: u32,
        wav_path: &Path,
    ) -> Result<()>;
}

/// No-op mail sender.
pub struct NullEmailSender;

#[async_trait::async_trait]
impl EmailSender for NullEmailSender {
    async fn send_voicemail_notification(
        &self,
        _to: &str,
        _caller_id: &str,
        _duration_secs: u32,
        _wav_path: &Path,
    ) -> Result<()> {
        Ok(())
    }
}

/// Wakes a mobile app so it can re-REGISTER before we ring it.
#[async_trait::async_trait]
pub trait PushClient: Send + Sync {
    async fn wake(&self, token: &str, platform: &str, caller_id: &str) -> Result<()>;
}

/// No-op push client.
pub struct NullPushClient;

#[async_trait::async_trait]
impl PushClient for NullPushClient {
    async fn wake(&self, _token: &str, _platform: &str, _caller_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_roundtrip() {
        let enc = PassthroughEncryptor::new();
        let out = enc.encrypt("secret").unwrap();
        assert_eq!(enc.decrypt(&out).unwrap(), "secret");
    }
}
