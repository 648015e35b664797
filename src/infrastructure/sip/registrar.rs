//! Registrar - authenticates REGISTER and maintains contact bindings
//!
//! The in-memory cache is the routing authority; the store is the durable
//! mirror, written on every mutation. Expired rows never route calls.

use chrono::{Duration as ChronoDuration, Utc};
use rsip::Header;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::auth::{DigestCredentials, DigestVerifier};
use super::builder::ResponseBuilder;
use super::message::{uri_user, SipError, SipRequest, SipResponse};
use super::server::SipHandler;
use super::transport::TransportProtocol;
use crate::domain::extension::ExtensionRepository;
use crate::domain::registration::{
    BindingTransport, PushPlatform, Registration, RegistrationRepository,
};

const DEFAULT_EXPIRES: u32 = 3600;
const MIN_EXPIRES: u32 = 60;

pub struct Registrar {
    verifier: Arc<DigestVerifier>,
    extensions: Arc<dyn ExtensionRepository>,
    registrations: Arc<dyn RegistrationRepository>,
    /// Registration cap granted to endpoints
    max_expires: u32,
    /// extension id -> active bindings
    cache: RwLock<HashMap<i64, Vec<Registration>>>,
    /// Fires the extension id whenever a fresh binding lands (push wake).
    changed_tx: broadcast::Sender<i64>,
}

impl Registrar {
    pub fn new(
        verifier: Arc<DigestVerifier>,
        extensions: Arc<dyn ExtensionRepository>,
        registrations: Arc<dyn RegistrationRepository>,
        max_expires: u32,
    ) -> Self {
        let (changed_tx, _) = broadcast::channel(64);
        Self {
            verifier,
            extensions,
            registrations,
            max_expires,
            cache: RwLock::new(HashMap::new()),
            changed_tx,
        }
    }

    /// Active contacts for call routing. Only unexpired bindings.
    pub async fn active_contacts(&self, extension_id: i64) -> Vec<Registration> {
        let cache = self.cache.read().await;
        cache
            .get(&extension_id)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| !b.is_expired())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn registration_count(&self) -> usize {
        let cache = self.cache.read().await;
        cache.values().map(|b| b.len()).sum()
    }

    /// Wait up to `timeout` for a new binding on the extension. Used after
    /// a push wake before falling through to follow-me/voicemail.
    pub async fn wait_for_registration(
        &self,
        extension_id: i64,
        timeout: std::time::Duration,
    ) -> bool {
        let mut rx = self.changed_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(id)) if id == extension_id => return true,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return false,
                Err(_) => return false,
            }
        }
    }

    /// Periodic expiry sweep: purge the store and the cache.
    pub fn spawn_expiry_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registrar = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                match registrar.registrations.delete_expired(Utc::now()).await {
                    Ok(removed) if removed > 0 => {
                        debug!(removed, "purged expired registrations");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("registration sweep failed: {}", e),
                }
                let mut cache = registrar.cache.write().await;
                for bindings in cache.values_mut() {
                    bindings.retain(|b| !b.is_expired());
                }
                cache.retain(|_, bindings| !bindings.is_empty());
            }
        })
    }

    fn effective_expires(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(0) => 0,
            Some(requested) => requested.clamp(MIN_EXPIRES, self.max_expires.min(DEFAULT_EXPIRES)),
            None => DEFAULT_EXPIRES.min(self.max_expires),
        }
    }

    fn challenge_response(&self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut builder = ResponseBuilder::unauthorized();
        for challenge in self.verifier.challenges() {
            builder = builder.header(Header::WwwAuthenticate(challenge.into()));
        }
        builder.build_for_request(request)
    }

    async fn refresh_cache(&self, extension_id: i64) -> crate::Result<()> {
        let bindings = self
            .registrations
            .active_for_extension(extension_id)
            .await?;
        let mut cache = self.cache.write().await;
        if bindings.is_empty() {
            cache.remove(&extension_id);
        } else {
            cache.insert(extension_id, bindings);
        }
        Ok(())
    }

    async fn apply_binding(
        &self,
        extension_id: i64,
        max_registrations: u32,
        request: &SipRequest,
        contact: &str,
        expires: u32,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> crate::Result<()> {
        if expires == 0 {
            if contact == "*" {
                self.registrations.delete_all(extension_id).await?;
                info!(extension_id, "unregistered all bindings");
            } else {
                self.registrations.delete(extension_id, contact).await?;
                info!(extension_id, contact, "unregistered binding");
            }
            self.refresh_cache(extension_id).await?;
            return Ok(());
        }

        let transport = match protocol {
            TransportProtocol::Udp => BindingTransport::Udp,
            TransportProtocol::Tcp => BindingTransport::Tcp,
            TransportProtocol::Tls => BindingTransport::Tls,
        };
        let contact_value = request
            .headers()
            .iter()
            .find(|h| matches!(h, Header::Contact(_)))
            .map(super::message::header_value)
            .unwrap_or_default();

        let registration = Registration {
            id: 0,
            extension_id,
            contact: contact.to_string(),
            device_id: param_of(&contact_value, "+sip.instance")
                .or_else(|| param_of(&contact_value, "reg-id")),
            source_ip: source.ip().to_string(),
            source_port: source.port(),
            transport,
            user_agent: request.user_agent(),
            expires_at: Utc::now() + ChronoDuration::seconds(expires as i64),
            push_token: param_of(&contact_value, "pn-token"),
            push_platform: param_of(&contact_value, "pn-platform").and_then(|p| {
                match p.to_ascii_lowercase().as_str() {
                    "ios" => Some(PushPlatform::Ios),
                    "android" => Some(PushPlatform::Android),
                    _ => None,
                }
            }),
            created_at: Utc::now(),
        };
        self.registrations.upsert(&registration).await?;

        // enforce the per-extension binding cap, dropping the oldest
        if max_registrations > 0 {
            let all = self.registrations.all_for_extension(extension_id).await?;
            let active: Vec<_> = all.into_iter().filter(|b| !b.is_expired()).collect();
            if active.len() as u32 > max_registrations {
                let excess = active.len() as u32 - max_registrations;
                for evicted in active.iter().take(excess as usize) {
                    warn!(
                        extension_id,
                        contact = %evicted.contact,
                        "evicting oldest binding over max_registrations"
                    );
                    self.registrations
                        .delete(extension_id, &evicted.contact)
                        .await?;
                }
            }
        }

        self.refresh_cache(extension_id).await?;
        let _ = self.changed_tx.send(extension_id);
        info!(extension_id, contact, expires, "registered binding");
        metrics::counter!("pbx_register_accepted_total").increment(1);
        Ok(())
    }
}

/// `;name=value` parameter from a raw Contact header value.
fn param_of(value: &str, name: &str) -> Option<String> {
    for part in value.split(';').skip(1) {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix(name) {
            if let Some(v) = rest.strip_prefix('=') {
                return Some(v.trim_matches('"').to_string());
            }
        }
    }
    None
}

#[async_trait::async_trait]
impl SipHandler for Registrar {
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<Option<SipResponse>, SipError> {
        if self.verifier.is_blocked(source.ip()) {
            warn!(%source, "REGISTER from rate-limited source rejected");
            return Ok(Some(
                ResponseBuilder::new(403).build_for_request(&request)?,
            ));
        }

        let aor = request
            .to_uri()
            .ok_or_else(|| SipError::InvalidMessage("REGISTER without To".into()))?;
        let username = match uri_user(&aor) {
            Some(username) => username,
            None => {
                return Ok(Some(
                    ResponseBuilder::not_found().build_for_request(&request)?,
                ))
            }
        };

        let extension = self
            .extensions
            .get_by_sip_username(&username)
            .await
            .map_err(|e| SipError::Internal(e.to_string()))?;
        let extension = match extension {
            Some(extension) => extension,
            None => {
                debug!(username, "REGISTER for unknown user");
                return Ok(Some(
                    ResponseBuilder::not_found().build_for_request(&request)?,
                ));
            }
        };

        let authorization = match request.authorization() {
            Some(authorization) => authorization,
            None => {
                debug!(username, "REGISTER without credentials, challenging");
                return Ok(Some(self.challenge_response(&request)?));
            }
        };

        let credentials = DigestCredentials::parse(&authorization)?;
        if credentials.username != extension.sip_username {
            self.verifier.record_failure(source.ip());
            return Ok(Some(self.challenge_response(&request)?));
        }
        if let Err(e) = self.verifier.verify(
            &credentials,
            "REGISTER",
            &extension.ha1_md5,
            &extension.ha1_sha256,
        ) {
            warn!(username, "REGISTER authentication failed: {}", e);
            self.verifier.record_failure(source.ip());
            return Ok(Some(self.challenge_response(&request)?));
        }

        let expires = self.effective_expires(request.expires());
        let contact = request.contact_uri();

        if let Some(contact) = contact.as_deref() {
            self.apply_binding(
                extension.id,
                extension.max_registrations,
                &request,
                contact,
                expires,
                source,
                protocol,
            )
            .await
            .map_err(|e| SipError::Internal(e.to_string()))?;
        }

        let mut builder = ResponseBuilder::ok().header(Header::Expires(expires.to_string().into()));
        if expires > 0 {
            if let Some(contact) = contact.as_deref() {
                builder = builder.header(Header::Contact(
                    format!("<{}>;expires={}", contact, expires).into(),
                ));
            }
        }
        Ok(Some(builder.build_for_request(&request)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::extension::{Extension, MockExtensionRepository};
    use crate::domain::password::{ha1_md5, ha1_sha256};
    use crate::domain::registration::MockRegistrationRepository;
    use crate::infrastructure::sip::auth::{compute_response, DigestAlgorithm};

    fn extension() -> Extension {
        let mut ext = Extension::new("101".into(), "Alice".into(), "alice".into());
        ext.id = 101;
        ext.ha1_md5 = ha1_md5("alice", "skylark", "secret");
        ext.ha1_sha256 = ha1_sha256("alice", "skylark", "secret");
        ext
    }

    fn register_request(authorization: Option<&str>, expires: u32) -> SipRequest {
        let auth_line = authorization
            .map(|a| format!("Authorization: {}\r\n", a))
            .unwrap_or_default();
        let raw = format!(
            "REGISTER sip:skylark SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKreg\r\n\
             From: <sip:alice@skylark>;tag=ft\r\n\
             To: <sip:alice@skylark>\r\n\
             Call-ID: reg1\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: <sip:alice@10.0.0.2:5060>\r\n\
             Expires: {}\r\n\
             {}Content-Length: 0\r\n\r\n",
            expires, auth_line
        );
        SipRequest::parse(raw.as_bytes()).unwrap()
    }

    fn source() -> SocketAddr {
        "10.0.0.2:5060".parse().unwrap()
    }

    fn registrar_with(
        extensions: MockExtensionRepository,
        registrations: MockRegistrationRepository,
    ) -> Registrar {
        Registrar::new(
            Arc::new(DigestVerifier::new("skylark")),
            Arc::new(extensions),
            Arc::new(registrations),
            7200,
        )
    }

    #[tokio::test]
    async fn test_first_register_is_challenged() {
        let mut extensions = MockExtensionRepository::new();
        extensions
            .expect_get_by_sip_username()
            .returning(|_| Ok(Some(extension())));
        let registrar = registrar_with(extensions, MockRegistrationRepository::new());

        let response = registrar
            .handle_request(register_request(None, 3600), source(), TransportProtocol::Udp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), 401);
        assert!(response.auth_challenge().is_some());
    }

    #[tokio::test]
    async fn test_authenticated_register_binds() {
        let mut extensions = MockExtensionRepository::new();
        extensions
            .expect_get_by_sip_username()
            .returning(|_| Ok(Some(extension())));

        let mut registrations = MockRegistrationRepository::new();
        registrations
            .expect_upsert()
            .withf(|r| r.extension_id == 101 && r.contact == "sip:alice@10.0.0.2:5060")
            .returning(|r| Ok(r.clone()));
        registrations
            .expect_all_for_extension()
            .returning(|_| Ok(vec![]));
        registrations
            .expect_active_for_extension()
            .returning(|_| Ok(vec![]));

        let registrar = registrar_with(extensions, registrations);

        // obtain a nonce via a challenge first
        let challenge = registrar
            .handle_request(register_request(None, 3600), source(), TransportProtocol::Udp)
            .await
            .unwrap()
            .unwrap();
        let challenge_value = challenge.auth_challenge().unwrap();
        let params = super::super::auth::parse_digest_params(&challenge_value);
        let nonce = params.get("nonce").unwrap();

        let ha1 = ha1_md5("alice", "skylark", "secret");
        let response_hash = compute_response(
            DigestAlgorithm::Md5,
            &ha1,
            nonce,
            "REGISTER",
            "sip:skylark",
            None,
            None,
            None,
        );
        let authorization = format!(
            r#"Digest username="alice", realm="skylark", nonce="{}", uri="sip:skylark", response="{}", algorithm=MD5"#,
            nonce, response_hash
        );

        let response = registrar
            .handle_request(
                register_request(Some(&authorization), 3600),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.expires(), Some(3600));
    }

    #[tokio::test]
    async fn test_bad_credentials_rechallenged() {
        let mut extensions = MockExtensionRepository::new();
        extensions
            .expect_get_by_sip_username()
            .returning(|_| Ok(Some(extension())));
        let registrar = registrar_with(extensions, MockRegistrationRepository::new());

        let authorization = r#"Digest username="alice", realm="skylark", nonce="bogus", uri="sip:skylark", response="bad", algorithm=MD5"#;
        let response = registrar
            .handle_request(
                register_request(Some(authorization), 3600),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), 401);
    }

    #[tokio::test]
    async fn test_unknown_user_is_404() {
        let mut extensions = MockExtensionRepository::new();
        extensions
            .expect_get_by_sip_username()
            .returning(|_| Ok(None));
        let registrar = registrar_with(extensions, MockRegistrationRepository::new());

        let response = registrar
            .handle_request(register_request(None, 3600), source(), TransportProtocol::Udp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status_code(), 404);
    }

    #[tokio::test]
    async fn test_expires_clamped_to_cap() {
        let registrar = registrar_with(
            MockExtensionRepository::new(),
            MockRegistrationRepository::new(),
        );
        assert_eq!(registrar.effective_expires(Some(0)), 0);
        assert_eq!(registrar.effective_expires(Some(30)), MIN_EXPIRES);
        assert_eq!(registrar.effective_expires(Some(999999)), DEFAULT_EXPIRES);
        assert_eq!(registrar.effective_expires(None), DEFAULT_EXPIRES);
        assert_eq!(registrar.effective_expires(Some(1800)), 1800);
    }

    #[test]
    fn test_contact_param_extraction() {
        let value = r#"<sip:alice@10.0.0.2>;pn-token=tok123;pn-platform=ios;+sip.instance="<urn:uuid:1>""#;
        assert_eq!(param_of(value, "pn-token").as_deref(), Some("tok123"));
        assert_eq!(param_of(value, "pn-platform").as_deref(), Some("ios"));
        assert_eq!(
            param_of(value, "+sip.instance").as_deref(),
            Some("<urn:uuid:1>")
        );
        assert_eq!(param_of(value, "missing"), None);
    }
}
