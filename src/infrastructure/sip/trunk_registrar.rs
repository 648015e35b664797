//! Trunk registrar - outbound REGISTER state machines and OPTIONS health
//!
//! One task per enabled trunk. REGISTER trunks walk
//! IDLE -> SENDING -> REGISTERED -> (refresh) -> SENDING, falling to FAILED
//! with exponential backoff on errors; STOPPED is terminal when the
//! operator disables the trunk. IP trunks only run a 60 s OPTIONS ping.
//! Status lives in RAM only.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rsip::Header;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::auth::answer_challenge;
use super::builder::{generate_branch, generate_call_id, generate_tag, RequestBuilder};
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::server::{SipSender, TransactionRegistry};
use super::transport::TransportProtocol;
use crate::domain::collaborators::FieldEncryptor;
use crate::domain::trunk::{Trunk, TrunkRepository, TrunkState, TrunkStatus, TrunkTransport, TrunkType};
use crate::{DomainError, Result};

/// Refresh at three quarters of the granted expiry.
const REFRESH_FACTOR: f64 = 0.75;

/// Backoff schedule bounds
const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_MAX: Duration = Duration::from_secs(30 * 60);

/// OPTIONS ping interval for IP trunks
const OPTIONS_INTERVAL: Duration = Duration::from_secs(60);

/// Wait on any single transaction
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt.min(16)))
        .unwrap_or(BACKOFF_MAX)
        .min(BACKOFF_MAX);
    let jitter_max = exp.as_millis() as u64 / 5;
    let jitter = if jitter_max > 0 {
        rand::thread_rng().gen_range(0..=jitter_max)
    } else {
        0
    };
    exp + Duration::from_millis(jitter)
}

fn trunk_transport(transport: TrunkTransport) -> TransportProtocol {
    match transport {
        TrunkTransport::Udp => TransportProtocol::Udp,
        TrunkTransport::Tcp => TransportProtocol::Tcp,
        TrunkTransport::Tls => TransportProtocol::Tls,
    }
}

struct TrunkTask {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct TrunkRegistrar {
    sender: SipSender,
    transactions: Arc<TransactionRegistry>,
    trunks: Arc<dyn TrunkRepository>,
    encryptor: Arc<dyn FieldEncryptor>,
    /// Advertised address for Via and Contact, "ip:port"
    local_addr: String,
    statuses: Arc<RwLock<HashMap<i64, TrunkStatus>>>,
    running: Mutex<HashMap<i64, TrunkTask>>,
}

impl TrunkRegistrar {
    pub fn new(
        sender: SipSender,
        transactions: Arc<TransactionRegistry>,
        trunks: Arc<dyn TrunkRepository>,
        encryptor: Arc<dyn FieldEncryptor>,
        local_addr: String,
    ) -> Self {
        Self {
            sender,
            transactions,
            trunks,
            encryptor,
            local_addr,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(HashMap::new()),
        }
    }

    // --- status queries (collaborator surface) ---

    pub async fn status(&self, trunk_id: i64) -> Option<TrunkStatus> {
        self.statuses.read().await.get(&trunk_id).cloned()
    }

    pub async fn all_statuses(&self) -> Vec<TrunkStatus> {
        let mut statuses: Vec<TrunkStatus> =
            self.statuses.read().await.values().cloned().collect();
        statuses.sort_by_key(|s| s.trunk_id);
        statuses
    }

    async fn update_status<F: FnOnce(&mut TrunkStatus)>(&self, trunk: &Trunk, apply: F) {
        let mut statuses = self.statuses.write().await;
        let status = statuses
            .entry(trunk.id)
            .or_insert_with(|| TrunkStatus::new(trunk));
        apply(status);
    }

    // --- lifecycle ---

    /// Load every enabled trunk and start its task.
    pub async fn start_all(self: &Arc<Self>) -> Result<()> {
        let trunks = self.trunks.list(true).await?;
        info!(count = trunks.len(), "starting trunk state machines");
        for trunk in trunks {
            self.start_trunk(trunk).await;
        }
        Ok(())
    }

    /// Start (or restart) the task for one trunk record.
    pub async fn start_trunk(self: &Arc<Self>, trunk: Trunk) {
        self.stop_trunk(trunk.id).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.update_status(&trunk, |s| {
            *s = TrunkStatus::new(&trunk);
        })
        .await;

        let registrar = self.clone();
        let trunk_id = trunk.id;
        let handle = tokio::spawn(async move {
            match trunk.trunk_type {
                TrunkType::Register => registrar.register_loop(trunk, shutdown_rx).await,
                TrunkType::Ip => registrar.options_loop(trunk, shutdown_rx).await,
            }
        });

        self.running.lock().await.insert(
            trunk_id,
            TrunkTask {
                shutdown: shutdown_tx,
                handle,
            },
        );
    }

    /// Stop one trunk's task; its status becomes STOPPED.
    pub async fn stop_trunk(&self, trunk_id: i64) {
        let task = self.running.lock().await.remove(&trunk_id);
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            let _ = task.handle.await;
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(&trunk_id) {
                status.state = TrunkState::Stopped;
            }
            info!(trunk_id, "trunk stopped");
        }
    }

    /// Hot reload: stop everything, re-read enabled trunks, start again.
    /// After this the set of running trunks equals the set of enabled ones.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        info!("reloading trunk configuration");
        let ids: Vec<i64> = self.running.lock().await.keys().copied().collect();
        for id in ids {
            self.stop_trunk(id).await;
        }
        self.statuses.write().await.clear();
        self.start_all().await
    }

    pub async fn shutdown(&self) {
        let ids: Vec<i64> = self.running.lock().await.keys().copied().collect();
        for id in ids {
            self.stop_trunk(id).await;
        }
    }

    // --- the REGISTER machine ---

    async fn register_loop(self: Arc<Self>, trunk: Trunk, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.update_status(&trunk, |s| s.state = TrunkState::Sending).await;

            let outcome = tokio::select! {
                outcome = self.send_register(&trunk, trunk.register_expiry_secs) => outcome,
                _ = shutdown.changed() => break,
            };

            match outcome {
                Ok(granted) => {
                    attempt = 0;
                    let expires_at = Utc::now() + ChronoDuration::seconds(granted as i64);
                    self.update_status(&trunk, |s| {
                        s.state = TrunkState::Registered;
                        s.registered_at = Some(Utc::now());
                        s.expires_at = Some(expires_at);
                        s.last_error = None;
                        s.retry_attempt = 0;
                    })
                    .await;
                    let refresh =
                        Duration::from_secs_f64(granted as f64 * REFRESH_FACTOR);
                    info!(trunk = %trunk.name, granted, refresh_secs = refresh.as_secs(), "trunk registered");
                    metrics::counter!("pbx_trunk_register_ok_total").increment(1);
                    tokio::select! {
                        _ = tokio::time::sleep(refresh) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(trunk = %trunk.name, attempt, delay_secs = delay.as_secs(), "trunk registration failed: {}", e);
                    metrics::counter!("pbx_trunk_register_failed_total").increment(1);
                    self.update_status(&trunk, |s| {
                        s.state = TrunkState::Failed;
                        s.failed_at = Some(Utc::now());
                        s.last_error = Some(e.to_string());
                        s.retry_attempt = attempt;
                    })
                    .await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        debug!(trunk = %trunk.name, "register loop ended");
    }

    async fn resolve(&self, trunk: &Trunk) -> Result<SocketAddr> {
        tokio::net::lookup_host((trunk.host.as_str(), trunk.port))
            .await
            .map_err(|e| DomainError::Transient(format!("resolve {}: {}", trunk.host, e)))?
            .next()
            .ok_or_else(|| DomainError::Transient(format!("no address for {}", trunk.host)))
    }

    fn register_request(
        &self,
        trunk: &Trunk,
        expires: u32,
        call_id: &str,
        cseq: u32,
        authorization: Option<&str>,
    ) -> Result<SipRequest> {
        let username = trunk.username.as_deref().unwrap_or_default();
        let aor = format!("sip:{}@{}", username, trunk.host);
        let mut builder = RequestBuilder::new(SipMethod::Register, &format!("sip:{}", trunk.host))
            .via(
                &self.local_addr,
                trunk.transport.as_str().to_uppercase().as_str(),
                &generate_branch(),
            )
            .from(None, &aor, &generate_tag())
            .to(&aor, None)
            .call_id(call_id)
            .cseq(cseq, SipMethod::Register)
            .contact(&format!("sip:{}@{}", username, self.local_addr))
            .expires(expires)
            .max_forwards(70);
        if let Some(authorization) = authorization {
            builder = builder.header(Header::Authorization(authorization.into()));
        }
        builder.build().map_err(|e| e.into())
    }

    async fn exchange(
        &self,
        request: &SipRequest,
        destination: SocketAddr,
        transport: TransportProtocol,
    ) -> Result<SipResponse> {
        let branch = request
            .via_branch()
            .ok_or_else(|| DomainError::Internal("request without branch".into()))?;
        let mut rx = self.transactions.register(&branch).await;
        let send_result = self.sender.send_request(request, destination, transport).await;
        if let Err(e) = send_result {
            self.transactions.deregister(&branch).await;
            return Err(DomainError::Transient(e.to_string()));
        }

        let response = loop {
            match tokio::time::timeout(TRANSACTION_TIMEOUT, rx.recv()).await {
                Ok(Some(response)) if response.status_code() >= 200 => break response,
                Ok(Some(_provisional)) => continue,
                Ok(None) => {
                    self.transactions.deregister(&branch).await;
                    return Err(DomainError::Transient("transaction channel closed".into()));
                }
                Err(_) => {
                    self.transactions.deregister(&branch).await;
                    return Err(DomainError::Timeout("no final response".into()));
                }
            }
        };
        self.transactions.deregister(&branch).await;
        Ok(response)
    }

    /// One REGISTER cycle; answers a 401/407 challenge once. Returns the
    /// granted expiry in seconds.
    async fn send_register(&self, trunk: &Trunk, expires: u32) -> Result<u32> {
        let destination = self.resolve(trunk).await?;
        let transport = trunk_transport(trunk.transport);
        let call_id = generate_call_id(&self.local_addr);

        let request = self.register_request(trunk, expires, &call_id, 1, None)?;
        let response = self.exchange(&request, destination, transport).await?;

        let response = match response.status_code() {
            401 | 407 => {
                let challenge = response.auth_challenge().ok_or_else(|| {
                    DomainError::Protocol("challenge response without challenge".into())
                })?;
                let username = trunk
                    .username
                    .as_deref()
                    .ok_or_else(|| DomainError::AuthFailed("trunk has no username".into()))?;
                let password = match trunk.password.as_deref() {
                    Some(stored) => self.encryptor.decrypt(stored)?,
                    None => return Err(DomainError::AuthFailed("trunk has no password".into())),
                };
                let auth_user = trunk.auth_username.as_deref().unwrap_or(username);
                let authorization = answer_challenge(
                    &challenge,
                    "REGISTER",
                    &format!("sip:{}", trunk.host),
                    auth_user,
                    &password,
                )
                .map_err(|e| DomainError::AuthFailed(e.to_string()))?;
                let retry =
                    self.register_request(trunk, expires, &call_id, 2, Some(&authorization))?;
                self.exchange(&retry, destination, transport).await?
            }
            _ => response,
        };

        match response.status_code() {
            code if (200..300).contains(&code) => {
                Ok(response.expires().unwrap_or(expires).min(expires.max(60)))
            }
            401 | 407 => Err(DomainError::AuthFailed("credentials rejected".into())),
            code => Err(DomainError::Transient(format!(
                "REGISTER rejected with {}",
                code
            ))),
        }
    }

    // --- the OPTIONS health machine ---

    async fn options_loop(self: Arc<Self>, trunk: Trunk, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_failures: u32 = 0;
        self.update_status(&trunk, |s| s.state = TrunkState::Registered).await;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let probe = tokio::select! {
                probe = self.send_options(&trunk) => probe,
                _ = shutdown.changed() => break,
            };
            match probe {
                Ok(code) if (200..300).contains(&code) => {
                    consecutive_failures = 0;
                    self.update_status(&trunk, |s| {
                        s.options_healthy = true;
                        s.last_options_at = Some(Utc::now());
                        s.last_error = None;
                    })
                    .await;
                }
                outcome => {
                    consecutive_failures += 1;
                    let error = match outcome {
                        Ok(code) => format!("OPTIONS answered {}", code),
                        Err(e) => e.to_string(),
                    };
                    debug!(trunk = %trunk.name, consecutive_failures, "OPTIONS probe failed: {}", error);
                    let unhealthy = consecutive_failures >= 3;
                    self.update_status(&trunk, |s| {
                        s.last_options_at = Some(Utc::now());
                        s.last_error = Some(error.clone());
                        if unhealthy {
                            s.options_healthy = false;
                        }
                    })
                    .await;
                    if unhealthy {
                        metrics::counter!("pbx_trunk_options_unhealthy_total").increment(1);
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(OPTIONS_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(trunk = %trunk.name, "options loop ended");
    }

    async fn send_options(&self, trunk: &Trunk) -> Result<u16> {
        let destination = self.resolve(trunk).await?;
        let transport = trunk_transport(trunk.transport);
        let request = RequestBuilder::new(SipMethod::Options, &format!("sip:{}", trunk.host))
            .via(
                &self.local_addr,
                trunk.transport.as_str().to_uppercase().as_str(),
                &generate_branch(),
            )
            .from(None, &format!("sip:pbx@{}", self.local_addr), &generate_tag())
            .to(&format!("sip:{}", trunk.host), None)
            .call_id(&generate_call_id(&self.local_addr))
            .cseq(1, SipMethod::Options)
            .max_forwards(70)
            .build()
            .map_err(SipError::from)?;
        let response = self.exchange(&request, destination, transport).await?;
        Ok(response.status_code())
    }

    // --- single-shot probes (the admin "test" surface) ---

    /// Fire one REGISTER cycle against an arbitrary trunk record.
    pub async fn test_register(&self, trunk: &Trunk) -> Result<u32> {
        self.send_register(trunk, trunk.register_expiry_secs).await
    }

    /// Fire one OPTIONS probe against an arbitrary trunk record.
    pub async fn test_options(&self, trunk: &Trunk) -> Result<u16> {
        self.send_options(trunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::collaborators::PassthroughEncryptor;
    use crate::domain::trunk::MockTrunkRepository;
    use tokio::net::UdpSocket;

    #[test]
    fn test_backoff_schedule() {
        // attempt 1: 60s base, attempt 2: 120s, capped at 30 min
        let d1 = backoff_delay(1);
        assert!(d1 >= Duration::from_secs(60) && d1 <= Duration::from_secs(72));
        let d2 = backoff_delay(2);
        assert!(d2 >= Duration::from_secs(120) && d2 <= Duration::from_secs(144));
        let large = backoff_delay(30);
        assert!(large >= BACKOFF_MAX && large <= BACKOFF_MAX + BACKOFF_MAX / 5);
    }

    /// A tiny scripted SIP peer: answers REGISTER with 401 then 200.
    async fn scripted_provider(expires: u32) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let mut challenged = false;
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let request = match SipRequest::parse(&buf[..len]) {
                    Ok(request) => request,
                    Err(_) => continue,
                };
                let response = if !challenged {
                    challenged = true;
                    super::super::builder::ResponseBuilder::unauthorized()
                        .header(Header::WwwAuthenticate(
                            r#"Digest realm="carrier", nonce="abc123", algorithm=MD5, qop="auth""#
                                .into(),
                        ))
                        .build_for_request(&request)
                        .unwrap()
                } else {
                    // the retry must carry credentials
                    assert!(request.authorization().is_some());
                    super::super::builder::ResponseBuilder::ok()
                        .header(Header::Expires(expires.to_string().into()))
                        .build_for_request(&request)
                        .unwrap()
                };
                socket.send_to(&response.to_bytes(), src).await.unwrap();
            }
        });
        (addr, handle)
    }

    async fn registrar_for(addr: SocketAddr) -> (Arc<TrunkRegistrar>, Trunk) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sender = SipSender::new(socket.clone());
        let transactions = Arc::new(TransactionRegistry::new());

        // route replies arriving on the sender's socket back through the
        // transaction registry, standing in for the server dispatch loop
        let route = transactions.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let (len, _src) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                if let Ok(response) = SipResponse::parse(&buf[..len]) {
                    route.route(response).await;
                }
            }
        });

        let mut trunk = Trunk::new("carrier".into(), TrunkType::Register, addr.ip().to_string());
        trunk.id = 1;
        trunk.port = addr.port();
        trunk.username = Some("user".into());
        trunk.password = Some("pw".into());
        trunk.register_expiry_secs = 1800;

        let registrar = Arc::new(TrunkRegistrar::new(
            sender,
            transactions,
            Arc::new(MockTrunkRepository::new()),
            Arc::new(PassthroughEncryptor::new()),
            "127.0.0.1:5060".into(),
        ));
        (registrar, trunk)
    }

    #[tokio::test]
    async fn test_register_cycle_answers_challenge() {
        let (addr, _peer) = scripted_provider(1800).await;
        let (registrar, trunk) = registrar_for(addr).await;

        let granted = registrar.test_register(&trunk).await.unwrap();
        assert_eq!(granted, 1800);
    }

    #[tokio::test]
    async fn test_register_loop_reaches_registered_state() {
        let (addr, _peer) = scripted_provider(600).await;
        let (registrar, trunk) = registrar_for(addr).await;

        registrar.start_trunk(trunk.clone()).await;

        // poll until the state machine lands in REGISTERED
        let mut state = TrunkState::Idle;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(status) = registrar.status(trunk.id).await {
                state = status.state;
                if state == TrunkState::Registered {
                    assert!(status.expires_at.is_some());
                    assert!(status.registered_at.is_some());
                    assert_eq!(status.retry_attempt, 0);
                    break;
                }
            }
        }
        assert_eq!(state, TrunkState::Registered);

        registrar.stop_trunk(trunk.id).await;
        assert_eq!(
            registrar.status(trunk.id).await.unwrap().state,
            TrunkState::Stopped
        );
    }

    #[tokio::test]
    async fn test_status_starts_empty() {
        let (addr, _peer) = scripted_provider(1800).await;
        let (registrar, _trunk) = registrar_for(addr).await;
        assert!(registrar.all_statuses().await.is_empty());
        assert!(registrar.status(1).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_trunk_is_noop() {
        let (addr, _peer) = scripted_provider(1800).await;
        let (registrar, _trunk) = registrar_for(addr).await;
        registrar.stop_trunk(42).await;
    }
}
