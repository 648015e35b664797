//! Forking INVITE client
//!
//! Rings one or many targets: all at once (first 200 wins, the rest are
//! CANCELled), or sequentially with per-leg timeouts. A 200 arriving on an
//! already-cancelled leg is ACKed and immediately BYEd.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::builder::{build_ack, build_bye, build_cancel, generate_branch, generate_call_id, generate_tag, RequestBuilder};
use super::message::{SipError, SipMethod, SipRequest};
use super::server::{SipSender, TransactionRegistry};
use super::transport::TransportProtocol;

/// Grace period for a final response after CANCEL
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// One destination to ring
#[derive(Debug, Clone)]
pub struct RingTarget {
    pub extension_id: Option<i64>,
    /// Request-URI for the INVITE
    pub contact: String,
    /// Network destination (the binding's observed source address)
    pub destination: SocketAddr,
    pub transport: TransportProtocol,
}

/// Caller identity presented on outbound legs
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub name: Option<String>,
    pub number: String,
}

/// An answered leg: everything needed to keep talking to the endpoint
#[derive(Debug, Clone)]
pub struct AnsweredLeg {
    pub target: RingTarget,
    pub invite: SipRequest,
    pub response: super::message::SipResponse,
}

impl AnsweredLeg {
    pub fn dialog_to_tag(&self) -> Option<String> {
        self.response.to_tag()
    }
}

/// Result of a fork
#[derive(Debug)]
pub enum ForkOutcome {
    Answered(Box<AnsweredLeg>),
    /// All legs failed; the best (most informative) response code
    Failed(u16),
}

/// Response codes ranked per the all-failed aggregation rule:
/// 486 Busy > 480 Unavailable > 408 Timeout > 503.
pub fn best_failure(codes: &[u16]) -> u16 {
    const RANKING: [u16; 4] = [486, 480, 408, 503];
    for preferred in RANKING {
        if codes.contains(&preferred) {
            return preferred;
        }
    }
    codes.first().copied().unwrap_or(480)
}

pub struct InviteClient {
    sender: SipSender,
    transactions: Arc<TransactionRegistry>,
    /// Advertised address for Via and Contact, "ip:port"
    local_addr: String,
    domain: String,
    /// last used index per ring group, for round_robin
    round_robin_state: Mutex<HashMap<i64, usize>>,
}

impl InviteClient {
    pub fn new(
        sender: SipSender,
        transactions: Arc<TransactionRegistry>,
        local_addr: String,
        domain: String,
    ) -> Self {
        Self {
            sender,
            transactions,
            local_addr,
            domain,
            round_robin_state: Mutex::new(HashMap::new()),
        }
    }

    fn build_invite(
        &self,
        target: &RingTarget,
        caller: &CallerIdentity,
        sdp: &str,
        branch: &str,
        call_id: &str,
        from_tag: &str,
    ) -> Result<SipRequest, SipError> {
        RequestBuilder::new(SipMethod::Invite, &target.contact)
            .via(&self.local_addr, target.transport.as_str(), branch)
            .from(
                caller.name.as_deref(),
                &format!("sip:{}@{}", caller.number, self.domain),
                from_tag,
            )
            .to(&target.contact, None)
            .call_id(call_id)
            .cseq(1, SipMethod::Invite)
            .contact(&format!("sip:pbx@{}", self.local_addr))
            .max_forwards(70)
            .body("application/sdp", sdp.as_bytes().to_vec())
            .build()
    }

    /// Ring one leg until final response, timeout, or external cancel.
    async fn run_leg(
        &self,
        target: RingTarget,
        caller: CallerIdentity,
        sdp: String,
        timeout: Duration,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<(u16, Option<AnsweredLeg>), SipError> {
        let branch = generate_branch();
        let call_id = generate_call_id(&self.domain);
        let from_tag = generate_tag();
        let invite = self.build_invite(&target, &caller, &sdp, &branch, &call_id, &from_tag)?;

        let mut rx = self.transactions.register(&branch).await;
        self.sender
            .send_request(&invite, target.destination, target.transport)
            .await?;
        debug!(contact = %target.contact, %branch, "INVITE sent");

        let ring_deadline = tokio::time::Instant::now() + timeout;
        let mut cancelled = false;
        let mut grace_deadline = ring_deadline + CANCEL_GRACE;

        let outcome = loop {
            tokio::select! {
                response = rx.recv() => {
                    let response = match response {
                        Some(response) => response,
                        None => break (408, None),
                    };
                    let code = response.status_code();
                    if code < 200 {
                        debug!(contact = %target.contact, code, "provisional");
                        continue;
                    }
                    if (200..300).contains(&code) {
                        let ack = build_ack(&invite, &response, &self.local_addr, target.transport.as_str())?;
                        self.sender
                            .send_request(&ack, target.destination, target.transport)
                            .await?;
                        if cancelled {
                            // the race was lost after pickup: hang it up
                            info!(contact = %target.contact, "late 200 on cancelled leg, sending BYE");
                            let bye = build_bye(&invite, &response, &self.local_addr, target.transport.as_str())?;
                            let _ = self
                                .sender
                                .send_request(&bye, target.destination, target.transport)
                                .await;
                            break (487, None);
                        }
                        break (
                            code,
                            Some(AnsweredLeg {
                                target: target.clone(),
                                invite: invite.clone(),
                                response,
                            }),
                        );
                    }
                    break (code, None);
                }
                _ = tokio::time::sleep_until(ring_deadline), if !cancelled => {
                    debug!(contact = %target.contact, "ring timeout, cancelling");
                    cancelled = true;
                    grace_deadline = tokio::time::Instant::now() + CANCEL_GRACE;
                    let cancel = build_cancel(&invite, &self.local_addr, target.transport.as_str())?;
                    let _ = self
                        .sender
                        .send_request(&cancel, target.destination, target.transport)
                        .await;
                }
                _ = cancel_rx.changed(), if !cancelled => {
                    if *cancel_rx.borrow() {
                        cancelled = true;
                        grace_deadline = tokio::time::Instant::now() + CANCEL_GRACE;
                        let cancel = build_cancel(&invite, &self.local_addr, target.transport.as_str())?;
                        let _ = self
                            .sender
                            .send_request(&cancel, target.destination, target.transport)
                            .await;
                    }
                }
                _ = tokio::time::sleep_until(grace_deadline), if cancelled => {
                    break (408, None);
                }
            }
        };

        self.transactions.deregister(&branch).await;
        Ok(outcome)
    }

    /// Ring every target at once; the first 200 wins and the rest are
    /// cancelled.
    pub async fn ring_all(
        self: &Arc<Self>,
        targets: Vec<RingTarget>,
        caller: CallerIdentity,
        sdp: String,
        timeout: Duration,
    ) -> Result<ForkOutcome, SipError> {
        if targets.is_empty() {
            return Ok(ForkOutcome::Failed(480));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut set: JoinSet<Result<(u16, Option<AnsweredLeg>), SipError>> = JoinSet::new();
        for target in targets {
            let caller = caller.clone();
            let sdp = sdp.clone();
            let cancel_rx = cancel_rx.clone();
            let this = self.clone();
            set.spawn(async move { this.run_leg(target, caller, sdp, timeout, cancel_rx).await });
        }

        let mut failures = Vec::new();
        let mut winner: Option<AnsweredLeg> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok((_code, Some(leg)))) if winner.is_none() => {
                    winner = Some(leg);
                    // first answer wins: cancel everyone else
                    let _ = cancel_tx.send(true);
                }
                Ok(Ok((code, _))) => failures.push(code),
                Ok(Err(e)) => {
                    warn!("leg failed: {}", e);
                    failures.push(503);
                }
                Err(e) => {
                    warn!("leg task panicked: {}", e);
                    failures.push(503);
                }
            }
        }

        match winner {
            Some(leg) => Ok(ForkOutcome::Answered(Box::new(leg))),
            None => Ok(ForkOutcome::Failed(best_failure(&failures))),
        }
    }

    /// Ring targets one at a time, each with its own timeout.
    pub async fn ring_sequential(
        &self,
        targets: Vec<(RingTarget, Duration)>,
        caller: CallerIdentity,
        sdp: String,
    ) -> Result<ForkOutcome, SipError> {
        if targets.is_empty() {
            return Ok(ForkOutcome::Failed(480));
        }
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut failures = Vec::new();
        for (target, timeout) in targets {
            match self
                .run_leg(target, caller.clone(), sdp.clone(), timeout, cancel_rx.clone())
                .await
            {
                Ok((_code, Some(leg))) => return Ok(ForkOutcome::Answered(Box::new(leg))),
                Ok((code, None)) => failures.push(code),
                Err(e) => {
                    warn!("sequential leg failed: {}", e);
                    failures.push(503);
                }
            }
        }
        Ok(ForkOutcome::Failed(best_failure(&failures)))
    }

    /// Starting offset for the round_robin strategy: the position after
    /// the one used last time, remembered per group.
    pub async fn next_rotation(&self, group_id: i64, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let mut state = self.round_robin_state.lock().await;
        let start = state.get(&group_id).map(|last| (last + 1) % len).unwrap_or(0);
        state.insert(group_id, start);
        start
    }

    /// Order targets for the round_robin strategy.
    pub async fn rotate_for_group(&self, group_id: i64, targets: &mut Vec<RingTarget>) {
        let start = self.next_rotation(group_id, targets.len()).await;
        targets.rotate_left(start);
    }
}
