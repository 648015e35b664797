//! Inbound call routing
//!
//! Owns the per-call state for the caller leg: the original INVITE, the
//! media session, the dialog key and the bridged callee leg once one
//! answers. INVITE dispatch matches the DID table and hands the call to
//! the flow engine; BYE and CANCEL resolve back into the same state.

use rsip::Header;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::builder::{build_bye, generate_tag, RequestBuilder, ResponseBuilder};
use super::dialog::{DialogEvent, DialogKey, DialogManager};
use super::invite_client::AnsweredLeg;
use super::message::{uri_user, SipError, SipMethod, SipRequest, SipResponse};
use super::sdp::{build_answer, SdpSession};
use super::server::{SipHandler, SipSender};
use super::transport::TransportProtocol;
use crate::application::actions::{RingOutcome, SipActions};
use crate::application::engine::FlowEngine;
use crate::application::CallContext;
use crate::domain::cdr::{CallDirection, CallRecord, Disposition};
use crate::domain::extension::ExtensionRepository;
use crate::domain::inbound_number::InboundNumberRepository;
use crate::domain::trunk::{Trunk, TrunkRepository};
use crate::infrastructure::media::{MediaSession, MediaSessionManager};
use crate::infrastructure::media::relay::LegSide;
use crate::DomainError;

/// The caller leg of one live call
pub struct CallLeg {
    pub call_id: String,
    pub invite: SipRequest,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
    /// Our tag on dialog-establishing responses
    pub to_tag: String,
    pub session: Arc<MediaSession>,
    pub dialog_key: DialogKey,
    pub context: Arc<CallContext>,
    /// SDP we answer the caller with
    pub answer_sdp: String,
    answered: AtomicBool,
    local_cseq: AtomicU32,
    /// The outbound leg that won the fork, if any
    pub callee: Mutex<Option<AnsweredLeg>>,
    /// Who hung up, so teardown only BYEs the surviving side
    caller_sent_bye: AtomicBool,
    callee_sent_bye: AtomicBool,
    /// Wire code to reject an unanswered call with (503 when there was
    /// nobody to ring); 0 means "derive from the disposition"
    reject_code: AtomicU32,
    ended_tx: watch::Sender<bool>,
    ended_rx: watch::Receiver<bool>,
}

impl CallLeg {
    pub fn new(
        invite: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
        session: Arc<MediaSession>,
        dialog_key: DialogKey,
        context: Arc<CallContext>,
        answer_sdp: String,
    ) -> Self {
        let call_id = context.call_id.clone();
        let (ended_tx, ended_rx) = watch::channel(false);
        Self {
            call_id,
            invite,
            source,
            protocol,
            to_tag: dialog_key.to_tag.clone(),
            session,
            dialog_key,
            context,
            answer_sdp,
            answered: AtomicBool::new(false),
            local_cseq: AtomicU32::new(1),
            callee: Mutex::new(None),
            caller_sent_bye: AtomicBool::new(false),
            callee_sent_bye: AtomicBool::new(false),
            reject_code: AtomicU32::new(0),
            ended_tx,
            ended_rx,
        }
    }

    pub fn note_caller_bye(&self) {
        self.caller_sent_bye.store(true, Ordering::Relaxed);
    }

    pub fn note_callee_bye(&self) {
        self.callee_sent_bye.store(true, Ordering::Relaxed);
    }

    pub fn caller_hung_up(&self) -> bool {
        self.caller_sent_bye.load(Ordering::Relaxed)
    }

    pub fn callee_hung_up(&self) -> bool {
        self.callee_sent_bye.load(Ordering::Relaxed)
    }

    pub fn set_reject_code(&self, code: u16) {
        self.reject_code.store(code as u32, Ordering::Relaxed);
    }

    pub fn reject_code(&self) -> Option<u16> {
        match self.reject_code.load(Ordering::Relaxed) {
            0 => None,
            code => Some(code as u16),
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Relaxed)
    }

    pub fn is_ended(&self) -> bool {
        *self.ended_rx.borrow()
    }

    /// Mark the call torn down (BYE either side, CANCEL, media timeout).
    pub fn mark_ended(&self) {
        let _ = self.ended_tx.send(true);
        self.context.cancel();
    }

    /// Resolves once the call is torn down.
    pub async fn wait_ended(&self) {
        let mut rx = self.ended_rx.clone();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn ended_signal(&self) -> watch::Receiver<bool> {
        self.ended_rx.clone()
    }

    /// Send a provisional towards the caller.
    pub async fn send_provisional(&self, sender: &SipSender, code: u16) -> Result<(), SipError> {
        let response = ResponseBuilder::new(code)
            .to_tag(&self.to_tag)
            .build_for_request(&self.invite)?;
        sender.send_response(&response, self.source, self.protocol).await
    }

    /// Answer the caller with 200 + our SDP. Idempotent.
    pub async fn answer(&self, sender: &SipSender) -> Result<(), SipError> {
        if self.answered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let response = ResponseBuilder::ok()
            .to_tag(&self.to_tag)
            .header(Header::Contact(
                format!("<sip:pbx@{}>", self.source_local_hint()).into(),
            ))
            .body("application/sdp", self.answer_sdp.as_bytes().to_vec())
            .build_for_request(&self.invite)?;
        sender.send_response(&response, self.source, self.protocol).await?;
        debug!(call_id = %self.call_id, "caller leg answered");
        Ok(())
    }

    fn source_local_hint(&self) -> String {
        // Contact target the caller should reach us at; the advertised
        // address is stamped in by the router
        self.context
            .get_variable("local_contact")
            .unwrap_or_else(|| "pbx.invalid".to_string())
    }

    /// Reject an unanswered call with a final response.
    pub async fn send_final(
        &self,
        sender: &SipSender,
        code: u16,
        retry_after: Option<u32>,
    ) -> Result<(), SipError> {
        let mut builder = ResponseBuilder::new(code).to_tag(&self.to_tag);
        if let Some(secs) = retry_after {
            builder = builder.header(Header::Other(
                "Retry-After".into(),
                secs.to_string(),
            ));
        }
        let response = builder.build_for_request(&self.invite)?;
        sender.send_response(&response, self.source, self.protocol).await
    }

    /// In-dialog BYE towards the caller (roles reversed vs the INVITE).
    pub async fn send_bye_to_caller(
        &self,
        sender: &SipSender,
        local_addr: &str,
    ) -> Result<(), SipError> {
        let target = self
            .invite
            .contact_uri()
            .or_else(|| self.invite.from_uri())
            .ok_or_else(|| SipError::InvalidMessage("caller has no contact".into()))?;
        let from = self
            .invite
            .to_value()
            .ok_or_else(|| SipError::InvalidMessage("INVITE has no To".into()))?;
        let to = self
            .invite
            .from_value()
            .ok_or_else(|| SipError::InvalidMessage("INVITE has no From".into()))?;
        let from = if from.contains(";tag=") {
            from
        } else {
            format!("{};tag={}", from, self.to_tag)
        };
        let cseq = self.local_cseq.fetch_add(1, Ordering::Relaxed) + 1;

        let bye = RequestBuilder::new(SipMethod::Bye, &target)
            .via(local_addr, self.protocol.as_str(), &super::builder::generate_branch())
            .call_id(&self.call_id)
            .cseq(cseq, SipMethod::Bye)
            .max_forwards(70)
            .header(Header::From(from.into()))
            .header(Header::To(to.into()))
            .build()?;
        sender.send_request(&bye, self.source, self.protocol).await
    }

    /// In-dialog BYE towards the bridged callee, if one exists.
    pub async fn send_bye_to_callee(
        &self,
        sender: &SipSender,
        local_addr: &str,
    ) -> Result<(), SipError> {
        let callee = self.callee.lock().await;
        if let Some(leg) = callee.as_ref() {
            let bye = build_bye(&leg.invite, &leg.response, local_addr, leg.target.transport.as_str())?;
            sender
                .send_request(&bye, leg.target.destination, leg.target.transport)
                .await?;
        }
        Ok(())
    }
}

/// Index of live calls, by inbound call-id plus the call-ids of their
/// outbound legs.
pub struct CallRegistry {
    calls: RwLock<HashMap<String, Arc<CallLeg>>>,
    /// outbound leg call-id -> inbound call-id
    leg_index: RwLock<HashMap<String, String>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            leg_index: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, leg: Arc<CallLeg>) {
        self.calls.write().await.insert(leg.call_id.clone(), leg);
    }

    pub async fn get(&self, call_id: &str) -> Option<Arc<CallLeg>> {
        self.calls.read().await.get(call_id).cloned()
    }

    /// Resolve an inbound or outbound call-id to the owning call.
    pub async fn resolve(&self, call_id: &str) -> Option<Arc<CallLeg>> {
        if let Some(leg) = self.get(call_id).await {
            return Some(leg);
        }
        let inbound = self.leg_index.read().await.get(call_id).cloned()?;
        self.get(&inbound).await
    }

    /// Remember which inbound call an outbound leg belongs to.
    pub async fn link_leg(&self, outbound_call_id: &str, inbound_call_id: &str) {
        self.leg_index
            .write()
            .await
            .insert(outbound_call_id.to_string(), inbound_call_id.to_string());
    }

    pub async fn remove(&self, call_id: &str) {
        self.calls.write().await.remove(call_id);
        self.leg_index
            .write()
            .await
            .retain(|_, inbound| inbound != call_id);
    }

    pub async fn count(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn count_for_trunk(&self, trunk_id: i64) -> usize {
        let calls = self.calls.read().await;
        let mut count = 0;
        for leg in calls.values() {
            if leg.context.inbound_trunk_id == Some(trunk_id) && !leg.is_ended() {
                count += 1;
            }
        }
        count
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Final response code for an unanswered call, by disposition. Kept in
/// one place so the inbound and internal call paths cannot drift.
fn reject_code_for(disposition: Disposition) -> u16 {
    match disposition {
        Disposition::Busy => 486,
        Disposition::Cancelled => 487,
        Disposition::Failed => 500,
        Disposition::NoAnswer | Disposition::Answered => 480,
    }
}

/// Everything INVITE handling needs
pub struct CallRouter {
    pub sender: SipSender,
    pub registry: Arc<CallRegistry>,
    pub engine: Arc<FlowEngine>,
    /// Direct actions for internal extension-to-extension calls
    pub actions: Arc<dyn SipActions>,
    pub dialogs: Arc<DialogManager>,
    pub media: Arc<MediaSessionManager>,
    pub dids: Arc<dyn InboundNumberRepository>,
    pub trunks: Arc<dyn TrunkRepository>,
    pub extensions: Arc<dyn ExtensionRepository>,
    /// Advertised "ip:port" for Via/Contact
    pub local_addr: String,
    /// Address written into SDP answers
    pub public_ip: String,
}

impl CallRouter {
    /// Match the packet source against configured trunks.
    async fn identify_trunk(&self, source: SocketAddr) -> Option<Trunk> {
        let trunks = self.trunks.list(true).await.ok()?;
        let host = source.ip().to_string();
        trunks.into_iter().find(|t| t.accepts_host(&host))
    }

    async fn reject(&self, request: &SipRequest, source: SocketAddr, protocol: TransportProtocol, code: u16) {
        if let Ok(response) = ResponseBuilder::new(code).build_for_request(request) {
            let _ = self.sender.send_response(&response, source, protocol).await;
        }
    }

    async fn reject_busy_here(
        &self,
        request: &SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
        retry_after: u32,
    ) {
        let builder = ResponseBuilder::service_unavailable()
            .header(Header::Other("Retry-After".into(), retry_after.to_string()));
        if let Ok(response) = builder.build_for_request(request) {
            let _ = self.sender.send_response(&response, source, protocol).await;
        }
    }

    /// Close the wire towards both sides once a call is over: BYE whichever
    /// side is still up on an answered call, or reject an unanswered one
    /// (honouring a wire code the ring path pinned, e.g. 503 when there was
    /// nobody to ring).
    async fn finish_signalling(&self, leg: &CallLeg, disposition: Disposition) {
        if !leg.caller_hung_up() {
            if leg.is_answered() {
                let _ = leg.send_bye_to_caller(&self.sender, &self.local_addr).await;
            } else if !leg.is_ended() {
                let code = leg
                    .reject_code()
                    .unwrap_or_else(|| reject_code_for(disposition));
                let retry_after = (code == 503).then_some(30);
                let _ = leg.send_final(&self.sender, code, retry_after).await;
            }
        }
        if !leg.callee_hung_up() {
            let _ = leg.send_bye_to_callee(&self.sender, &self.local_addr).await;
        }
        leg.mark_ended();
    }

    /// Full lifecycle of one inbound call. Runs on its own task.
    pub async fn run_inbound_call(
        self: Arc<Self>,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) {
        let call_id = match request.call_id() {
            Some(call_id) => call_id,
            None => {
                self.reject(&request, source, protocol, 400).await;
                return;
            }
        };
        if self.registry.resolve(&call_id).await.is_some() {
            // INVITE retransmission for a call we're already working on
            return;
        }

        // 100 Trying quells retransmissions while we route
        if let Ok(trying) = ResponseBuilder::trying().build_for_request(&request) {
            let _ = self.sender.send_response(&trying, source, protocol).await;
        }

        let dialed = request
            .to_uri()
            .and_then(|uri| uri_user(&uri))
            .unwrap_or_default();
        let caller_number = request
            .from_uri()
            .and_then(|uri| uri_user(&uri))
            .unwrap_or_else(|| "anonymous".to_string());
        let caller_name = request.from_display_name();

        let trunk = self.identify_trunk(source).await;
        let trunk_id = trunk.as_ref().map(|t| t.id);

        // trunk channel cap
        if let Some(trunk) = &trunk {
            if trunk.max_channels > 0 {
                let active = self.registry.count_for_trunk(trunk.id).await;
                if active as u32 >= trunk.max_channels {
                    warn!(trunk = %trunk.name, "trunk channel cap reached");
                    metrics::counter!("pbx_resource_exhausted_total").increment(1);
                    self.reject_busy_here(&request, source, protocol, 30).await;
                    return;
                }
            }
        }

        let did = match self.dids.match_number(&dialed, trunk_id).await {
            Ok(Some(did)) => did,
            Ok(None) => {
                // not a DID; an extension number dialled internally?
                match self.extensions.get_by_number(&dialed).await {
                    Ok(Some(target)) if trunk.is_none() => {
                        self.run_internal_call(request, source, protocol, target)
                            .await;
                        return;
                    }
                    _ => {
                        info!(dialed, "no inbound number matches");
                        self.reject(&request, source, protocol, 404).await;
                        return;
                    }
                }
            }
            Err(e) => {
                error!("DID lookup failed: {}", e);
                self.reject(&request, source, protocol, 500).await;
                return;
            }
        };

        let graph = match self.engine.load_published(did.flow_id).await {
            Ok(graph) => graph,
            Err(DomainError::NotFound(e)) | Err(DomainError::Validation(e)) => {
                warn!(flow = did.flow_id, "flow not dispatchable: {}", e);
                self.reject(&request, source, protocol, 404).await;
                return;
            }
            Err(e) => {
                error!("flow load failed: {}", e);
                self.reject(&request, source, protocol, 500).await;
                return;
            }
        };

        // caller SDP offer
        let offer = match std::str::from_utf8(request.body())
            .ok()
            .filter(|b| !b.trim().is_empty())
            .map(SdpSession::parse)
        {
            Some(Ok(offer)) => offer,
            _ => {
                self.reject(&request, source, protocol, 488).await;
                return;
            }
        };

        let context = Arc::new(
            CallContext::new(
                call_id.clone(),
                caller_name.clone(),
                caller_number.clone(),
                dialed.clone(),
                did.id,
                trunk_id,
            )
            .with_sip_handle(Arc::new(request.clone())),
        );

        // media session: one port pair per call
        // G.711 always; Opus relays transparently when the offer carries it
        let mut allowed_payloads = vec![0u8, 8];
        if let Some(pt) = offer.opus_pt() {
            allowed_payloads.push(pt);
        }
        let session = match self
            .media
            .create_session(
                &call_id,
                allowed_payloads,
                offer.telephone_event_pt().unwrap_or(101),
                Some(context.dtmf_sender()),
            )
            .await
        {
            Ok(session) => session,
            Err(DomainError::ResourceExhausted(e)) => {
                warn!("media allocation failed: {}", e);
                self.reject_busy_here(&request, source, protocol, 60).await;
                return;
            }
            Err(e) => {
                error!("media allocation failed: {}", e);
                self.reject(&request, source, protocol, 500).await;
                return;
            }
        };
        if let Some(ip) = offer.connection_ip() {
            session.set_leg_hint(LegSide::Caller, ip);
        }

        let answer = match build_answer(&offer, &self.public_ip, session.rtp_port()) {
            Ok(answer) => answer,
            Err(_) => {
                self.media.release(session.id).await;
                self.reject(&request, source, protocol, 488).await;
                return;
            }
        };

        context.set_variable("local_contact", &self.local_addr);
        let to_tag = generate_tag();
        let dialog_key = DialogKey {
            call_id: call_id.clone(),
            from_tag: request.from_tag().unwrap_or_default(),
            to_tag: to_tag.clone(),
        };

        let cdr = CallRecord::new(
            call_id.clone(),
            CallDirection::Inbound,
            caller_name,
            caller_number,
            dialed,
            trunk_id,
        );
        self.dialogs.create(dialog_key.clone(), cdr, None).await;

        let leg = Arc::new(CallLeg::new(
            request.clone(),
            source,
            protocol,
            session,
            dialog_key.clone(),
            context.clone(),
            answer.to_string(),
        ));
        self.registry.insert(leg.clone()).await;

        info!(call_id = %call_id, flow = did.flow_id, "inbound call entering flow");
        let result = self.engine.run(&context, &graph).await;

        self.finish_signalling(&leg, result.disposition).await;

        self.dialogs
            .record_flow_path(&dialog_key, &context.flow_path())
            .await;
        if let Err(e) = self
            .dialogs
            .finish(&dialog_key, result.disposition, result.hangup_cause.as_deref())
            .await
        {
            warn!(call_id = %call_id, "dialog finish failed: {}", e);
        }
        self.registry.remove(&call_id).await;
    }
}

impl CallRouter {
    /// A registered endpoint dialling another extension directly: no flow
    /// graph, just ring the target and bridge.
    async fn run_internal_call(
        self: Arc<Self>,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
        target: crate::domain::extension::Extension,
    ) {
        let call_id = request.call_id().unwrap_or_default();
        let caller_number = request
            .from_uri()
            .and_then(|uri| uri_user(&uri))
            .unwrap_or_else(|| "anonymous".to_string());
        let caller_name = request.from_display_name();

        let offer = match std::str::from_utf8(request.body())
            .ok()
            .filter(|b| !b.trim().is_empty())
            .map(SdpSession::parse)
        {
            Some(Ok(offer)) => offer,
            _ => {
                self.reject(&request, source, protocol, 488).await;
                return;
            }
        };

        let context = Arc::new(CallContext::new(
            call_id.clone(),
            caller_name.clone(),
            caller_number.clone(),
            target.number.clone(),
            0,
            None,
        ));
        // G.711 always; Opus relays transparently when the offer carries it
        let mut allowed_payloads = vec![0u8, 8];
        if let Some(pt) = offer.opus_pt() {
            allowed_payloads.push(pt);
        }
        let session = match self
            .media
            .create_session(
                &call_id,
                allowed_payloads,
                offer.telephone_event_pt().unwrap_or(101),
                Some(context.dtmf_sender()),
            )
            .await
        {
            Ok(session) => session,
            Err(DomainError::ResourceExhausted(_)) => {
                metrics::counter!("pbx_resource_exhausted_total").increment(1);
                self.reject_busy_here(&request, source, protocol, 60).await;
                return;
            }
            Err(e) => {
                error!("media allocation failed: {}", e);
                self.reject(&request, source, protocol, 500).await;
                return;
            }
        };
        if let Some(ip) = offer.connection_ip() {
            session.set_leg_hint(LegSide::Caller, ip);
        }
        let answer = match build_answer(&offer, &self.public_ip, session.rtp_port()) {
            Ok(answer) => answer,
            Err(_) => {
                self.media.release(session.id).await;
                self.reject(&request, source, protocol, 488).await;
                return;
            }
        };

        context.set_variable("local_contact", &self.local_addr);
        let dialog_key = DialogKey {
            call_id: call_id.clone(),
            from_tag: request.from_tag().unwrap_or_default(),
            to_tag: generate_tag(),
        };
        let cdr = CallRecord::new(
            call_id.clone(),
            CallDirection::Internal,
            caller_name,
            caller_number,
            target.number.clone(),
            None,
        );
        self.dialogs
            .create(dialog_key.clone(), cdr, Some(target.id))
            .await;

        let leg = Arc::new(CallLeg::new(
            request,
            source,
            protocol,
            session,
            dialog_key.clone(),
            context.clone(),
            answer.to_string(),
        ));
        self.registry.insert(leg.clone()).await;

        info!(call_id = %call_id, target = %target.number, "internal call");
        let outcome = if target.do_not_disturb {
            Ok(RingOutcome::Dnd)
        } else {
            self.actions
                .ring_extension(&context, target.id, target.ring_timeout_secs)
                .await
        };

        let disposition = match &outcome {
            _ if context.is_cancelled() && !context.was_answered() => Disposition::Cancelled,
            Ok(RingOutcome::Answered) => Disposition::Answered,
            Ok(RingOutcome::Busy) | Ok(RingOutcome::Dnd) => Disposition::Busy,
            Ok(_) => Disposition::NoAnswer,
            Err(_) => Disposition::Failed,
        };

        self.finish_signalling(&leg, disposition).await;

        let cause = outcome.err().map(|e| e.kind().to_string());
        let _ = self
            .dialogs
            .finish(&dialog_key, disposition, cause.as_deref())
            .await;
        self.registry.remove(&call_id).await;
    }
}

/// INVITE entry point
pub struct InviteHandler {
    router: Arc<CallRouter>,
}

impl InviteHandler {
    pub fn new(router: Arc<CallRouter>) -> Self {
        Self { router }
    }
}

#[async_trait::async_trait]
impl SipHandler for InviteHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<Option<SipResponse>, SipError> {
        // re-INVITE within a dialog: hold / resume
        if request.to_tag().is_some() {
            let call_id = request.call_id().unwrap_or_default();
            let leg = self.router.registry.resolve(&call_id).await;
            let Some(leg) = leg else {
                return Ok(Some(
                    ResponseBuilder::new(481).build_for_request(&request)?,
                ));
            };
            let hold = std::str::from_utf8(request.body())
                .ok()
                .and_then(|b| SdpSession::parse(b).ok())
                .map(|sdp| sdp.direction.is_hold())
                .unwrap_or(false);
            let event = if hold { DialogEvent::Hold } else { DialogEvent::Resume };
            if let Err(e) = self.router.dialogs.apply(&leg.dialog_key, event).await {
                debug!(call_id = %call_id, "re-INVITE in unexpected state: {}", e);
            } else {
                info!(call_id = %call_id, hold, "re-INVITE processed");
            }
            return Ok(Some(
                ResponseBuilder::ok()
                    .body("application/sdp", leg.answer_sdp.as_bytes().to_vec())
                    .build_for_request(&request)?,
            ));
        }

        let router = self.router.clone();
        tokio::spawn(router.run_inbound_call(request, source, protocol));
        Ok(None)
    }
}

/// BYE from either side
pub struct ByeHandler {
    registry: Arc<CallRegistry>,
    dialogs: Arc<DialogManager>,
}

impl ByeHandler {
    pub fn new(registry: Arc<CallRegistry>, dialogs: Arc<DialogManager>) -> Self {
        Self { registry, dialogs }
    }
}

#[async_trait::async_trait]
impl SipHandler for ByeHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _source: SocketAddr,
        _protocol: TransportProtocol,
    ) -> Result<Option<SipResponse>, SipError> {
        let call_id = request.call_id().unwrap_or_default();
        match self.registry.resolve(&call_id).await {
            Some(leg) => {
                if call_id == leg.call_id {
                    info!(call_id = %call_id, "BYE from caller");
                    leg.note_caller_bye();
                } else {
                    info!(call_id = %leg.call_id, "BYE from callee leg");
                    leg.note_callee_bye();
                }
                let _ = self.dialogs.apply(&leg.dialog_key, DialogEvent::Bye).await;
                let _ = self
                    .dialogs
                    .apply(&leg.dialog_key, DialogEvent::Terminated)
                    .await;
                leg.mark_ended();
                Ok(Some(ResponseBuilder::ok().build_for_request(&request)?))
            }
            None => Ok(Some(
                ResponseBuilder::new(481).build_for_request(&request)?,
            )),
        }
    }
}

/// CANCEL of a pending INVITE
pub struct CancelHandler {
    registry: Arc<CallRegistry>,
}

impl CancelHandler {
    pub fn new(registry: Arc<CallRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl SipHandler for CancelHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _source: SocketAddr,
        _protocol: TransportProtocol,
    ) -> Result<Option<SipResponse>, SipError> {
        let call_id = request.call_id().unwrap_or_default();
        match self.registry.resolve(&call_id).await {
            Some(leg) if !leg.is_answered() => {
                info!(call_id = %call_id, "CANCEL received");
                leg.context.cancel();
                leg.mark_ended();
                Ok(Some(ResponseBuilder::ok().build_for_request(&request)?))
            }
            Some(_) => {
                // too late, the call is already answered
                Ok(Some(ResponseBuilder::ok().build_for_request(&request)?))
            }
            None => Ok(Some(
                ResponseBuilder::new(481).build_for_request(&request)?,
            )),
        }
    }
}

/// ACK consumer: 2xx ACKs confirm the dialog.
pub struct AckHandler {
    registry: Arc<CallRegistry>,
    dialogs: Arc<DialogManager>,
}

impl AckHandler {
    pub fn new(registry: Arc<CallRegistry>, dialogs: Arc<DialogManager>) -> Self {
        Self { registry, dialogs }
    }
}

#[async_trait::async_trait]
impl SipHandler for AckHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _source: SocketAddr,
        _protocol: TransportProtocol,
    ) -> Result<Option<SipResponse>, SipError> {
        let call_id = request.call_id().unwrap_or_default();
        if let Some(leg) = self.registry.resolve(&call_id).await {
            // the ACK for our 200 confirms the dialog; later in-dialog
            // ACKs arrive in Answered state and change nothing
            if let Some(state) = self.dialogs.state(&leg.dialog_key).await {
                if matches!(state, super::dialog::DialogState::Created | super::dialog::DialogState::Ringing)
                    && leg.is_answered()
                {
                    let _ = self
                        .dialogs
                        .apply(&leg.dialog_key, DialogEvent::Answer)
                        .await;
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::port_pool::PortPair;

    async fn leg_for_test(call_id: &str) -> Arc<CallLeg> {
        let session = MediaSession::bind(
            call_id.to_string(),
            PortPair { rtp: 0 },
            vec![0, 8],
            101,
            None,
        )
        .await
        .unwrap();
        let invite = SipRequest::parse(
            b"INVITE sip:5551000@pbx SIP/2.0\r\n\
              Via: SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bKcall\r\n\
              From: <sip:0400000000@carrier>;tag=ft1\r\n\
              To: <sip:5551000@pbx>\r\n\
              Call-ID: call-under-test\r\n\
              CSeq: 1 INVITE\r\n\
              Contact: <sip:0400000000@10.0.0.9:5060>\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap();
        let context = Arc::new(CallContext::new(
            call_id.to_string(),
            None,
            "0400000000".into(),
            "5551000".into(),
            1,
            Some(1),
        ));
        Arc::new(CallLeg::new(
            invite,
            "10.0.0.9:5060".parse().unwrap(),
            TransportProtocol::Udp,
            Arc::new(session),
            DialogKey {
                call_id: call_id.to_string(),
                from_tag: "ft1".into(),
                to_tag: "tt1".into(),
            },
            context,
            "v=0".into(),
        ))
    }

    #[tokio::test]
    async fn test_registry_resolve_by_leg() {
        let registry = CallRegistry::new();
        let leg = leg_for_test("call-under-test").await;
        registry.insert(leg.clone()).await;
        registry.link_leg("outbound-leg-1", "call-under-test").await;

        assert!(registry.resolve("call-under-test").await.is_some());
        assert!(registry.resolve("outbound-leg-1").await.is_some());
        assert!(registry.resolve("unknown").await.is_none());

        registry.remove("call-under-test").await;
        assert!(registry.resolve("outbound-leg-1").await.is_none());
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_count_for_trunk() {
        let registry = CallRegistry::new();
        let leg = leg_for_test("call-under-test").await;
        registry.insert(leg.clone()).await;
        assert_eq!(registry.count_for_trunk(1).await, 1);
        assert_eq!(registry.count_for_trunk(2).await, 0);
        leg.mark_ended();
        assert_eq!(registry.count_for_trunk(1).await, 0);
    }

    #[test]
    fn test_reject_code_mapping() {
        assert_eq!(reject_code_for(Disposition::Busy), 486);
        assert_eq!(reject_code_for(Disposition::Cancelled), 487);
        assert_eq!(reject_code_for(Disposition::Failed), 500);
        assert_eq!(reject_code_for(Disposition::NoAnswer), 480);
        // an "answered" flow that never answered the wire still rejects 480
        assert_eq!(reject_code_for(Disposition::Answered), 480);
    }

    #[tokio::test]
    async fn test_mark_ended_cancels_context() {
        let leg = leg_for_test("call-under-test").await;
        assert!(!leg.is_ended());
        leg.mark_ended();
        assert!(leg.is_ended());
        assert!(leg.context.is_cancelled());
        // wait_ended resolves immediately now
        leg.wait_ended().await;
    }
}
