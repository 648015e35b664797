//! SipActions implementation
//!
//! The concrete bridge between the flow engine and the SIP/media planes.
//! Ring actions bridge the winning leg to the caller and hold the call
//! until either side hangs up, so the node's output edge runs only after
//! the conversation ends.

use rsip::Header;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::builder::{generate_branch, generate_call_id, generate_tag, RequestBuilder};
use super::call_router::{CallLeg, CallRegistry};
use super::dialog::{DialogEvent, DialogManager};
use super::invite_client::{AnsweredLeg, CallerIdentity, ForkOutcome, InviteClient, RingTarget};
use super::message::SipMethod;
use super::registrar::Registrar;
use super::sdp::{build_offer, SdpSession};
use super::server::SipSender;
use super::transport::TransportProtocol;
use crate::application::actions::{CollectResult, PromptRef, RecordResult, RingOutcome, SipActions};
use crate::application::context::CallContext;
use crate::domain::conference::ConferenceBridgeRepository;
use crate::domain::extension::{Extension, ExtensionRepository, FollowMeStrategy, RecordingPolicy};
use crate::domain::collaborators::PushClient;
use crate::domain::registration::RegistrationRepository;
use crate::domain::ring_group::RingStrategy;
use crate::domain::trunk::{Trunk, TrunkRepository, TrunkTransport};
use crate::infrastructure::media::g711::G711Codec;
use crate::infrastructure::media::mixer::ConferenceManager;
use crate::infrastructure::media::prompts::{
    play_file, PromptStore, PROMPT_BEEP, PROMPT_CONFERENCE_FULL, PROMPT_CONFERENCE_JOIN,
    PROMPT_CONFIRM_CALL, PROMPT_ENTER_PIN, PROMPT_INVALID_OPTION,
};
use crate::infrastructure::media::recorder::record_to_wav;
use crate::infrastructure::media::relay::LegSide;
use crate::{DomainError, Result};

/// How long we wait for a pushed device to re-register
const PUSH_WAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// DTMF wait for follow-me answer confirmation
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PbxActions {
    pub sender: SipSender,
    pub invite_client: Arc<InviteClient>,
    pub registry: Arc<CallRegistry>,
    pub registrar: Arc<Registrar>,
    pub dialogs: Arc<DialogManager>,
    pub prompts: Arc<PromptStore>,
    pub conferences: Arc<ConferenceManager>,
    pub conference_repo: Arc<dyn ConferenceBridgeRepository>,
    pub extensions: Arc<dyn ExtensionRepository>,
    pub registrations: Arc<dyn RegistrationRepository>,
    pub trunks: Arc<dyn TrunkRepository>,
    pub push: Arc<dyn PushClient>,
    /// Advertised "ip:port"
    pub local_addr: String,
    pub public_ip: String,
    pub domain: String,
    pub recordings_dir: PathBuf,
}

impl PbxActions {
    async fn leg_for(&self, ctx: &CallContext) -> Result<Arc<CallLeg>> {
        self.registry
            .get(&ctx.call_id)
            .await
            .ok_or_else(|| DomainError::NotFound(format!("no live call {}", ctx.call_id)))
    }

    /// Contacts of an extension as ring targets.
    async fn targets_for_extension(&self, extension_id: i64) -> Vec<RingTarget> {
        self.registrar
            .active_contacts(extension_id)
            .await
            .into_iter()
            .filter_map(|binding| {
                let destination = format!("{}:{}", binding.source_ip, binding.source_port)
                    .parse()
                    .ok()?;
                Some(RingTarget {
                    extension_id: Some(extension_id),
                    contact: binding.contact,
                    destination,
                    transport: match binding.transport {
                        crate::domain::registration::BindingTransport::Udp => TransportProtocol::Udp,
                        crate::domain::registration::BindingTransport::Tcp => TransportProtocol::Tcp,
                        crate::domain::registration::BindingTransport::Tls => TransportProtocol::Tls,
                    },
                })
            })
            .collect()
    }

    /// Fire push notifications and wait for the device to re-register.
    async fn wake_push_devices(&self, extension_id: i64, caller: &str) -> bool {
        let targets = match self.registrations.push_targets(extension_id).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(extension_id, "push target lookup failed: {}", e);
                return false;
            }
        };
        if targets.is_empty() {
            return false;
        }
        for target in &targets {
            if let (Some(token), Some(platform)) = (&target.push_token, target.push_platform) {
                let platform = match platform {
                    crate::domain::registration::PushPlatform::Ios => "ios",
                    crate::domain::registration::PushPlatform::Android => "android",
                };
                if let Err(e) = self.push.wake(token, platform, caller).await {
                    warn!(extension_id, "push wake failed: {}", e);
                }
            }
        }
        info!(extension_id, "push sent, waiting for fresh registration");
        self.registrar
            .wait_for_registration(extension_id, PUSH_WAKE_TIMEOUT)
            .await
    }

    fn caller_identity(&self, ctx: &CallContext) -> CallerIdentity {
        CallerIdentity {
            name: ctx.caller_id_name.clone(),
            number: ctx.caller_id_number.clone(),
        }
    }

    fn offer_sdp(&self, leg: &CallLeg) -> String {
        build_offer(&self.public_ip, leg.session.rtp_port(), &leg.call_id).to_string()
    }

    fn map_failure(code: u16) -> RingOutcome {
        match code {
            486 | 600 | 603 => RingOutcome::Busy,
            _ => RingOutcome::NoAnswer,
        }
    }

    /// Bridge the winning leg to the caller and hold until either side
    /// hangs up.
    async fn bridge_and_wait(&self, ctx: &CallContext, leg: &CallLeg, won: AnsweredLeg) -> Result<()> {
        // let the callee's media pin to its SDP address
        if let Ok(body) = std::str::from_utf8(won.response.body()) {
            if let Ok(answer) = SdpSession::parse(body) {
                if let Some(ip) = answer.connection_ip() {
                    leg.session.set_leg_hint(LegSide::Callee, ip);
                }
            }
        }
        if let Some(outbound_call_id) = won.invite.call_id() {
            self.registry.link_leg(&outbound_call_id, &leg.call_id).await;
        }

        *leg.callee.lock().await = Some(won);
        leg.answer(&self.sender).await?;
        ctx.mark_answered();
        let _ = self.dialogs.apply(&leg.dialog_key, DialogEvent::Answer).await;
        metrics::counter!("pbx_calls_bridged_total").increment(1);

        // the conversation runs until a BYE from either side or process
        // cancellation tears the call down
        leg.wait_ended().await;
        Ok(())
    }

    /// Confirm an answered follow-me leg: play the prompt to the callee
    /// and require a 1.
    async fn confirm_leg(&self, leg: &CallLeg) -> bool {
        let (tx, mut rx) = mpsc::channel(8);
        leg.session.set_callee_dtmf(tx);
        let prompt = self.prompts.system_path(PROMPT_CONFIRM_CALL);
        let (_stop_tx, stop_rx) = watch::channel(false);
        if let Err(e) = play_file(&leg.session, LegSide::Callee, &prompt, stop_rx).await {
            warn!("confirm prompt failed: {}", e);
        }
        let confirmed = matches!(
            tokio::time::timeout(CONFIRM_TIMEOUT, rx.recv()).await,
            Ok(Some('1'))
        );
        leg.session.clear_callee_dtmf();
        confirmed
    }

    /// Begin a call recording when the ringing extension's policy asks
    /// for it. Returns the capture task, joined after the bridge ends.
    async fn start_call_recording(
        &self,
        leg: &CallLeg,
        extension_id: i64,
    ) -> Option<tokio::task::JoinHandle<Result<crate::infrastructure::media::recorder::Capture>>>
    {
        let extension = self.extensions.get(extension_id).await.ok()??;
        if !matches!(
            extension.recording_policy,
            RecordingPolicy::Inbound | RecordingPolicy::Always
        ) {
            return None;
        }
        if std::fs::create_dir_all(&self.recordings_dir).is_err() {
            return None;
        }
        let path = self.recordings_dir.join(format!(
            "{}-{}.wav",
            chrono::Utc::now().timestamp_millis(),
            extension.number
        ));
        let (tap_tx, mut tap_rx) = mpsc::channel(64);
        leg.session.set_record_tap(tap_tx);
        let ended = leg.ended_signal();
        info!(call_id = %leg.call_id, path = %path.display(), "call recording started");
        Some(tokio::spawn(async move {
            record_to_wav(
                &mut tap_rx,
                &path,
                G711Codec::Ulaw,
                Duration::from_secs(4 * 3600),
                // long calls go quiet; only the ended signal stops us early
                Duration::from_secs(3600),
                ended,
            )
            .await
        }))
    }

    async fn finish_call_recording(
        &self,
        leg: &CallLeg,
        recorder: Option<tokio::task::JoinHandle<Result<crate::infrastructure::media::recorder::Capture>>>,
    ) {
        let Some(recorder) = recorder else { return };
        leg.session.clear_record_tap();
        match recorder.await {
            Ok(Ok(capture)) => {
                self.dialogs
                    .set_recording_file(&leg.dialog_key, &capture.file_path.to_string_lossy())
                    .await;
            }
            Ok(Err(e)) => warn!(call_id = %leg.call_id, "call recording failed: {}", e),
            Err(e) => warn!(call_id = %leg.call_id, "recording task failed: {}", e),
        }
    }

    async fn resolve_prompt(&self, prompt: PromptRef) -> Result<PathBuf> {
        match prompt {
            PromptRef::Prompt(id) => self.prompts.path_for(id).await,
            PromptRef::File(path) => Ok(path),
            PromptRef::Tts(text) => {
                // no TTS collaborator in the core; play the beep instead
                warn!("TTS prompt requested without a TTS engine: {:?}", text);
                Ok(self.prompts.system_path(PROMPT_BEEP))
            }
        }
    }

    async fn play_resolved(&self, ctx: &CallContext, leg: &CallLeg, path: &Path) -> Result<()> {
        play_file(&leg.session, LegSide::Caller, path, ctx.cancel_signal()).await
    }

    /// Pick the outbound trunk with the highest priority.
    async fn select_trunk(&self) -> Result<Trunk> {
        let mut trunks = self.trunks.list(true).await?;
        trunks.sort_by_key(|t| t.priority);
        trunks
            .into_iter()
            .next()
            .ok_or_else(|| DomainError::NotFound("no enabled trunk for outbound leg".into()))
    }

    async fn external_target(&self, trunk: &Trunk, number: &str) -> Result<RingTarget> {
        let dialed = trunk.format_number(number);
        let destination = tokio::net::lookup_host((trunk.host.as_str(), trunk.port))
            .await
            .map_err(|e| DomainError::Transient(format!("resolve {}: {}", trunk.host, e)))?
            .next()
            .ok_or_else(|| DomainError::Transient(format!("no address for {}", trunk.host)))?;
        Ok(RingTarget {
            extension_id: None,
            contact: format!("sip:{}@{}:{}", dialed, trunk.host, trunk.port),
            destination,
            transport: match trunk.transport {
                TrunkTransport::Udp => TransportProtocol::Udp,
                TrunkTransport::Tcp => TransportProtocol::Tcp,
                TrunkTransport::Tls => TransportProtocol::Tls,
            },
        })
    }

    /// Ring one member's contacts together for up to `timeout`.
    async fn ring_member(
        &self,
        ctx: &CallContext,
        leg: &CallLeg,
        extension: &Extension,
        timeout: Duration,
    ) -> Result<Option<AnsweredLeg>> {
        if extension.do_not_disturb {
            return Ok(None);
        }
        let targets = self.targets_for_extension(extension.id).await;
        if targets.is_empty() {
            return Ok(None);
        }
        let outcome = self
            .invite_client
            .ring_all(
                targets,
                self.caller_identity(ctx),
                self.offer_sdp(leg),
                timeout,
            )
            .await
            .map_err(|e| DomainError::Transient(e.to_string()))?;
        match outcome {
            ForkOutcome::Answered(won) => Ok(Some(*won)),
            ForkOutcome::Failed(_) => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl SipActions for PbxActions {
    async fn ring_extension(
        &self,
        ctx: &CallContext,
        extension_id: i64,
        timeout_secs: u32,
    ) -> Result<RingOutcome> {
        let leg = self.leg_for(ctx).await?;
        if leg.is_ended() {
            return Ok(RingOutcome::NoAnswer);
        }
        let mut targets = self.targets_for_extension(extension_id).await;
        if targets.is_empty()
            && self
                .wake_push_devices(extension_id, &ctx.caller_id_number)
                .await
        {
            targets = self.targets_for_extension(extension_id).await;
        }
        if targets.is_empty() {
            debug!(extension_id, "no registrations to ring");
            leg.set_reject_code(503);
            return Ok(RingOutcome::NoRegistrations);
        }

        let _ = leg.send_provisional(&self.sender, 180).await;
        let outcome = self
            .invite_client
            .ring_all(
                targets,
                self.caller_identity(ctx),
                self.offer_sdp(&leg),
                Duration::from_secs(timeout_secs as u64),
            )
            .await
            .map_err(|e| DomainError::Transient(e.to_string()))?;

        match outcome {
            ForkOutcome::Answered(won) => {
                let recorder = self.start_call_recording(&leg, extension_id).await;
                self.bridge_and_wait(ctx, &leg, *won).await?;
                self.finish_call_recording(&leg, recorder).await;
                Ok(RingOutcome::Answered)
            }
            ForkOutcome::Failed(code) => Ok(Self::map_failure(code)),
        }
    }

    async fn ring_group(
        &self,
        ctx: &CallContext,
        group_id: i64,
        extension_ids: &[i64],
        strategy: RingStrategy,
        timeout_secs: u32,
    ) -> Result<RingOutcome> {
        let leg = self.leg_for(ctx).await?;
        if leg.is_ended() {
            return Ok(RingOutcome::NoAnswer);
        }
        let timeout = Duration::from_secs(timeout_secs as u64);

        // resolve members up front; unknown or DND members drop out
        let mut members = Vec::new();
        for &extension_id in extension_ids {
            if let Some(extension) = self.extensions.get(extension_id).await? {
                if !extension.do_not_disturb {
                    members.push(extension);
                }
            }
        }

        let _ = leg.send_provisional(&self.sender, 180).await;

        let won = match strategy {
            RingStrategy::RingAll => {
                let mut targets = Vec::new();
                for member in &members {
                    targets.extend(self.targets_for_extension(member.id).await);
                }
                if targets.is_empty() {
                    leg.set_reject_code(503);
                    return Ok(RingOutcome::NoRegistrations);
                }
                match self
                    .invite_client
                    .ring_all(targets, self.caller_identity(ctx), self.offer_sdp(&leg), timeout)
                    .await
                    .map_err(|e| DomainError::Transient(e.to_string()))?
                {
                    ForkOutcome::Answered(won) => Some(*won),
                    ForkOutcome::Failed(code) => {
                        return Ok(Self::map_failure(code));
                    }
                }
            }
            RingStrategy::RoundRobin | RingStrategy::Random | RingStrategy::LongestIdle => {
                match strategy {
                    RingStrategy::RoundRobin => {
                        let start = self
                            .invite_client
                            .next_rotation(group_id, members.len())
                            .await;
                        members.rotate_left(start);
                    }
                    RingStrategy::Random => {
                        use rand::seq::SliceRandom;
                        members.shuffle(&mut rand::thread_rng());
                    }
                    RingStrategy::LongestIdle => {
                        let mut keyed = Vec::new();
                        for member in members {
                            let last = self.dialogs.last_answered_end(member.id).await;
                            keyed.push((last, member.id, member));
                        }
                        // never-answered first, then oldest end, ties by id
                        keyed.sort_by(|a, b| match (a.0, b.0) {
                            (None, None) => a.1.cmp(&b.1),
                            (None, Some(_)) => std::cmp::Ordering::Less,
                            (Some(_), None) => std::cmp::Ordering::Greater,
                            (Some(x), Some(y)) => x.cmp(&y).then(a.1.cmp(&b.1)),
                        });
                        members = keyed.into_iter().map(|(_, _, m)| m).collect();
                    }
                    RingStrategy::RingAll => unreachable!(),
                }

                let mut any_reachable = false;
                let mut winner = None;
                for member in &members {
                    let per_member =
                        Duration::from_secs(member.effective_ring_timeout(timeout_secs) as u64);
                    if !self.targets_for_extension(member.id).await.is_empty() {
                        any_reachable = true;
                    }
                    if let Some(won) = self.ring_member(ctx, &leg, member, per_member).await? {
                        winner = Some(won);
                        break;
                    }
                    if ctx.is_cancelled() {
                        return Ok(RingOutcome::NoAnswer);
                    }
                }
                if winner.is_none() && !any_reachable {
                    leg.set_reject_code(503);
                    return Ok(RingOutcome::NoRegistrations);
                }
                winner
            }
        };

        match won {
            Some(won) => {
                self.bridge_and_wait(ctx, &leg, won).await?;
                Ok(RingOutcome::Answered)
            }
            None => Ok(RingOutcome::NoAnswer),
        }
    }

    async fn ring_follow_me(&self, ctx: &CallContext, extension_id: i64) -> Result<RingOutcome> {
        let leg = self.leg_for(ctx).await?;
        if leg.is_ended() {
            return Ok(RingOutcome::NoAnswer);
        }
        let extension = self
            .extensions
            .get(extension_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("extension {}", extension_id)))?;
        let follow_me = &extension.follow_me;
        if !follow_me.enabled || follow_me.legs.is_empty() {
            return Ok(RingOutcome::NoAnswer);
        }

        let trunk = self.select_trunk().await?;
        let _ = leg.send_provisional(&self.sender, 180).await;
        let mut identity = self.caller_identity(ctx);
        // trunk caller-ID override applies to every outbound leg
        if let Some(number) = &trunk.caller_id_number {
            identity.number = number.clone();
        }
        if trunk.caller_id_name.is_some() {
            identity.name = trunk.caller_id_name.clone();
        }
        let sdp = self.offer_sdp(&leg);

        let won = match follow_me.strategy {
            FollowMeStrategy::Simultaneous => {
                let mut targets = Vec::new();
                let mut timeout = 0u32;
                for fm_leg in &follow_me.legs {
                    targets.push(self.external_target(&trunk, &fm_leg.number).await?);
                    timeout = timeout.max(fm_leg.delay_secs + fm_leg.timeout_secs);
                }
                match self
                    .invite_client
                    .ring_all(targets, identity, sdp, Duration::from_secs(timeout.max(25) as u64))
                    .await
                    .map_err(|e| DomainError::Transient(e.to_string()))?
                {
                    ForkOutcome::Answered(won) => {
                        // the confirm flag of whichever leg won the race
                        let confirm = follow_me
                            .legs
                            .iter()
                            .find(|l| won.target.contact.contains(&trunk.format_number(&l.number)))
                            .map(|l| l.confirm)
                            .unwrap_or(false);
                        Some((*won, confirm))
                    }
                    ForkOutcome::Failed(code) => return Ok(Self::map_failure(code)),
                }
            }
            FollowMeStrategy::Sequential => {
                let mut winner = None;
                for fm_leg in &follow_me.legs {
                    if fm_leg.delay_secs > 0 {
                        tokio::time::sleep(Duration::from_secs(fm_leg.delay_secs as u64)).await;
                    }
                    if ctx.is_cancelled() {
                        return Ok(RingOutcome::NoAnswer);
                    }
                    let target = self.external_target(&trunk, &fm_leg.number).await?;
                    let timeout = Duration::from_secs(fm_leg.timeout_secs.max(1) as u64);
                    match self
                        .invite_client
                        .ring_sequential(vec![(target, timeout)], identity.clone(), sdp.clone())
                        .await
                        .map_err(|e| DomainError::Transient(e.to_string()))?
                    {
                        ForkOutcome::Answered(won) => {
                            winner = Some((*won, fm_leg.confirm));
                            break;
                        }
                        ForkOutcome::Failed(_) => continue,
                    }
                }
                winner
            }
        };

        let Some((won, needs_confirm)) = won else {
            return Ok(RingOutcome::NoAnswer);
        };

        if needs_confirm {
            // the answerer must press 1; voicemail of the external number
            // must not swallow the call
            if let Ok(body) = std::str::from_utf8(won.response.body()) {
                if let Ok(answer) = SdpSession::parse(body) {
                    if let Some(ip) = answer.connection_ip() {
                        leg.session.set_leg_hint(LegSide::Callee, ip);
                    }
                }
            }
            if !self.confirm_leg(&leg).await {
                info!(extension_id, "follow-me leg did not confirm, dropping it");
                let bye = super::builder::build_bye(
                    &won.invite,
                    &won.response,
                    &self.local_addr,
                    won.target.transport.as_str(),
                )
                .map_err(|e| DomainError::Internal(e.to_string()))?;
                let _ = self
                    .sender
                    .send_request(&bye, won.target.destination, won.target.transport)
                    .await;
                return Ok(RingOutcome::NoAnswer);
            }
        }

        self.bridge_and_wait(ctx, &leg, won).await?;
        Ok(RingOutcome::Answered)
    }

    async fn play_prompt(&self, ctx: &CallContext, prompt: PromptRef) -> Result<()> {
        let leg = self.leg_for(ctx).await?;
        leg.answer(&self.sender)
            .await
            .map_err(|e| DomainError::Transient(e.to_string()))?;
        let path = self.resolve_prompt(prompt).await?;
        self.play_resolved(ctx, &leg, &path).await
    }

    async fn play_and_collect(
        &self,
        ctx: &CallContext,
        prompt: Option<PromptRef>,
        initial_timeout_secs: u32,
        inter_digit_timeout_secs: u32,
        max_digits: usize,
        terminator: Option<char>,
    ) -> Result<CollectResult> {
        let leg = self.leg_for(ctx).await?;
        leg.answer(&self.sender)
            .await
            .map_err(|e| DomainError::Transient(e.to_string()))?;
        ctx.drain_dtmf().await;

        // playback runs concurrently so the caller can barge in
        let (stop_tx, stop_rx) = watch::channel(false);
        let playback = match prompt {
            Some(prompt) => {
                let path = self.resolve_prompt(prompt).await?;
                let session = leg.session.clone();
                Some(tokio::spawn(async move {
                    let _ = play_file(&session, LegSide::Caller, &path, stop_rx).await;
                }))
            }
            None => None,
        };

        let mut digits = String::new();
        let mut timed_out = false;
        match ctx
            .next_digit(Duration::from_secs(initial_timeout_secs as u64))
            .await
        {
            Some(digit) => {
                let _ = stop_tx.send(true);
                if Some(digit) != terminator {
                    digits.push(digit);
                }
            }
            None => timed_out = true,
        }

        while !timed_out && digits.len() < max_digits {
            match ctx
                .next_digit(Duration::from_secs(inter_digit_timeout_secs as u64))
                .await
            {
                Some(digit) if Some(digit) == terminator => break,
                Some(digit) => digits.push(digit),
                None => break,
            }
        }

        let _ = stop_tx.send(true);
        if let Some(playback) = playback {
            let _ = playback.await;
        }
        debug!(call_id = %ctx.call_id, digits = %digits, timed_out, "collected DTMF");
        Ok(CollectResult { digits, timed_out })
    }

    async fn record_message(
        &self,
        ctx: &CallContext,
        greeting: Option<PromptRef>,
        max_duration_secs: u32,
        file_path: &Path,
    ) -> Result<RecordResult> {
        let leg = self.leg_for(ctx).await?;
        leg.answer(&self.sender)
            .await
            .map_err(|e| DomainError::Transient(e.to_string()))?;

        if let Some(greeting) = greeting {
            let path = self.resolve_prompt(greeting).await?;
            self.play_resolved(ctx, &leg, &path).await?;
        }
        let beep = self.prompts.system_path(PROMPT_BEEP);
        self.play_resolved(ctx, &leg, &beep).await?;

        let (tap_tx, mut tap_rx) = mpsc::channel(64);
        leg.session.set_local_tap(tap_tx);
        let capture = record_to_wav(
            &mut tap_rx,
            file_path,
            G711Codec::Ulaw,
            Duration::from_secs(max_duration_secs as u64),
            crate::infrastructure::media::recorder::SILENCE_TIMEOUT,
            ctx.cancel_signal(),
        )
        .await;
        leg.session.clear_local_tap();
        let capture = capture?;

        Ok(RecordResult {
            file_path: capture.file_path,
            duration_secs: capture.duration_secs,
            packet_count: capture.packet_count,
        })
    }

    async fn send_mwi(&self, extension_id: i64, new_count: u32, old_count: u32) -> Result<()> {
        let contacts = self.registrar.active_contacts(extension_id).await;
        if contacts.is_empty() {
            debug!(extension_id, "MWI skipped, no registrations");
            return Ok(());
        }
        let extension = self
            .extensions
            .get(extension_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("extension {}", extension_id)))?;

        let body = format!(
            "Messages-Waiting: {}\r\nMessage-Account: sip:{}@{}\r\nVoice-Message: {}/{} (0/0)\r\n",
            if new_count > 0 { "yes" } else { "no" },
            extension.sip_username,
            self.domain,
            new_count,
            old_count
        );

        for binding in contacts {
            let destination = match format!("{}:{}", binding.source_ip, binding.source_port).parse()
            {
                Ok(destination) => destination,
                Err(_) => continue,
            };
            let transport = match binding.transport {
                crate::domain::registration::BindingTransport::Udp => TransportProtocol::Udp,
                crate::domain::registration::BindingTransport::Tcp => TransportProtocol::Tcp,
                crate::domain::registration::BindingTransport::Tls => TransportProtocol::Tls,
            };
            let notify = RequestBuilder::new(SipMethod::Notify, &binding.contact)
                .via(&self.local_addr, transport.as_str(), &generate_branch())
                .from(
                    None,
                    &format!("sip:{}@{}", extension.sip_username, self.domain),
                    &generate_tag(),
                )
                .to(&binding.contact, None)
                .call_id(&generate_call_id(&self.domain))
                .cseq(1, SipMethod::Notify)
                .max_forwards(70)
                .header(Header::Event("message-summary".into()))
                .header(Header::Other(
                    "Subscription-State".into(),
                    "active".into(),
                ))
                .body(
                    "application/simple-message-summary",
                    body.as_bytes().to_vec(),
                )
                .build()
                .map_err(|e| DomainError::Internal(e.to_string()))?;
            if let Err(e) = self.sender.send_request(&notify, destination, transport).await {
                warn!(extension_id, "MWI NOTIFY failed: {}", e);
            }
        }
        info!(extension_id, new_count, old_count, "MWI sent");
        Ok(())
    }

    async fn hangup<'a>(
        &'a self,
        ctx: &'a CallContext,
        cause: &'a str,
        reason: Option<&'a str>,
    ) -> Result<()> {
        let leg = match self.registry.get(&ctx.call_id).await {
            Some(leg) => leg,
            None => return Ok(()),
        };
        if leg.is_ended() {
            return Ok(());
        }
        info!(call_id = %ctx.call_id, cause, ?reason, "hanging call up");
        if leg.is_answered() {
            if !leg.caller_hung_up() {
                let _ = leg.send_bye_to_caller(&self.sender, &self.local_addr).await;
            }
            if !leg.callee_hung_up() {
                let _ = leg.send_bye_to_callee(&self.sender, &self.local_addr).await;
            }
        } else {
            let code = match cause {
                "busy" => 486,
                "not_found" => 404,
                "resource_exhausted" => 503,
                "internal_error" => 500,
                _ => 480,
            };
            let _ = leg.send_final(&self.sender, code, None).await;
        }
        leg.mark_ended();
        Ok(())
    }

    async fn blind_transfer(&self, ctx: &CallContext, destination: &str) -> Result<()> {
        let leg = self.leg_for(ctx).await?;
        let target = if destination.starts_with("sip:") {
            destination.to_string()
        } else {
            format!("sip:{}@{}", destination, self.domain)
        };
        info!(call_id = %ctx.call_id, %target, "blind transfer");

        if leg.is_answered() {
            // in-dialog REFER; the caller's UA takes it from here
            let refer = RequestBuilder::new(
                SipMethod::Refer,
                &leg.invite.contact_uri().unwrap_or_else(|| target.clone()),
            )
            .via(&self.local_addr, leg.protocol.as_str(), &generate_branch())
            .call_id(&ctx.call_id)
            .cseq(100, SipMethod::Refer)
            .max_forwards(70)
            .header(Header::Other("Refer-To".into(), format!("<{}>", target)))
            .header(Header::From(
                format!("<sip:pbx@{}>;tag={}", self.domain, leg.to_tag).into(),
            ))
            .header(Header::To(
                leg.invite.from_value().unwrap_or_default().into(),
            ))
            .build()
            .map_err(|e| DomainError::Internal(e.to_string()))?;
            self.sender
                .send_request(&refer, leg.source, leg.protocol)
                .await
                .map_err(|e| DomainError::Transient(e.to_string()))?;
        } else {
            // unanswered: redirect
            let response = super::builder::ResponseBuilder::new(302)
                .to_tag(&leg.to_tag)
                .header(Header::Contact(format!("<{}>", target).into()))
                .build_for_request(&leg.invite)
                .map_err(|e| DomainError::Internal(e.to_string()))?;
            self.sender
                .send_response(&response, leg.source, leg.protocol)
                .await
                .map_err(|e| DomainError::Transient(e.to_string()))?;
        }
        leg.mark_ended();
        Ok(())
    }

    async fn join_conference(&self, ctx: &CallContext, bridge_id: i64) -> Result<()> {
        let leg = self.leg_for(ctx).await?;
        let bridge = self
            .conference_repo
            .get(bridge_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("conference {}", bridge_id)))?;
        leg.answer(&self.sender)
            .await
            .map_err(|e| DomainError::Transient(e.to_string()))?;

        // PIN gate
        if bridge.requires_pin() {
            let expected = bridge.pin.clone().unwrap_or_default();
            let mut granted = false;
            for _ in 0..3 {
                let entered = self
                    .play_and_collect(
                        ctx,
                        Some(PromptRef::File(self.prompts.system_path(PROMPT_ENTER_PIN))),
                        10,
                        5,
                        expected.len().max(4),
                        Some('#'),
                    )
                    .await?;
                if entered.digits == expected {
                    granted = true;
                    break;
                }
                let invalid = self.prompts.system_path(PROMPT_INVALID_OPTION);
                let _ = self.play_resolved(ctx, &leg, &invalid).await;
                if ctx.is_cancelled() {
                    return Ok(());
                }
            }
            if !granted {
                info!(call_id = %ctx.call_id, bridge_id, "conference PIN rejected");
                return Ok(());
            }
        }

        let room = self.conferences.room(&bridge).await;
        let participant_id = Uuid::new_v4();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);

        if let Err(DomainError::ResourceExhausted(_)) =
            room.join(participant_id, G711Codec::Ulaw, out_tx)
        {
            let full = self.prompts.system_path(PROMPT_CONFERENCE_FULL);
            let _ = self.play_resolved(ctx, &leg, &full).await;
            metrics::counter!("pbx_resource_exhausted_total").increment(1);
            return Ok(());
        }

        if room.announce_joins {
            let join_tone = self.prompts.system_path(PROMPT_CONFERENCE_JOIN);
            let _ = self.play_resolved(ctx, &leg, &join_tone).await;
        }

        // caller audio into the mixer
        let (tap_tx, mut tap_rx) = mpsc::channel(64);
        leg.session.set_local_tap(tap_tx);
        let room_in = room.clone();
        let inbound = tokio::spawn(async move {
            while let Some(packet) = tap_rx.recv().await {
                if packet.payload_type == G711Codec::Ulaw.payload_type()
                    || packet.payload_type == G711Codec::Alaw.payload_type()
                {
                    room_in.push_audio(participant_id, &packet.payload);
                }
            }
        });

        // mixed audio back to the caller
        let session = leg.session.clone();
        let outbound = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                session
                    .send_audio(LegSide::Caller, G711Codec::Ulaw.payload_type(), frame.into())
                    .await;
            }
        });

        info!(call_id = %ctx.call_id, bridge_id, "joined conference");
        leg.wait_ended().await;

        room.leave(participant_id);
        leg.session.clear_local_tap();
        inbound.abort();
        outbound.abort();
        self.conferences.reap(bridge_id).await;
        info!(call_id = %ctx.call_id, bridge_id, "left conference");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_code_mapping() {
        assert_eq!(PbxActions::map_failure(486), RingOutcome::Busy);
        assert_eq!(PbxActions::map_failure(603), RingOutcome::Busy);
        assert_eq!(PbxActions::map_failure(480), RingOutcome::NoAnswer);
        assert_eq!(PbxActions::map_failure(408), RingOutcome::NoAnswer);
        assert_eq!(PbxActions::map_failure(503), RingOutcome::NoAnswer);
    }

    #[test]
    fn test_prompt_constants_exist() {
        // the conference and confirmation paths rely on these bundled names
        for name in [
            PROMPT_BEEP,
            PROMPT_CONFERENCE_FULL,
            PROMPT_CONFERENCE_JOIN,
            PROMPT_CONFIRM_CALL,
            PROMPT_ENTER_PIN,
            PROMPT_INVALID_OPTION,
        ] {
            assert!(name.ends_with(".wav"));
        }
    }
}
