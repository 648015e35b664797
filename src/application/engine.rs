//! Call-flow engine - walks a published flow graph for one call

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::actions::{PromptRef, RingOutcome, SipActions};
use crate::application::context::CallContext;
use crate::domain::cdr::Disposition;
use crate::domain::collaborators::EmailSender;
use crate::domain::conference::ConferenceBridgeRepository;
use crate::domain::extension::ExtensionRepository;
use crate::domain::flow::{EntityResolver, FlowGraph, FlowNode, FlowRepository, NodeType};
use crate::domain::ivr_menu::IvrMenuRepository;
use crate::domain::ring_group::RingGroupRepository;
use crate::domain::time_switch::TimeSwitchRepository;
use crate::domain::voicemail::{VoicemailMessage, VoicemailRepository};
use crate::{DomainError, Result};

/// Hard cap on node transitions per call; flow graphs may legally contain
/// back-edges (IVR retry loops), so termination is enforced here.
const MAX_STEPS: u32 = 256;

/// Final result of a traversal
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub disposition: Disposition,
    pub hangup_cause: Option<String>,
}

/// Engine dependencies, injected at startup
pub struct FlowEngineDeps {
    pub actions: Arc<dyn SipActions>,
    pub extensions: Arc<dyn ExtensionRepository>,
    pub ring_groups: Arc<dyn RingGroupRepository>,
    pub ivr_menus: Arc<dyn IvrMenuRepository>,
    pub time_switches: Arc<dyn TimeSwitchRepository>,
    pub voicemail: Arc<dyn VoicemailRepository>,
    pub conferences: Arc<dyn ConferenceBridgeRepository>,
    pub flows: Arc<dyn FlowRepository>,
    pub resolver: Arc<dyn EntityResolver>,
    pub email: Arc<dyn EmailSender>,
    /// Root of the voicemail message tree (voicemail/box_<id>/)
    pub voicemail_dir: PathBuf,
}

/// Graph interpreter
pub struct FlowEngine {
    deps: FlowEngineDeps,
}

impl FlowEngine {
    pub fn new(deps: FlowEngineDeps) -> Self {
        Self { deps }
    }

    /// Load the published snapshot of a flow and check it is dispatchable.
    pub async fn load_published(&self, flow_id: i64) -> Result<FlowGraph> {
        let version = self
            .deps
            .flows
            .get_published(flow_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("no published version of flow {}", flow_id)))?;
        let graph = version.graph()?;

        let mut report = graph.validate_structure();
        report.merge(graph.validate_entities(self.deps.resolver.as_ref()).await);
        for warning in &report.warnings {
            warn!(flow_id, "flow validation: {}", warning);
        }
        if !report.is_dispatchable() {
            return Err(DomainError::Validation(format!(
                "flow {} is not dispatchable: {}",
                flow_id,
                report.errors.join("; ")
            )));
        }
        Ok(graph)
    }

    /// Walk the graph for one call. Appends every visited node to the
    /// context's flow path and returns the call's disposition.
    pub async fn run(&self, ctx: &CallContext, graph: &FlowGraph) -> FlowResult {
        let mut current = graph.entry.clone();
        let mut steps = 0u32;
        let mut last_ring: Option<RingOutcome> = None;

        loop {
            // cancellation before anyone answered aborts the call; after a
            // bridged conversation has ended the walk continues so terminal
            // nodes still land in the flow path
            if ctx.is_cancelled() && !ctx.was_answered() {
                debug!(call_id = %ctx.call_id, "call cancelled, stopping traversal");
                return FlowResult {
                    disposition: Disposition::Cancelled,
                    hangup_cause: Some("cancelled".to_string()),
                };
            }

            steps += 1;
            if steps > MAX_STEPS {
                error!(call_id = %ctx.call_id, "flow exceeded {} transitions", MAX_STEPS);
                return self.fail(ctx, "internal_error").await;
            }

            let node = match graph.node(&current) {
                Some(node) => node,
                None => {
                    error!(call_id = %ctx.call_id, node = %current, "flow node vanished");
                    return self.fail(ctx, "not_found").await;
                }
            };

            ctx.push_flow_node(&node.id);
            debug!(call_id = %ctx.call_id, node = %node.id, node_type = node.node_type.as_str(), "executing node");

            let output = match self.execute_node(ctx, graph, node, &mut last_ring).await {
                Ok(output) => output,
                Err(e) => {
                    error!(call_id = %ctx.call_id, node = %node.id, "node handler failed: {}", e);
                    return self.fail(ctx, e.kind()).await;
                }
            };

            let label = match output {
                Some(label) => label,
                None => break, // terminal node
            };

            match graph.edge_from(&node.id, &label) {
                Some(edge) => current = edge.target.clone(),
                None => {
                    debug!(call_id = %ctx.call_id, node = %node.id, label = %label, "no edge for output, traversal ends");
                    break;
                }
            }
        }

        let disposition = if ctx.was_answered() {
            Disposition::Answered
        } else if ctx.is_cancelled() {
            Disposition::Cancelled
        } else {
            match last_ring {
                Some(RingOutcome::Busy) => Disposition::Busy,
                Some(_) => Disposition::NoAnswer,
                // nothing was rung; the flow serviced the caller itself
                None => Disposition::Answered,
            }
        };
        info!(call_id = %ctx.call_id, disposition = disposition.as_str(), "flow traversal complete");
        FlowResult {
            disposition,
            hangup_cause: None,
        }
    }

    async fn fail(&self, ctx: &CallContext, cause: &str) -> FlowResult {
        if let Err(e) = self.deps.actions.hangup(ctx, cause, None).await {
            warn!(call_id = %ctx.call_id, "hangup after failure also failed: {}", e);
        }
        FlowResult {
            disposition: Disposition::Failed,
            hangup_cause: Some(cause.to_string()),
        }
    }

    /// Execute one node; returns the output-port label, or None for a
    /// terminal node.
    async fn execute_node(
        &self,
        ctx: &CallContext,
        graph: &FlowGraph,
        node: &FlowNode,
        last_ring: &mut Option<RingOutcome>,
    ) -> Result<Option<String>> {
        match node.node_type {
            NodeType::InboundNumber => Ok(Some("next".to_string())),

            NodeType::Extension => {
                let extension_id = self.entity_id(node)?;
                let extension = self
                    .deps
                    .extensions
                    .get(extension_id)
                    .await?
                    .ok_or_else(|| DomainError::NotFound(format!("extension {}", extension_id)))?;
                if extension.do_not_disturb {
                    return Ok(Some("dnd".to_string()));
                }
                let timeout = match node.data.param_u32("timeout") {
                    Some(outer) => extension.effective_ring_timeout(outer),
                    None => extension.ring_timeout_secs,
                };
                let outcome = self
                    .deps
                    .actions
                    .ring_extension(ctx, extension_id, timeout)
                    .await?;
                *last_ring = Some(outcome);
                Ok(Some(outcome.edge_label().to_string()))
            }

            NodeType::RingGroup => {
                let group_id = self.entity_id(node)?;
                let group = self
                    .deps
                    .ring_groups
                    .get(group_id)
                    .await?
                    .ok_or_else(|| DomainError::NotFound(format!("ring group {}", group_id)))?;
                let outcome = self
                    .deps
                    .actions
                    .ring_group(
                        ctx,
                        group.id,
                        &group.extension_ids,
                        group.strategy,
                        group.ring_timeout_secs,
                    )
                    .await?;
                *last_ring = Some(outcome);
                // only answered / no_answer ports exist on this node type
                let label = match outcome {
                    RingOutcome::Answered => "answered",
                    _ => "no_answer",
                };
                Ok(Some(label.to_string()))
            }

            NodeType::FollowMe => {
                let extension_id = self.entity_id(node)?;
                let outcome = self.deps.actions.ring_follow_me(ctx, extension_id).await?;
                *last_ring = Some(outcome);
                let label = match outcome {
                    RingOutcome::Answered => "answered",
                    _ => "no_answer",
                };
                Ok(Some(label.to_string()))
            }

            NodeType::IvrMenu => self.run_ivr_menu(ctx, graph, node).await,

            NodeType::TimeSwitch => {
                let switch_id = self.entity_id(node)?;
                let switch = self
                    .deps
                    .time_switches
                    .get(switch_id)
                    .await?
                    .ok_or_else(|| DomainError::NotFound(format!("time switch {}", switch_id)))?;
                let label = match switch.first_match(chrono::Utc::now()) {
                    Some(rule_id) => format!("match_{}", rule_id),
                    None => "default".to_string(),
                };
                Ok(Some(label))
            }

            NodeType::Voicemail => self.run_voicemail(ctx, node).await,

            NodeType::Conference => {
                let bridge_id = self.entity_id(node)?;
                self.deps
                    .conferences
                    .get(bridge_id)
                    .await?
                    .ok_or_else(|| DomainError::NotFound(format!("conference {}", bridge_id)))?;
                self.deps.actions.join_conference(ctx, bridge_id).await?;
                Ok(Some("ended".to_string()))
            }

            NodeType::PlayPrompt => {
                let prompt = self.prompt_ref(node)?;
                self.deps.actions.play_prompt(ctx, prompt).await?;
                Ok(Some("next".to_string()))
            }

            NodeType::Hangup => {
                let cause = node.data.param_str("cause").unwrap_or("normal_clearing");
                self.deps.actions.hangup(ctx, cause, None).await?;
                Ok(None)
            }

            NodeType::TransferBlind => {
                let destination = node
                    .data
                    .param_str("destination")
                    .ok_or_else(|| {
                        DomainError::Validation(format!("node '{}' has no destination", node.id))
                    })?
                    .to_string();
                self.deps.actions.blind_transfer(ctx, &destination).await?;
                Ok(None)
            }
        }
    }

    async fn run_ivr_menu(
        &self,
        ctx: &CallContext,
        graph: &FlowGraph,
        node: &FlowNode,
    ) -> Result<Option<String>> {
        let menu_id = self.entity_id(node)?;
        let menu = self
            .deps
            .ivr_menus
            .get(menu_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("ivr menu {}", menu_id)))?;
        let retries = node.data.param_u32("retries").unwrap_or(menu.max_retries);
        let greeting = menu.greeting_prompt_id.map(PromptRef::Prompt);

        let mut timed_out_last = false;
        for attempt in 0..=retries {
            if ctx.is_cancelled() {
                return Ok(Some("timeout".to_string()));
            }
            let result = self
                .deps
                .actions
                .play_and_collect(
                    ctx,
                    greeting.clone(),
                    menu.input_timeout_secs,
                    menu.inter_digit_timeout_secs,
                    1,
                    None,
                )
                .await?;

            if result.timed_out && result.digits.is_empty() {
                timed_out_last = true;
                debug!(call_id = %ctx.call_id, attempt, "IVR input timed out");
                continue;
            }
            timed_out_last = false;
            let digit = result.digits;
            // a choice counts only when the menu routes it somewhere
            if crate::domain::ivr_menu::IvrMenu::is_valid_choice(&digit)
                && graph.edge_from(&node.id, &digit).is_some()
            {
                return Ok(Some(digit));
            }
            debug!(call_id = %ctx.call_id, attempt, digit = %digit, "IVR digit not routable");
        }

        Ok(Some(if timed_out_last { "timeout" } else { "invalid" }.to_string()))
    }

    async fn run_voicemail(&self, ctx: &CallContext, node: &FlowNode) -> Result<Option<String>> {
        let box_id = self.entity_id(node)?;
        let mailbox = self
            .deps
            .voicemail
            .get_box(box_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("voicemail box {}", box_id)))?;

        let dir = self.deps.voicemail_dir.join(format!("box_{}", mailbox.id));
        std::fs::create_dir_all(&dir)
            .map_err(|e| DomainError::Internal(format!("voicemail dir: {}", e)))?;
        let file_path = dir.join(format!("{}.wav", chrono::Utc::now().timestamp_millis()));

        let greeting = mailbox.greeting_prompt_id.map(PromptRef::Prompt);
        let recorded = self
            .deps
            .actions
            .record_message(ctx, greeting, mailbox.max_message_secs, &file_path)
            .await?;

        if recorded.duration_secs == 0 {
            let _ = std::fs::remove_file(&recorded.file_path);
            return Ok(Some("skipped".to_string()));
        }

        let message = VoicemailMessage {
            id: 0,
            box_id: mailbox.id,
            caller_id_name: ctx.caller_id_name.clone(),
            caller_id_number: ctx.caller_id_number.clone(),
            file_path: recorded.file_path.to_string_lossy().to_string(),
            duration_secs: recorded.duration_secs,
            listened: false,
            created_at: chrono::Utc::now(),
        };
        self.deps.voicemail.create_message(&message).await?;
        info!(
            call_id = %ctx.call_id,
            box_id = mailbox.id,
            duration = recorded.duration_secs,
            "voicemail recorded"
        );

        if let Some(extension_id) = mailbox.notify_extension_id {
            let counts = self.deps.voicemail.counts_for_box(mailbox.id).await?;
            if let Err(e) = self
                .deps
                .actions
                .send_mwi(extension_id, counts.new, counts.old)
                .await
            {
                warn!(box_id = mailbox.id, "MWI notify failed: {}", e);
            }
        }

        if mailbox.email_notify {
            if let Some(address) = mailbox.email_address.as_deref() {
                if let Err(e) = self
                    .deps
                    .email
                    .send_voicemail_notification(
                        address,
                        &ctx.caller_id_number,
                        recorded.duration_secs,
                        &recorded.file_path,
                    )
                    .await
                {
                    warn!(box_id = mailbox.id, "voicemail email failed: {}", e);
                }
            }
        }

        Ok(Some("recorded".to_string()))
    }

    fn entity_id(&self, node: &FlowNode) -> Result<i64> {
        node.data
            .entity_id
            .ok_or_else(|| DomainError::Validation(format!("node '{}' has no entity", node.id)))
    }

    fn prompt_ref(&self, node: &FlowNode) -> Result<PromptRef> {
        if let Some(id) = node.data.entity_id {
            return Ok(PromptRef::Prompt(id));
        }
        if let Some(text) = node.data.param_str("tts_text") {
            return Ok(PromptRef::Tts(text.to_string()));
        }
        Err(DomainError::Validation(format!(
            "node '{}' has neither prompt nor tts_text",
            node.id
        )))
    }
}
