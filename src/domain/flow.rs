//! Call flow - a named, versioned directed graph routing inbound calls

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Node types a flow can contain. Deserialization is closed: a graph with a
/// type outside this set fails to load rather than being silently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    InboundNumber,
    Extension,
    RingGroup,
    IvrMenu,
    TimeSwitch,
    Voicemail,
    Conference,
    FollowMe,
    PlayPrompt,
    Hangup,
    TransferBlind,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::InboundNumber => "inbound_number",
            NodeType::Extension => "extension",
            NodeType::RingGroup => "ring_group",
            NodeType::IvrMenu => "ivr_menu",
            NodeType::TimeSwitch => "time_switch",
            NodeType::Voicemail => "voicemail",
            NodeType::Conference => "conference",
            NodeType::FollowMe => "follow_me",
            NodeType::PlayPrompt => "play_prompt",
            NodeType::Hangup => "hangup",
            NodeType::TransferBlind => "transfer_blind",
        }
    }

    /// Terminal nodes end the traversal; they never take an output edge.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeType::Hangup | NodeType::TransferBlind)
    }

    /// Kind of entity the node's `entity_id` refers to, if any.
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            NodeType::InboundNumber => Some(EntityKind::InboundNumber),
            NodeType::Extension | NodeType::FollowMe => Some(EntityKind::Extension),
            NodeType::RingGroup => Some(EntityKind::RingGroup),
            NodeType::IvrMenu => Some(EntityKind::IvrMenu),
            NodeType::TimeSwitch => Some(EntityKind::TimeSwitch),
            NodeType::Voicemail => Some(EntityKind::VoicemailBox),
            NodeType::Conference => Some(EntityKind::ConferenceBridge),
            NodeType::PlayPrompt => Some(EntityKind::Prompt),
            NodeType::Hangup | NodeType::TransferBlind => None,
        }
    }
}

/// Entity kinds a node may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    InboundNumber,
    Extension,
    RingGroup,
    IvrMenu,
    TimeSwitch,
    VoicemailBox,
    ConferenceBridge,
    Prompt,
}

/// Node payload. Unknown fields (admin-UI layout coordinates and the like)
/// are ignored on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub label: String,
    /// Referenced entity id, interpreted per the node type
    #[serde(default)]
    pub entity_id: Option<i64>,
    /// Type-specific parameters
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl NodeData {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u32(&self, key: &str) -> Option<u32> {
        self.params.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
    }
}

/// A node in the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub data: NodeData,
}

/// A directed edge; `label` names the output port of the source node
/// ("next", "answered", "timeout", a DTMF digit, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub label: String,
}

/// The graph itself, as persisted in `flow_data`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraph {
    /// Entry node id
    pub entry: String,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| crate::DomainError::Validation(format!("invalid flow graph: {}", e)))
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::DomainError::Internal(format!("flow serialize: {}", e)))
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The edge leaving `source` on output port `label`.
    pub fn edge_from(&self, source: &str, label: &str) -> Option<&FlowEdge> {
        self.edges
            .iter()
            .find(|e| e.source == source && e.label == label)
    }

    /// Structural validation. Entity resolution is a separate async pass.
    pub fn validate_structure(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.nodes.is_empty() {
            report.errors.push("flow has no nodes".to_string());
            return report;
        }

        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if ids.len() != self.nodes.len() {
            report.errors.push("duplicate node ids".to_string());
        }

        if !ids.contains(self.entry.as_str()) {
            report
                .errors
                .push(format!("entry node '{}' does not exist", self.entry));
        }

        let mut has_outgoing: HashSet<&str> = HashSet::new();
        let mut has_incoming: HashSet<&str> = HashSet::new();
        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) {
                report
                    .errors
                    .push(format!("edge '{}' source '{}' does not exist", edge.id, edge.source));
            }
            if !ids.contains(edge.target.as_str()) {
                report
                    .errors
                    .push(format!("edge '{}' target '{}' does not exist", edge.id, edge.target));
            }
            has_outgoing.insert(edge.source.as_str());
            has_incoming.insert(edge.target.as_str());
        }

        for node in &self.nodes {
            let outgoing_exempt =
                node.node_type.is_terminal() || node.node_type == NodeType::Voicemail;
            if !outgoing_exempt && !has_outgoing.contains(node.id.as_str()) {
                report
                    .warnings
                    .push(format!("node '{}' has no outgoing edges", node.id));
            }
            let incoming_exempt =
                node.id == self.entry || node.node_type == NodeType::InboundNumber;
            if !incoming_exempt && !has_incoming.contains(node.id.as_str()) {
                report
                    .warnings
                    .push(format!("node '{}' is unreachable (no incoming edges)", node.id));
            }
            if node.node_type.entity_kind().is_some()
                && node.node_type != NodeType::PlayPrompt
                && node.data.entity_id.is_none()
            {
                report
                    .errors
                    .push(format!("node '{}' is missing its entity reference", node.id));
            }
            // play_prompt may carry inline TTS text instead of a prompt id
            if node.node_type == NodeType::PlayPrompt
                && node.data.entity_id.is_none()
                && node.data.param_str("tts_text").is_none()
            {
                report
                    .errors
                    .push(format!("node '{}' needs a prompt id or tts_text", node.id));
            }
        }

        report
    }

    /// Run entity resolution through the provided resolver; failures are
    /// errors that make the flow undispatchable.
    pub async fn validate_entities(&self, resolver: &dyn EntityResolver) -> ValidationReport {
        let mut report = ValidationReport::default();
        for node in &self.nodes {
            if let (Some(kind), Some(entity_id)) = (node.node_type.entity_kind(), node.data.entity_id)
            {
                match resolver.exists(kind, entity_id).await {
                    Ok(true) => {}
                    Ok(false) => report.errors.push(format!(
                        "node '{}' references missing {:?} {}",
                        node.id, kind, entity_id
                    )),
                    Err(e) => report
                        .errors
                        .push(format!("node '{}' entity lookup failed: {}", node.id, e)),
                }
            }
        }
        report
    }
}

/// Looks up whether a referenced entity exists
#[async_trait::async_trait]
pub trait EntityResolver: Send + Sync {
    async fn exists(&self, kind: EntityKind, id: i64) -> crate::Result<bool>;
}

/// Outcome of validation
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_dispatchable(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Flow header row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFlow {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stored version of a flow's graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowVersion {
    pub id: i64,
    pub flow_id: i64,
    pub version: i64,
    /// Serialized FlowGraph
    pub flow_data: String,
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

impl FlowVersion {
    pub fn graph(&self) -> crate::Result<FlowGraph> {
        FlowGraph::from_json(&self.flow_data)
    }
}

/// Repository for flows and their versions
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait FlowRepository: Send + Sync {
    async fn create_flow(&self, name: &str) -> crate::Result<CallFlow>;

    async fn delete_flow(&self, id: i64) -> crate::Result<()>;

    async fn get_flow(&self, id: i64) -> crate::Result<Option<CallFlow>>;

    async fn list_flows(&self) -> crate::Result<Vec<CallFlow>>;

    /// Append a new version with the next version number.
    async fn save_version(&self, flow_id: i64, flow_data: &str) -> crate::Result<FlowVersion>;

    /// Mark one version published and unmark every other version of the
    /// flow, in a single transaction.
    async fn publish_version(&self, flow_id: i64, version_id: i64) -> crate::Result<()>;

    /// The published snapshot used for dispatch.
    async fn get_published(&self, flow_id: i64) -> crate::Result<Option<FlowVersion>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_graph() -> FlowGraph {
        FlowGraph::from_json(
            r#"{
                "entry": "n1",
                "nodes": [
                    {"id": "n1", "type": "inbound_number", "data": {"label": "Main", "entity_id": 1}},
                    {"id": "n2", "type": "extension", "data": {"label": "Alice", "entity_id": 101}},
                    {"id": "n3", "type": "hangup", "data": {"label": "Done"}}
                ],
                "edges": [
                    {"id": "e1", "source": "n1", "target": "n2", "label": "next"},
                    {"id": "e2", "source": "n2", "target": "n3", "label": "answered"},
                    {"id": "e3", "source": "n2", "target": "n3", "label": "no_answer"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_clean_graph_validates() {
        let report = simple_graph().validate_structure();
        assert!(report.is_dispatchable(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let result = FlowGraph::from_json(
            r#"{
                "entry": "n1",
                "nodes": [{"id": "n1", "type": "teleport", "data": {}}],
                "edges": []
            }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_layout_fields_ignored() {
        let graph = FlowGraph::from_json(
            r#"{
                "entry": "n1",
                "nodes": [
                    {"id": "n1", "type": "hangup", "data": {"label": "x"},
                     "position": {"x": 120, "y": 40}, "width": 200}
                ],
                "edges": []
            }"#,
        )
        .unwrap();
        assert_eq!(graph.nodes.len(), 1);
    }

    #[test]
    fn test_missing_entry_is_error() {
        let mut graph = simple_graph();
        graph.entry = "nope".to_string();
        let report = graph.validate_structure();
        assert!(!report.is_dispatchable());
    }

    #[test]
    fn test_dangling_edge_is_error() {
        let mut graph = simple_graph();
        graph.edges.push(FlowEdge {
            id: "e9".into(),
            source: "n2".into(),
            target: "ghost".into(),
            label: "busy".into(),
        });
        let report = graph.validate_structure();
        assert!(!report.is_dispatchable());
    }

    #[test]
    fn test_missing_outgoing_is_warning_only() {
        let graph = FlowGraph::from_json(
            r#"{
                "entry": "n1",
                "nodes": [
                    {"id": "n1", "type": "inbound_number", "data": {"entity_id": 1}},
                    {"id": "n2", "type": "extension", "data": {"entity_id": 101}}
                ],
                "edges": [
                    {"id": "e1", "source": "n1", "target": "n2", "label": "next"}
                ]
            }"#,
        )
        .unwrap();
        let report = graph.validate_structure();
        assert!(report.is_dispatchable());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn test_missing_entity_reference_is_error() {
        let graph = FlowGraph::from_json(
            r#"{
                "entry": "n1",
                "nodes": [
                    {"id": "n1", "type": "inbound_number", "data": {"entity_id": 1}},
                    {"id": "n2", "type": "voicemail", "data": {"label": "vm"}}
                ],
                "edges": [
                    {"id": "e1", "source": "n1", "target": "n2", "label": "next"}
                ]
            }"#,
        )
        .unwrap();
        let report = graph.validate_structure();
        assert!(!report.is_dispatchable());
    }

    #[test]
    fn test_edge_lookup() {
        let graph = simple_graph();
        let edge = graph.edge_from("n2", "answered").unwrap();
        assert_eq!(edge.target, "n3");
        assert!(graph.edge_from("n2", "busy").is_none());
    }

    #[test]
    fn test_terminal_types() {
        assert!(NodeType::Hangup.is_terminal());
        assert!(NodeType::TransferBlind.is_terminal());
        assert!(!NodeType::Voicemail.is_terminal());
        assert!(!NodeType::Extension.is_terminal());
    }
}
