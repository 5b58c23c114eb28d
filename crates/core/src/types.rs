use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Accumulated key-value store threaded through one execution
pub type Context = Map<String, Value>;

/// Unique identifier for a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a workflow definition (shared by all its versions)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a node, unique within its definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_version() -> u32 {
    1
}

/// Immutable graph of named steps and their transition targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: BTreeMap<NodeId, Node>,
    pub start_node_id: NodeId,
}

impl WorkflowDefinition {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// One step of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub input_mapping: Vec<FieldMapping>,
    #[serde(default)]
    pub output_mapping: Vec<FieldMapping>,
    #[serde(default)]
    pub retry_limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NodeId>,
    /// Upper bound for a single attempt, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    /// Outgoing edges of this node, in declaration order
    pub fn edges(&self) -> Vec<(EdgeKind, &NodeId)> {
        let mut edges = Vec::new();
        if let Some(next) = &self.next {
            edges.push((EdgeKind::Next, next));
        }
        if let NodeKind::Condition { branches, .. } = &self.kind {
            for (label, target) in branches {
                edges.push((EdgeKind::Branch(label.clone()), target));
            }
        }
        if let Some(fallback) = &self.on_error {
            edges.push((EdgeKind::OnError, fallback));
        }
        edges
    }
}

/// The closed set of step types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Delegate to the injected task executor
    Task {
        target_executor_id: String,
        task_type: String,
        #[serde(default)]
        static_parameters: Map<String, Value>,
    },
    /// Apply a registered pure function
    Transform { function: String },
    /// Evaluate a predicate and follow the matching branch
    Condition {
        predicate: Predicate,
        branches: BTreeMap<String, NodeId>,
    },
}

fn default_true_label() -> String {
    "true".to_string()
}

fn default_false_label() -> String {
    "false".to_string()
}

/// How a condition node picks its branch label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Registered predicate function returning a label
    Function { name: String },
    /// Comparison over the step parameters (`score >= 50`, `flag`, ...)
    Expression {
        expression: String,
        #[serde(default = "default_true_label")]
        when_true: String,
        #[serde(default = "default_false_label")]
        when_false: String,
    },
}

/// Kind of a transition edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Next,
    OnError,
    Branch(String),
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Next => write!(f, "next"),
            EdgeKind::OnError => write!(f, "on_error"),
            EdgeKind::Branch(label) => write!(f, "branch '{}'", label),
        }
    }
}

fn default_required() -> bool {
    true
}

/// One `from -> to` pair of a node's input or output mapping.
///
/// Both sides accept dotted paths (`lesson.outline.title`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub from: String,
    pub to: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl FieldMapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            required: true,
        }
    }

    pub fn optional(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::new(from, to)
        }
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// Final outcome of one node visit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    FailedFatal,
    FailedExhausted,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded)
    }
}

/// Classification of a step failure, as recorded in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    MissingContextKey,
    MissingResultKey,
    UnknownBranch,
    ConfigError,
    TaskTransient,
    TaskFatal,
    Timeout,
    CycleDetected,
    Cancelled,
}

/// Terminal error of a node visit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub class: ErrorClass,
    pub message: String,
}

/// A single dispatch of a node to its step executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// History entry for one visit of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHistoryEntry {
    pub node_id: NodeId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    pub retries_used: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

/// Mutable per-run state; an immutable audit object once terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub status: ExecutionStatus,
    pub context: Context,
    pub current_node_id: Option<NodeId>,
    pub node_history: Vec<NodeHistoryEntry>,
    pub started_at: DateTime<Utc>,
    pub total_duration_ms: u64,
}

impl ExecutionRecord {
    /// Seed a pending record positioned at the definition's start node
    pub fn new(workflow: &WorkflowDefinition, input: Context) -> Self {
        Self {
            execution_id: ExecutionId::new(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            status: ExecutionStatus::Pending,
            context: input,
            current_node_id: Some(workflow.start_node_id.clone()),
            node_history: Vec::new(),
            started_at: Utc::now(),
            total_duration_ms: 0,
        }
    }

    pub fn last_entry(&self) -> Option<&NodeHistoryEntry> {
        self.node_history.last()
    }

    /// The error that ended a failed execution
    pub fn failure(&self) -> Option<&StepFailure> {
        if self.status != ExecutionStatus::Failed {
            return None;
        }
        self.last_entry().and_then(|entry| entry.error.as_ref())
    }

    /// Node ids in traversal order
    pub fn path(&self) -> Vec<&str> {
        self.node_history.iter().map(|e| e.node_id.as_str()).collect()
    }

    pub fn visits(&self, node_id: &str) -> usize {
        self.node_history
            .iter()
            .filter(|e| e.node_id.as_str() == node_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_kind_round_trips_with_flattened_tag() {
        let raw = json!({
            "id": "check",
            "name": "Check score",
            "type": "condition",
            "predicate": { "kind": "expression", "expression": "score >= 50" },
            "branches": { "pass": "publish", "fail": "remediate" }
        });

        let node: Node = serde_json::from_value(raw).unwrap();
        assert_eq!(node.retry_limit, 0);
        assert!(node.next.is_none());
        match &node.kind {
            NodeKind::Condition { predicate, branches } => {
                assert_eq!(branches.len(), 2);
                match predicate {
                    Predicate::Expression { when_true, when_false, .. } => {
                        assert_eq!(when_true, "true");
                        assert_eq!(when_false, "false");
                    }
                    other => panic!("unexpected predicate {:?}", other),
                }
            }
            other => panic!("unexpected kind {:?}", other),
        }

        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["type"], "condition");
        assert_eq!(back["branches"]["fail"], "remediate");
    }

    #[test]
    fn field_mapping_is_required_by_default() {
        let mapping: FieldMapping =
            serde_json::from_value(json!({ "from": "a.b", "to": "c" })).unwrap();
        assert!(mapping.required);
        assert!(!FieldMapping::optional("x", "y").required);
    }

    #[test]
    fn edges_list_next_branches_and_fallback() {
        let node: Node = serde_json::from_value(json!({
            "id": "gate",
            "name": "Gate",
            "type": "condition",
            "predicate": { "kind": "function", "name": "route" },
            "branches": { "a": "left", "b": "right" },
            "on_error": "recover"
        }))
        .unwrap();

        let edges: Vec<String> = node
            .edges()
            .into_iter()
            .map(|(kind, target)| format!("{}->{}", kind, target))
            .collect();
        assert_eq!(
            edges,
            vec!["branch 'a'->left", "branch 'b'->right", "on_error->recover"]
        );
    }
}
