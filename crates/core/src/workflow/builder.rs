//! Fluent construction of workflow definitions.
//!
//! ```
//! use conduit_core::workflow::WorkflowBuilder;
//! use conduit_core::types::Node;
//!
//! let workflow = WorkflowBuilder::new("lesson", "Lesson plan")
//!     .node(Node::task("outline", "llm", "outline").input("topic", "topic").then("write"))
//!     .node(Node::task("write", "llm", "write").input("outline", "outline"))
//!     .build();
//!
//! assert_eq!(workflow.start_node_id.as_str(), "outline");
//! ```

use crate::types::{FieldMapping, Node, NodeId, NodeKind, Predicate, WorkflowDefinition, WorkflowId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Builder for [`WorkflowDefinition`] values
///
/// The start node defaults to the first node added.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    id: WorkflowId,
    name: String,
    description: Option<String>,
    version: u32,
    start: Option<NodeId>,
    nodes: BTreeMap<NodeId, Node>,
}

impl WorkflowBuilder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(id),
            name: name.into(),
            description: None,
            version: 1,
            start: None,
            nodes: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn start(mut self, node_id: impl Into<String>) -> Self {
        self.start = Some(NodeId::new(node_id));
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        if self.start.is_none() {
            self.start = Some(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
        self
    }

    /// Assemble the definition; validation happens at registration
    pub fn build(self) -> WorkflowDefinition {
        WorkflowDefinition {
            id: self.id,
            name: self.name,
            description: self.description,
            version: self.version,
            nodes: self.nodes,
            start_node_id: self.start.unwrap_or_else(|| NodeId::new("")),
        }
    }
}

impl Node {
    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = NodeId::new(id);
        Self {
            name: id.to_string(),
            id,
            input_mapping: Vec::new(),
            output_mapping: Vec::new(),
            retry_limit: 0,
            on_error: None,
            next: None,
            timeout_ms: None,
            kind,
        }
    }

    pub fn task(
        id: impl Into<String>,
        executor_id: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            NodeKind::Task {
                target_executor_id: executor_id.into(),
                task_type: task_type.into(),
                static_parameters: Map::new(),
            },
        )
    }

    pub fn transform(id: impl Into<String>, function: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Transform {
                function: function.into(),
            },
        )
    }

    pub fn condition(id: impl Into<String>, predicate: Predicate) -> Self {
        Self::with_kind(
            id,
            NodeKind::Condition {
                predicate,
                branches: BTreeMap::new(),
            },
        )
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Map a context key into a step parameter
    pub fn input(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.input_mapping.push(FieldMapping::new(from, to));
        self
    }

    pub fn optional_input(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.input_mapping.push(FieldMapping::optional(from, to));
        self
    }

    /// Map a result key into the context
    pub fn output(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.output_mapping.push(FieldMapping::new(from, to));
        self
    }

    pub fn retries(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn on_error(mut self, fallback: impl Into<String>) -> Self {
        self.on_error = Some(NodeId::new(fallback));
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(NodeId::new(next));
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Add a branch; ignored on non-condition nodes
    pub fn branch(mut self, label: impl Into<String>, target: impl Into<String>) -> Self {
        if let NodeKind::Condition { branches, .. } = &mut self.kind {
            branches.insert(label.into(), NodeId::new(target));
        }
        self
    }

    /// Set a static parameter; ignored on non-task nodes
    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        if let NodeKind::Task {
            static_parameters, ..
        } = &mut self.kind
        {
            static_parameters.insert(key.into(), value);
        }
        self
    }
}

impl Predicate {
    pub fn function(name: impl Into<String>) -> Self {
        Predicate::Function { name: name.into() }
    }

    /// Expression predicate yielding the labels `"true"` / `"false"`
    pub fn expression(expression: impl Into<String>) -> Self {
        Predicate::Expression {
            expression: expression.into(),
            when_true: "true".to_string(),
            when_false: "false".to_string(),
        }
    }

    /// Override the labels of an expression predicate
    pub fn labels(self, when_true: impl Into<String>, when_false: impl Into<String>) -> Self {
        match self {
            Predicate::Expression { expression, .. } => Predicate::Expression {
                expression,
                when_true: when_true.into(),
                when_false: when_false.into(),
            },
            other => other,
        }
    }
}
