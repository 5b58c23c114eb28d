//! Registration-time well-formedness check for workflow definitions.
//!
//! Rules enforced:
//! 1. The definition has nodes and every node is stored under its own id.
//! 2. The start node and every `next` / `on_error` / branch target exist.
//! 3. Every node is reachable from the start node (fallback edges included).
//! 4. Each node kind carries what it needs to run: an executor for tasks, a
//!    registered function for transforms, branches and a resolvable predicate
//!    for conditions.
//!
//! All violations are collected rather than stopping at the first one.

use crate::error::ValidationError;
use crate::functions::FunctionRegistry;
use crate::types::{EdgeKind, NodeId, NodeKind, Predicate, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

/// Validate a definition against the registered functions.
pub fn validate(
    workflow: &WorkflowDefinition,
    functions: &FunctionRegistry,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if workflow.nodes.is_empty() {
        return Err(vec![ValidationError::Empty]);
    }

    for (key, node) in &workflow.nodes {
        if key != &node.id {
            errors.push(ValidationError::KeyMismatch {
                key: key.clone(),
                id: node.id.clone(),
            });
        }
    }

    if !workflow.nodes.contains_key(&workflow.start_node_id) {
        errors.push(ValidationError::MissingStart(workflow.start_node_id.clone()));
    }

    for (key, node) in &workflow.nodes {
        for (edge, target) in node.edges() {
            if !workflow.nodes.contains_key(target) {
                errors.push(ValidationError::UnknownTarget {
                    node: key.clone(),
                    edge,
                    target: target.clone(),
                });
            }
        }

        check_kind(key, node, functions, &mut errors);
    }

    if workflow.nodes.contains_key(&workflow.start_node_id) {
        let (graph, indices) = build_graph(workflow, true);
        let start = indices[&workflow.start_node_id];

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&graph, start);
        while let Some(idx) = dfs.next(&graph) {
            reachable.insert(idx);
        }

        for (id, idx) in &indices {
            if !reachable.contains(idx) {
                errors.push(ValidationError::Unreachable(id.clone()));
            }
        }

        let (forward, _) = build_graph(workflow, false);
        if petgraph::algo::is_cyclic_directed(&forward) {
            tracing::warn!(
                "Workflow {} v{} has a cycle over next/branch edges; relying on the visit bound",
                workflow.id,
                workflow.version
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_kind(
    key: &NodeId,
    node: &crate::types::Node,
    functions: &FunctionRegistry,
    errors: &mut Vec<ValidationError>,
) {
    match &node.kind {
        NodeKind::Task {
            target_executor_id, ..
        } => {
            if target_executor_id.trim().is_empty() {
                errors.push(ValidationError::MissingExecutor(key.clone()));
            }
        }
        NodeKind::Transform { function } => {
            if !functions.has_transform(function) {
                errors.push(ValidationError::UnknownFunction {
                    node: key.clone(),
                    function: function.clone(),
                });
            }
        }
        NodeKind::Condition {
            predicate,
            branches,
        } => {
            if branches.is_empty() {
                errors.push(ValidationError::NoBranches(key.clone()));
            }
            if node.next.is_some() {
                errors.push(ValidationError::ConditionWithNext(key.clone()));
            }
            match predicate {
                Predicate::Function { name } => {
                    if !functions.has_predicate(name) {
                        errors.push(ValidationError::UnknownPredicate {
                            node: key.clone(),
                            predicate: name.clone(),
                        });
                    }
                }
                Predicate::Expression { expression, .. } => {
                    if expression.trim().is_empty() {
                        errors.push(ValidationError::EmptyExpression(key.clone()));
                    }
                }
            }
        }
    }
}

/// Graph over known nodes; edges to unknown targets are left out.
fn build_graph(
    workflow: &WorkflowDefinition,
    include_fallback: bool,
) -> (DiGraph<NodeId, EdgeKind>, HashMap<NodeId, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();

    for id in workflow.nodes.keys() {
        let idx = graph.add_node(id.clone());
        indices.insert(id.clone(), idx);
    }

    for (id, node) in &workflow.nodes {
        for (edge, target) in node.edges() {
            if edge == EdgeKind::OnError && !include_fallback {
                continue;
            }
            if let Some(to) = indices.get(target) {
                graph.add_edge(indices[id], *to, edge);
            }
        }
    }

    (graph, indices)
}
