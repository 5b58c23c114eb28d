//! Error taxonomy for registration, step execution and the engine surface.

use crate::types::{EdgeKind, ErrorClass, ExecutionId, NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural problem found while registering a definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workflow declares no nodes")]
    Empty,

    #[error("node stored under key '{key}' declares id '{id}'")]
    KeyMismatch { key: NodeId, id: NodeId },

    #[error("start node '{0}' does not exist")]
    MissingStart(NodeId),

    #[error("node '{node}' references unknown {edge} target '{target}'")]
    UnknownTarget {
        node: NodeId,
        edge: EdgeKind,
        target: NodeId,
    },

    #[error("node '{0}' is not reachable from the start node")]
    Unreachable(NodeId),

    #[error("task node '{0}' declares no target executor")]
    MissingExecutor(NodeId),

    #[error("transform node '{node}' references unknown function '{function}'")]
    UnknownFunction { node: NodeId, function: String },

    #[error("condition node '{0}' declares no branches")]
    NoBranches(NodeId),

    #[error("condition node '{0}' must not declare `next`")]
    ConditionWithNext(NodeId),

    #[error("condition node '{node}' references unknown predicate '{predicate}'")]
    UnknownPredicate { node: NodeId, predicate: String },

    #[error("condition node '{0}' has an empty expression")]
    EmptyExpression(NodeId),
}

/// Whether a task failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    Transient,
    Fatal,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskErrorKind::Transient => write!(f, "transient"),
            TaskErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure reported by a task executor, classified by the executor itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} task error: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TaskErrorKind::Transient
    }
}

/// Failure of a single step.
///
/// Only transient task errors and attempt timeouts are retried; everything
/// else is a definition bug or a safety stop and ends the retry loop at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("missing context key '{0}'")]
    MissingContextKey(String),

    #[error("step result has no key '{0}'")]
    MissingResultKey(String),

    #[error("no branch declared for label '{0}'")]
    UnknownBranch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("attempt timed out after {0}ms")]
    Timeout(u64),

    #[error("visit bound of {bound} exceeded at node '{node}'")]
    CycleDetected { node: NodeId, bound: usize },

    #[error("execution cancelled before dispatch")]
    Cancelled,
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        match self {
            StepError::Task(err) => err.is_transient(),
            StepError::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::MissingContextKey(_) => ErrorClass::MissingContextKey,
            StepError::MissingResultKey(_) => ErrorClass::MissingResultKey,
            StepError::UnknownBranch(_) => ErrorClass::UnknownBranch,
            StepError::Config(_) => ErrorClass::ConfigError,
            StepError::Task(err) if err.is_transient() => ErrorClass::TaskTransient,
            StepError::Task(_) => ErrorClass::TaskFatal,
            StepError::Timeout(_) => ErrorClass::Timeout,
            StepError::CycleDetected { .. } => ErrorClass::CycleDetected,
            StepError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),

    #[error("workflow {id} has no version {version}")]
    VersionNotFound { id: WorkflowId, version: u32 },

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("workflow {id} v{version} is already registered")]
    AlreadyRegistered { id: WorkflowId, version: u32 },

    #[error("workflow failed validation: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(StepError::Task(TaskError::transient("busy")).is_transient());
        assert!(StepError::Timeout(50).is_transient());
        assert!(!StepError::Task(TaskError::fatal("bad request")).is_transient());
        assert!(!StepError::MissingContextKey("topic".into()).is_transient());
        assert!(!StepError::UnknownBranch("maybe".into()).is_transient());
        assert!(!StepError::Config("no such function".into()).is_transient());
    }

    #[test]
    fn task_errors_keep_their_class() {
        assert_eq!(
            StepError::from(TaskError::transient("x")).class(),
            ErrorClass::TaskTransient
        );
        assert_eq!(
            StepError::from(TaskError::fatal("x")).class(),
            ErrorClass::TaskFatal
        );
    }

    #[test]
    fn validation_errors_are_joined_in_message() {
        let err = EngineError::Validation(vec![
            ValidationError::Empty,
            ValidationError::MissingStart(NodeId::new("a")),
        ]);
        assert_eq!(
            err.to_string(),
            "workflow failed validation: workflow declares no nodes; start node 'a' does not exist"
        );
    }
}
