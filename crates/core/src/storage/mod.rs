pub mod index;
pub mod memory;

pub use index::RedbExecutionStore;
pub use memory::InMemoryExecutionStore;

use crate::types::{ExecutionId, ExecutionRecord, WorkflowDefinition, WorkflowId};
use anyhow::Result;

/// Persistence for execution records and registered definitions
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace a record
    fn save_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Get a record by ID
    fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// List records, most recent first, optionally for one workflow
    fn list_executions(&self, workflow_id: Option<&WorkflowId>) -> Result<Vec<ExecutionRecord>>;

    /// Persist a registered definition
    fn save_definition(&self, workflow: &WorkflowDefinition) -> Result<()>;

    /// All persisted definitions, ordered by id then version
    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>>;
}

pub(crate) fn definition_key(workflow: &WorkflowDefinition) -> String {
    format!("{}@{}", workflow.id, workflow.version)
}

pub(crate) fn sort_executions(records: &mut [ExecutionRecord]) {
    // Most recent first
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
}

pub(crate) fn sort_definitions(definitions: &mut [WorkflowDefinition]) {
    definitions.sort_by(|a, b| a.id.cmp(&b.id).then(a.version.cmp(&b.version)));
}
