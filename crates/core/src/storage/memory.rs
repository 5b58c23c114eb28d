use super::{definition_key, sort_definitions, sort_executions, ExecutionStore};
use crate::types::{ExecutionId, ExecutionRecord, WorkflowDefinition, WorkflowId};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// Process-local store, the default when no index file is configured
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.executions
            .write()
            .map_err(|_| anyhow!("execution store lock poisoned"))?
            .insert(record.execution_id, record.clone());
        Ok(())
    }

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        let executions = self
            .executions
            .read()
            .map_err(|_| anyhow!("execution store lock poisoned"))?;
        Ok(executions.get(id).cloned())
    }

    fn list_executions(&self, workflow_id: Option<&WorkflowId>) -> Result<Vec<ExecutionRecord>> {
        let executions = self
            .executions
            .read()
            .map_err(|_| anyhow!("execution store lock poisoned"))?;

        let mut records: Vec<ExecutionRecord> = executions
            .values()
            .filter(|r| workflow_id.map_or(true, |id| &r.workflow_id == id))
            .cloned()
            .collect();
        sort_executions(&mut records);
        Ok(records)
    }

    fn save_definition(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.definitions
            .write()
            .map_err(|_| anyhow!("definition store lock poisoned"))?
            .insert(definition_key(workflow), workflow.clone());
        Ok(())
    }

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let definitions = self
            .definitions
            .read()
            .map_err(|_| anyhow!("definition store lock poisoned"))?;

        let mut all: Vec<WorkflowDefinition> = definitions.values().cloned().collect();
        sort_definitions(&mut all);
        Ok(all)
    }
}
