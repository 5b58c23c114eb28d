use super::{definition_key, sort_definitions, sort_executions, ExecutionStore};
use crate::types::{ExecutionId, ExecutionRecord, WorkflowDefinition, WorkflowId};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

/// JSON values keyed by string id
type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const EXECUTIONS_TABLE: JsonTable = TableDefinition::new("executions");
const DEFINITIONS_TABLE: JsonTable = TableDefinition::new("definitions");

/// Execution store backed by an embedded redb file
#[derive(Clone)]
pub struct RedbExecutionStore {
    db: Arc<Database>,
}

impl RedbExecutionStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _executions_table = write_txn
                .open_table(EXECUTIONS_TABLE)
                .context("Failed to open executions table")?;
            let _definitions_table = write_txn
                .open_table(DEFINITIONS_TABLE)
                .context("Failed to open definitions table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put(&self, table: JsonTable, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            table.insert(key, value).context("Failed to insert value")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn scan<T: serde::de::DeserializeOwned>(&self, table: JsonTable) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        let mut items = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            items.push(
                serde_json::from_slice(value.value()).context("Failed to deserialize item")?,
            );
        }
        Ok(items)
    }
}

impl ExecutionStore for RedbExecutionStore {
    fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let key = record.execution_id.to_string();
        let value = serde_json::to_vec(record).context("Failed to serialize execution")?;
        self.put(EXECUTIONS_TABLE, &key, &value)
    }

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EXECUTIONS_TABLE)
            .context("Failed to open table")?;

        let key = id.to_string();
        let value = table.get(key.as_str()).context("Failed to get execution")?;

        match value {
            Some(guard) => {
                let record: ExecutionRecord = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize execution")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_executions(&self, workflow_id: Option<&WorkflowId>) -> Result<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self.scan(EXECUTIONS_TABLE)?;
        if let Some(id) = workflow_id {
            records.retain(|r| &r.workflow_id == id);
        }
        sort_executions(&mut records);
        Ok(records)
    }

    fn save_definition(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let value = serde_json::to_vec(workflow).context("Failed to serialize workflow")?;
        self.put(DEFINITIONS_TABLE, &definition_key(workflow), &value)
    }

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut definitions: Vec<WorkflowDefinition> = self.scan(DEFINITIONS_TABLE)?;
        sort_definitions(&mut definitions);
        Ok(definitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionStatus, Node};
    use crate::workflow::builder::WorkflowBuilder;
    use serde_json::json;
    use tempfile::TempDir;

    fn definition() -> WorkflowDefinition {
        WorkflowBuilder::new("lesson", "Lesson")
            .node(Node::task("outline", "llm", "generate").param("style", json!("brief")))
            .build()
    }

    #[test]
    fn test_redb_execution_store() {
        let dir = TempDir::new().unwrap();
        let store = RedbExecutionStore::new(dir.path().join("index.redb")).unwrap();
        let workflow = definition();

        let input = json!({ "topic": "fractions" }).as_object().cloned().unwrap();
        let mut record = ExecutionRecord::new(&workflow, input);
        store.save_execution(&record).unwrap();

        record.status = ExecutionStatus::Completed;
        store.save_execution(&record).unwrap();

        let retrieved = store.get_execution(&record.execution_id).unwrap().unwrap();
        assert_eq!(retrieved, record);

        assert_eq!(store.list_executions(None).unwrap().len(), 1);
        assert_eq!(store.list_executions(Some(&workflow.id)).unwrap().len(), 1);
        assert!(store
            .list_executions(Some(&WorkflowId::new("other")))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn definitions_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("index.redb");
        let workflow = definition();

        {
            let store = RedbExecutionStore::new(path.clone()).unwrap();
            store.save_definition(&workflow).unwrap();
        }

        let reopened = RedbExecutionStore::new(path).unwrap();
        assert_eq!(reopened.list_definitions().unwrap(), vec![workflow]);
    }
}
