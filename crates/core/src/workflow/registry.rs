use crate::error::{EngineError, EngineResult};
use crate::types::{WorkflowDefinition, WorkflowId};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered definitions, by id and version
///
/// Versions of one workflow are kept sorted; the highest is the one executed.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    versions: HashMap<WorkflowId, Vec<Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition; an existing (id, version) pair is rejected
    pub fn insert(
        &mut self,
        workflow: WorkflowDefinition,
    ) -> EngineResult<Arc<WorkflowDefinition>> {
        let versions = self.versions.entry(workflow.id.clone()).or_default();

        let position = match versions.binary_search_by_key(&workflow.version, |w| w.version) {
            Ok(_) => {
                return Err(EngineError::AlreadyRegistered {
                    id: workflow.id.clone(),
                    version: workflow.version,
                })
            }
            Err(position) => position,
        };

        tracing::info!("Registered workflow version: {} v{}", workflow.id, workflow.version);

        let workflow = Arc::new(workflow);
        versions.insert(position, workflow.clone());
        Ok(workflow)
    }

    /// Drop one version, removing the workflow entirely once none remain
    pub fn remove(&mut self, id: &WorkflowId, version: u32) -> Option<Arc<WorkflowDefinition>> {
        let versions = self.versions.get_mut(id)?;
        let position = versions.iter().position(|w| w.version == version)?;
        let removed = versions.remove(position);
        if versions.is_empty() {
            self.versions.remove(id);
        }
        Some(removed)
    }

    /// Get latest version of a workflow
    pub fn latest(&self, id: &WorkflowId) -> Option<Arc<WorkflowDefinition>> {
        self.versions.get(id).and_then(|versions| versions.last().cloned())
    }

    /// Get specific version of a workflow
    pub fn version(&self, id: &WorkflowId, version: u32) -> Option<Arc<WorkflowDefinition>> {
        self.versions
            .get(id)
            .and_then(|versions| versions.iter().find(|w| w.version == version).cloned())
    }

    /// List all versions of a workflow, oldest first
    pub fn versions(&self, id: &WorkflowId) -> Vec<Arc<WorkflowDefinition>> {
        self.versions.get(id).cloned().unwrap_or_default()
    }

    /// Latest version of every workflow, ordered by id
    pub fn list_latest(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut latest: Vec<_> = self
            .versions
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect();
        latest.sort_by(|a, b| a.id.cmp(&b.id));
        latest
    }
}
