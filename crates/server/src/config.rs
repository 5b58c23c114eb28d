use crate::executor::LoopbackExecutor;
use anyhow::{Context, Result};
use conduit_core::storage::{ExecutionStore, InMemoryExecutionStore, RedbExecutionStore};
use conduit_core::template::TemplateCatalog;
use conduit_core::workflow::{EngineConfig, WorkflowEngine};
use conduit_core::FunctionRegistry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            index_file: default_index_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub templates: Arc<TemplateCatalog>,
}

impl AppState {
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let store: Arc<dyn ExecutionStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(InMemoryExecutionStore::new()),
            StorageBackend::Redb => Arc::new(
                RedbExecutionStore::new(config.index_path())
                    .context("Failed to create execution store")?,
            ),
        };

        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(LoopbackExecutor),
            FunctionRegistry::with_builtins(),
            store,
            config.engine.clone(),
        ));

        engine
            .restore_definitions()
            .await
            .context("Failed to restore workflow definitions")?;

        Ok(Self {
            engine,
            templates: Arc::new(TemplateCatalog::builtin()),
        })
    }
}
