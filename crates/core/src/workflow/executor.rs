use super::mapper::{extract_input, merge_output};
use super::registry::WorkflowRegistry;
use super::step_executor::{StepExecutor, StepOutput, TaskExecutor};
use super::validator::validate;
use crate::error::{EngineError, EngineResult, StepError};
use crate::functions::FunctionRegistry;
use crate::stats::{self, StatsOverview, WorkflowStats};
use crate::storage::{ExecutionStore, InMemoryExecutionStore};
use crate::types::{
    AttemptRecord, Context, ExecutionId, ExecutionRecord, ExecutionStatus, Node, NodeHistoryEntry,
    NodeId, NodeKind, StepFailure, StepOutcome, WorkflowDefinition, WorkflowId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Engine tuning, exposed under `[engine]` in the server config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Visits allowed per execution, as a multiple of the node count
    pub visit_bound_factor: usize,
    /// Base delay before the first retry; doubles on each further retry
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            visit_bound_factor: 4,
            retry_backoff_ms: 0,
        }
    }
}

/// Per-invocation options for [`WorkflowEngine::execute_with`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Free-form identity of whoever started the execution, for logs
    pub caller: Option<String>,
    /// Checked before each step is dispatched
    pub cancellation: Option<CancellationToken>,
}

/// Outcome of one node visit: the context and successor to continue with
type VisitResult = Result<(Context, Option<NodeId>), StepError>;

/// Registers workflow definitions and drives their executions
pub struct WorkflowEngine {
    registry: RwLock<WorkflowRegistry>,
    step_executor: StepExecutor,
    store: Arc<dyn ExecutionStore>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        tasks: Arc<dyn TaskExecutor>,
        functions: FunctionRegistry,
        store: Arc<dyn ExecutionStore>,
        config: EngineConfig,
    ) -> Self {
        let step_executor = StepExecutor::new(tasks, Arc::new(functions), config.retry_backoff_ms);

        Self {
            registry: RwLock::new(WorkflowRegistry::new()),
            step_executor,
            store,
            config,
        }
    }

    /// Engine with default config, keeping records in memory
    pub fn in_memory(tasks: Arc<dyn TaskExecutor>, functions: FunctionRegistry) -> Self {
        Self::new(
            tasks,
            functions,
            Arc::new(InMemoryExecutionStore::new()),
            EngineConfig::default(),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn functions(&self) -> &FunctionRegistry {
        self.step_executor.functions()
    }

    /// Validate and register a definition
    ///
    /// Nothing is registered when validation or persistence fails.
    pub async fn register_workflow(
        &self,
        workflow: WorkflowDefinition,
    ) -> EngineResult<Arc<WorkflowDefinition>> {
        validate(&workflow, self.functions()).map_err(EngineError::Validation)?;

        let mut registry = self.registry.write().await;
        let registered = registry.insert(workflow)?;

        if let Err(e) = self.store.save_definition(&registered) {
            registry.remove(&registered.id, registered.version);
            return Err(EngineError::Storage(e));
        }

        Ok(registered)
    }

    /// Load definitions persisted by an earlier process
    ///
    /// Definitions that no longer validate (e.g. a function was removed) are
    /// skipped with a warning. Returns how many were restored.
    pub async fn restore_definitions(&self) -> EngineResult<usize> {
        let definitions = self.store.list_definitions()?;
        let mut registry = self.registry.write().await;
        let mut restored = 0;

        for workflow in definitions {
            if let Err(errors) = validate(&workflow, self.functions()) {
                tracing::warn!(
                    "Skipping stored workflow {} v{}: {}",
                    workflow.id,
                    workflow.version,
                    EngineError::Validation(errors)
                );
                continue;
            }

            match registry.insert(workflow) {
                Ok(_) => restored += 1,
                Err(e) => tracing::warn!("Skipping stored workflow: {}", e),
            }
        }

        tracing::info!("Restored {} workflow definitions", restored);
        Ok(restored)
    }

    /// Execute the latest version of a workflow
    pub async fn execute(
        &self,
        workflow_id: &WorkflowId,
        input: Value,
    ) -> EngineResult<ExecutionRecord> {
        self.execute_with(workflow_id, input, ExecuteOptions::default())
            .await
    }

    /// Execute the latest version of a workflow with caller options
    ///
    /// Step failures do not surface as `Err`; they end up in the returned
    /// record. `Err` means the execution could not start or be stored.
    #[instrument(
        skip(self, input, options),
        fields(
            workflow = %workflow_id,
            caller = options.caller.as_deref().unwrap_or("anonymous")
        )
    )]
    pub async fn execute_with(
        &self,
        workflow_id: &WorkflowId,
        input: Value,
        options: ExecuteOptions,
    ) -> EngineResult<ExecutionRecord> {
        let workflow = self.get_workflow(workflow_id).await?;

        let context = match input {
            Value::Object(map) => map,
            Value::Null => Context::new(),
            other => {
                return Err(EngineError::InvalidInput(format!(
                    "execution input must be a JSON object, got {}",
                    json_type(&other)
                )))
            }
        };

        let mut record = ExecutionRecord::new(&workflow, context);
        let start = Instant::now();

        tracing::info!(
            "Starting workflow execution: execution_id={}, version={}",
            record.execution_id,
            workflow.version
        );

        record.status = ExecutionStatus::Running;
        self.store.save_execution(&record)?;

        self.traverse(&workflow, &mut record, options.cancellation.as_ref())
            .await;

        record.total_duration_ms = start.elapsed().as_millis() as u64;

        match record.failure() {
            None => tracing::info!(
                "Workflow execution completed: execution_id={}, steps={}",
                record.execution_id,
                record.node_history.len()
            ),
            Some(failure) => tracing::error!(
                "Workflow execution failed: execution_id={}, class={:?}, error={}",
                record.execution_id,
                failure.class,
                failure.message
            ),
        }

        self.store.save_execution(&record)?;
        Ok(record)
    }

    /// Walk the graph from the start node until a terminal status is reached
    async fn traverse(
        &self,
        workflow: &WorkflowDefinition,
        record: &mut ExecutionRecord,
        cancellation: Option<&CancellationToken>,
    ) {
        let bound = workflow
            .node_count()
            .saturating_mul(self.config.visit_bound_factor.max(1));
        let mut current = Some(workflow.start_node_id.clone());

        while let Some(node_id) = current.take() {
            record.current_node_id = Some(node_id.clone());

            let stop = if record.node_history.len() >= bound {
                Some(StepError::CycleDetected {
                    node: node_id.clone(),
                    bound,
                })
            } else if cancellation.is_some_and(|token| token.is_cancelled()) {
                Some(StepError::Cancelled)
            } else {
                None
            };
            if let Some(error) = stop {
                tracing::error!(
                    "Stopping execution {} at node {}: {}",
                    record.execution_id,
                    node_id,
                    error
                );
                record
                    .node_history
                    .push(history_entry(node_id, Utc::now(), 0, Vec::new(), Some(&error)));
                record.status = ExecutionStatus::Failed;
                return;
            }

            let Some(node) = workflow.node(node_id.as_str()) else {
                // Only reachable with a definition that bypassed validation
                let error = StepError::Config(format!("node '{}' does not exist", node_id));
                record
                    .node_history
                    .push(history_entry(node_id, Utc::now(), 0, Vec::new(), Some(&error)));
                record.status = ExecutionStatus::Failed;
                return;
            };

            let (entry, result) = self.visit(node, &record.context).await;
            record.node_history.push(entry);

            match result {
                Ok((context, next)) => {
                    tracing::info!("Step {} completed", node.id);
                    record.context = context;
                    current = next;
                }
                Err(e) => match &node.on_error {
                    Some(fallback) => {
                        tracing::warn!(
                            "Step {} failed ({}); continuing at {}",
                            node.id,
                            e,
                            fallback
                        );
                        current = Some(fallback.clone());
                    }
                    None => {
                        tracing::error!("Step {} failed: {}", node.id, e);
                        record.status = ExecutionStatus::Failed;
                        return;
                    }
                },
            }
        }

        record.current_node_id = None;
        record.status = ExecutionStatus::Completed;
    }

    /// Run one node against the context and record the visit
    async fn visit(&self, node: &Node, context: &Context) -> (NodeHistoryEntry, VisitResult) {
        let started_at = Utc::now();
        let start = Instant::now();

        let (attempts, result) = match extract_input(context, &node.input_mapping) {
            Ok(params) => {
                let run = self.step_executor.execute_with_retry(node, &params).await;
                (run.attempts, run.result)
            }
            Err(e) => (Vec::new(), Err(e)),
        };
        let result = result.and_then(|output| advance(node, context, output));

        let entry = history_entry(
            node.id.clone(),
            started_at,
            start.elapsed().as_millis() as u64,
            attempts,
            result.as_ref().err(),
        );
        (entry, result)
    }

    /// Get an execution record by ID
    pub async fn get_execution(&self, id: &ExecutionId) -> EngineResult<ExecutionRecord> {
        self.store
            .get_execution(id)?
            .ok_or(EngineError::ExecutionNotFound(*id))
    }

    /// List execution records, most recent first
    pub async fn list_executions(
        &self,
        workflow_id: Option<&WorkflowId>,
    ) -> EngineResult<Vec<ExecutionRecord>> {
        Ok(self.store.list_executions(workflow_id)?)
    }

    /// Latest version of every registered workflow
    pub async fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.registry.read().await.list_latest()
    }

    pub async fn get_workflow(&self, id: &WorkflowId) -> EngineResult<Arc<WorkflowDefinition>> {
        self.registry
            .read()
            .await
            .latest(id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    pub async fn get_workflow_version(
        &self,
        id: &WorkflowId,
        version: u32,
    ) -> EngineResult<Arc<WorkflowDefinition>> {
        let registry = self.registry.read().await;
        if registry.latest(id).is_none() {
            return Err(EngineError::NotFound(id.clone()));
        }
        registry
            .version(id, version)
            .ok_or_else(|| EngineError::VersionNotFound {
                id: id.clone(),
                version,
            })
    }

    /// All versions of a workflow, oldest first
    pub async fn list_versions(
        &self,
        id: &WorkflowId,
    ) -> EngineResult<Vec<Arc<WorkflowDefinition>>> {
        let versions = self.registry.read().await.versions(id);
        if versions.is_empty() {
            return Err(EngineError::NotFound(id.clone()));
        }
        Ok(versions)
    }

    pub async fn statistics(&self) -> EngineResult<StatsOverview> {
        let records = self.store.list_executions(None)?;
        Ok(stats::overview(&records))
    }

    pub async fn workflow_statistics(&self, id: &WorkflowId) -> EngineResult<WorkflowStats> {
        self.get_workflow(id).await?;
        let records = self.store.list_executions(Some(id))?;
        Ok(stats::workflow_stats(id, &records))
    }
}

/// Merge a successful step result and pick the successor
fn advance(node: &Node, context: &Context, output: StepOutput) -> VisitResult {
    let fallback_key = node.id.as_str();

    match &node.kind {
        NodeKind::Condition { branches, .. } => {
            let label = output.branch.unwrap_or_default();
            let target = branches
                .get(&label)
                .cloned()
                .ok_or(StepError::UnknownBranch(label))?;

            let context = if node.output_mapping.is_empty() {
                context.clone()
            } else {
                merge_output(context, &output.value, &node.output_mapping, fallback_key)?
            };
            Ok((context, Some(target)))
        }
        NodeKind::Task { .. } | NodeKind::Transform { .. } => {
            let context = merge_output(context, &output.value, &node.output_mapping, fallback_key)?;
            Ok((context, node.next.clone()))
        }
    }
}

fn history_entry(
    node_id: NodeId,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    attempts: Vec<AttemptRecord>,
    error: Option<&StepError>,
) -> NodeHistoryEntry {
    let outcome = match error {
        None => StepOutcome::Succeeded,
        // A transient error only survives the retry loop once retries run out
        Some(e) if e.is_transient() => StepOutcome::FailedExhausted,
        Some(_) => StepOutcome::FailedFatal,
    };

    NodeHistoryEntry {
        node_id,
        started_at,
        finished_at: Utc::now(),
        outcome,
        retries_used: attempts.len().saturating_sub(1) as u32,
        duration_ms,
        attempts,
        error: error.map(|e| StepFailure {
            class: e.class(),
            message: e.to_string(),
        }),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::types::{ErrorClass, Predicate};
    use crate::workflow::builder::WorkflowBuilder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    type Behavior = Box<dyn Fn(&Value, u32) -> Result<Value, TaskError> + Send + Sync>;

    /// Task executor keyed by task type; unknown types echo their parameters.
    /// Behaviors receive the 1-based call count for their task type.
    #[derive(Default)]
    struct MockTasks {
        behaviors: HashMap<String, Behavior>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl MockTasks {
        fn on<F>(mut self, task_type: &str, f: F) -> Self
        where
            F: Fn(&Value, u32) -> Result<Value, TaskError> + Send + Sync + 'static,
        {
            self.behaviors.insert(task_type.to_string(), Box::new(f));
            self
        }

        fn calls(&self, task_type: &str) -> u32 {
            self.calls.lock().unwrap().get(task_type).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl TaskExecutor for MockTasks {
        async fn run_task(
            &self,
            _executor_id: &str,
            task_type: &str,
            parameters: Value,
        ) -> Result<Value, TaskError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(task_type.to_string()).or_insert(0);
                *count += 1;
                *count
            };

            if task_type == "slow" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }

            match self.behaviors.get(task_type) {
                Some(behavior) => behavior(&parameters, call),
                None => Ok(parameters),
            }
        }
    }

    fn engine(tasks: Arc<MockTasks>) -> WorkflowEngine {
        WorkflowEngine::in_memory(tasks, FunctionRegistry::with_builtins())
    }

    fn text(key: &str, value: impl Into<String>) -> Result<Value, TaskError> {
        let value: String = value.into();
        Ok(json!({ key: value }))
    }

    fn lesson_pipeline() -> WorkflowDefinition {
        WorkflowBuilder::new("lesson", "Lesson plan")
            .node(
                Node::task("a", "llm", "outline")
                    .input("topic", "topic")
                    .output("outline", "outline")
                    .then("b"),
            )
            .node(
                Node::task("b", "llm", "content")
                    .input("outline", "outline")
                    .output("content", "content")
                    .then("c"),
            )
            .node(
                Node::task("c", "llm", "final")
                    .input("content", "content")
                    .output("final", "final"),
            )
            .build()
    }

    fn lesson_tasks() -> MockTasks {
        MockTasks::default()
            .on("outline", |p, _| {
                let topic = p["topic"].as_str().unwrap_or_default();
                text("outline", format!("Outline of {}", topic))
            })
            .on("content", |p, _| {
                let outline = p["outline"].as_str().unwrap_or_default();
                text("content", format!("Content for {}", outline))
            })
            .on("final", |p, _| {
                let content = p["content"].as_str().unwrap_or_default();
                text("final", format!("Final: {}", content))
            })
    }

    fn pass_fail(expression: &str) -> Predicate {
        Predicate::expression(expression).labels("pass", "fail")
    }

    /// Checks that must hold for every finished record
    fn assert_well_formed(workflow: &WorkflowDefinition, record: &ExecutionRecord) {
        assert!(record.status.is_terminal());
        for pair in record.node_history.windows(2) {
            assert!(pair[0].finished_at <= pair[1].started_at);
        }
        for entry in &record.node_history {
            let limit = workflow
                .node(entry.node_id.as_str())
                .map(|n| n.retry_limit)
                .unwrap_or(0);
            assert!(entry.retries_used <= limit);
            assert_eq!(entry.retries_used as usize, entry.attempts.len().saturating_sub(1));
        }
        let last = record.last_entry().expect("at least one visit");
        match record.status {
            ExecutionStatus::Completed => assert!(last.outcome.is_success()),
            ExecutionStatus::Failed => assert!(last.error.is_some()),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn linear_pipeline_threads_context() {
        let tasks = Arc::new(lesson_tasks());
        let engine = engine(tasks.clone());
        let workflow = lesson_pipeline();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine
            .execute(&workflow.id, json!({ "topic": "fractions" }))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.path(), vec!["a", "b", "c"]);
        assert_eq!(record.context["topic"], "fractions");
        assert_eq!(record.context["outline"], "Outline of fractions");
        assert_eq!(record.context["content"], "Content for Outline of fractions");
        assert_eq!(record.context["final"], "Final: Content for Outline of fractions");
        assert!(record.current_node_id.is_none());
        assert_well_formed(&workflow, &record);
    }

    #[tokio::test]
    async fn concurrent_executions_keep_separate_records() {
        let engine = engine(Arc::new(lesson_tasks()));
        let workflow = lesson_pipeline();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let (fractions, decimals, percents) = tokio::join!(
            engine.execute(&workflow.id, json!({ "topic": "fractions" })),
            engine.execute(&workflow.id, json!({ "topic": "decimals" })),
            engine.execute(&workflow.id, json!({ "topic": "percents" })),
        );

        let records = [fractions.unwrap(), decimals.unwrap(), percents.unwrap()];
        for (record, topic) in records.iter().zip(["fractions", "decimals", "percents"]) {
            assert_eq!(record.status, ExecutionStatus::Completed);
            assert_eq!(record.path(), vec!["a", "b", "c"]);
            assert_eq!(
                record.context["final"],
                format!("Final: Content for Outline of {}", topic)
            );
            assert_well_formed(&workflow, record);
        }
        assert_ne!(records[0].execution_id, records[1].execution_id);
        assert_ne!(records[1].execution_id, records[2].execution_id);
        assert_eq!(engine.list_executions(Some(&workflow.id)).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_backoff_delays_retries() {
        let tasks = Arc::new(lesson_tasks().on("content", |_, call| {
            if call <= 2 {
                Err(TaskError::transient("model overloaded"))
            } else {
                text("content", "recovered")
            }
        }));
        let config = EngineConfig {
            retry_backoff_ms: 50,
            ..EngineConfig::default()
        };
        let engine = WorkflowEngine::new(
            tasks,
            FunctionRegistry::with_builtins(),
            Arc::new(InMemoryExecutionStore::new()),
            config,
        );
        let mut workflow = lesson_pipeline();
        workflow.nodes.get_mut("b").unwrap().retry_limit = 2;
        engine.register_workflow(workflow.clone()).await.unwrap();

        let start = tokio::time::Instant::now();
        let record = engine
            .execute(&workflow.id, json!({ "topic": "fractions" }))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.node_history[1].retries_used, 2);
        // 50ms before the second attempt, 100ms before the third
        assert!(elapsed >= Duration::from_millis(150), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn transient_failures_retry_within_one_visit() {
        let tasks = Arc::new(lesson_tasks().on("content", |_, call| {
            if call <= 2 {
                Err(TaskError::transient("model overloaded"))
            } else {
                text("content", "recovered")
            }
        }));
        let engine = engine(tasks.clone());

        let mut workflow = lesson_pipeline();
        workflow.nodes.get_mut("b").unwrap().retry_limit = 2;
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine
            .execute(&workflow.id, json!({ "topic": "fractions" }))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.visits("b"), 1);
        let b = &record.node_history[1];
        assert_eq!(b.attempts.len(), 3);
        assert_eq!(b.retries_used, 2);
        assert_eq!(b.outcome, StepOutcome::Succeeded);
        assert_eq!(tasks.calls("content"), 3);
        assert_eq!(record.context["content"], "recovered");
        assert_well_formed(&workflow, &record);
    }

    #[tokio::test]
    async fn exhausted_step_falls_back() {
        let tasks = Arc::new(
            lesson_tasks().on("content", |_, _| Err(TaskError::transient("still down"))),
        );
        let engine = engine(tasks.clone());

        let workflow = WorkflowBuilder::new("lesson", "Lesson with fallback")
            .node(Node::task("a", "llm", "outline").input("topic", "topic").then("b"))
            .node(
                Node::task("b", "llm", "content")
                    .retries(1)
                    .on_error("b_fallback")
                    .then("c"),
            )
            .node(Node::task("b_fallback", "template", "canned").then("c"))
            .node(Node::task("c", "llm", "final").optional_input("content", "content"))
            .build();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine
            .execute(&workflow.id, json!({ "topic": "fractions" }))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.path(), vec!["a", "b", "b_fallback", "c"]);

        let b = &record.node_history[1];
        assert_eq!(b.outcome, StepOutcome::FailedExhausted);
        assert_eq!(b.retries_used, 1);
        assert_eq!(b.error.as_ref().unwrap().class, ErrorClass::TaskTransient);
        assert_eq!(record.node_history[2].node_id.as_str(), "b_fallback");
        assert_eq!(tasks.calls("content"), 2);
        assert_well_formed(&workflow, &record);
    }

    #[tokio::test]
    async fn condition_follows_selected_branch() {
        let tasks = Arc::new(MockTasks::default());
        let engine = engine(tasks.clone());

        let workflow = WorkflowBuilder::new("review", "Graded review")
            .node(
                Node::condition("grade", pass_fail("score >= 50"))
                    .input("score", "score")
                    .branch("pass", "c1")
                    .branch("fail", "c2"),
            )
            .node(Node::task("c1", "llm", "publish"))
            .node(Node::task("c2", "llm", "remediate"))
            .build();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine.execute(&workflow.id, json!({ "score": 30 })).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.path(), vec!["grade", "c2"]);
        assert_eq!(record.visits("c1"), 0);
        assert_eq!(tasks.calls("publish"), 0);
        // No output mapping on the condition, so nothing was merged from it
        assert!(!record.context.contains_key("branch"));
        assert_well_formed(&workflow, &record);
    }

    #[tokio::test]
    async fn condition_output_is_merged_when_mapped() {
        let engine = engine(Arc::new(MockTasks::default()));
        let workflow = WorkflowBuilder::new("review", "Graded review")
            .node(
                Node::condition("grade", pass_fail("score >= 50"))
                    .output("branch", "decision")
                    .branch("pass", "done")
                    .branch("fail", "done"),
            )
            .node(Node::transform("done", "identity").output("score", "final_score"))
            .build();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine.execute(&workflow.id, json!({ "score": 75 })).await.unwrap();

        assert_eq!(record.context["decision"], "pass");
        assert_eq!(record.context["final_score"], 75);
    }

    #[tokio::test]
    async fn fallback_cycle_stops_at_visit_bound() {
        let tasks = Arc::new(
            MockTasks::default()
                .on("a", |_, _| Err(TaskError::fatal("broken")))
                .on("b", |_, _| Err(TaskError::fatal("broken"))),
        );
        let engine = engine(tasks.clone());

        let workflow = WorkflowBuilder::new("loop", "Ping pong")
            .node(Node::task("a", "llm", "a").on_error("b"))
            .node(Node::task("b", "llm", "b").on_error("a"))
            .build();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine.execute(&workflow.id, json!({})).await.unwrap();

        let bound = workflow.node_count() * engine.config().visit_bound_factor;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.node_history.len(), bound + 1);
        assert_eq!(record.failure().unwrap().class, ErrorClass::CycleDetected);
        assert!(record.last_entry().unwrap().attempts.is_empty());
        assert_eq!(tasks.calls("a") + tasks.calls("b"), bound as u32);
        assert_well_formed(&workflow, &record);
    }

    #[tokio::test]
    async fn fatal_error_without_fallback_fails_execution() {
        let tasks =
            Arc::new(lesson_tasks().on("content", |_, _| Err(TaskError::fatal("rejected"))));
        let engine = engine(tasks.clone());

        let mut workflow = lesson_pipeline();
        workflow.nodes.get_mut("b").unwrap().retry_limit = 3;
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine
            .execute(&workflow.id, json!({ "topic": "fractions" }))
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.path(), vec!["a", "b"]);
        assert_eq!(record.current_node_id, Some(NodeId::new("b")));
        let b = record.last_entry().unwrap();
        assert_eq!(b.outcome, StepOutcome::FailedFatal);
        assert_eq!(b.retries_used, 0);
        assert_eq!(record.failure().unwrap().class, ErrorClass::TaskFatal);
        assert!(!record.context.contains_key("content"));
        assert_well_formed(&workflow, &record);
    }

    #[tokio::test]
    async fn missing_context_key_is_fatal_without_dispatch() {
        let tasks = Arc::new(lesson_tasks());
        let engine = engine(tasks.clone());
        let workflow = lesson_pipeline();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine.execute(&workflow.id, json!({ "subject": "x" })).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.failure().unwrap().class, ErrorClass::MissingContextKey);
        assert!(record.node_history[0].attempts.is_empty());
        assert_eq!(tasks.calls("outline"), 0);
    }

    #[tokio::test]
    async fn missing_result_key_routes_to_fallback() {
        let tasks = Arc::new(MockTasks::default().on("outline", |_, _| text("summary", "oops")));
        let engine = engine(tasks.clone());

        let workflow = WorkflowBuilder::new("lesson", "Lesson")
            .node(
                Node::task("a", "llm", "outline")
                    .output("outline", "outline")
                    .on_error("recover"),
            )
            .node(Node::transform("recover", "identity"))
            .build();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine.execute(&workflow.id, json!({ "topic": "x" })).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(
            record.node_history[0].error.as_ref().unwrap().class,
            ErrorClass::MissingResultKey
        );
        assert_eq!(record.node_history[0].outcome, StepOutcome::FailedFatal);
        assert_eq!(record.path(), vec!["a", "recover"]);
    }

    #[tokio::test]
    async fn unknown_branch_label_is_fatal() {
        let mut functions = FunctionRegistry::with_builtins();
        functions.register_predicate("always_maybe", |_| Ok("maybe".to_string()));
        let engine = WorkflowEngine::in_memory(Arc::new(MockTasks::default()), functions);

        let workflow = WorkflowBuilder::new("gate", "Gate")
            .node(
                Node::condition("gate", Predicate::function("always_maybe"))
                    .branch("yes", "done")
                    .branch("no", "done"),
            )
            .node(Node::transform("done", "identity"))
            .build();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine.execute(&workflow.id, Value::Null).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        let failure = record.failure().unwrap();
        assert_eq!(failure.class, ErrorClass::UnknownBranch);
        assert!(failure.message.contains("maybe"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempts_are_transient() {
        let tasks = Arc::new(MockTasks::default());
        let engine = engine(tasks.clone());

        let workflow = WorkflowBuilder::new("slow", "Slow")
            .node(Node::task("a", "llm", "slow").timeout_ms(100).retries(2))
            .build();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let record = engine.execute(&workflow.id, json!({})).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        let entry = record.last_entry().unwrap();
        assert_eq!(entry.outcome, StepOutcome::FailedExhausted);
        assert_eq!(entry.attempts.len(), 3);
        assert_eq!(entry.error.as_ref().unwrap().class, ErrorClass::Timeout);
        assert_eq!(tasks.calls("slow"), 3);
    }

    #[tokio::test]
    async fn cancelled_execution_stops_before_dispatch() {
        let tasks = Arc::new(lesson_tasks());
        let engine = engine(tasks.clone());
        let workflow = lesson_pipeline();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let record = engine
            .execute_with(
                &workflow.id,
                json!({ "topic": "fractions" }),
                ExecuteOptions {
                    caller: Some("instructor-42".into()),
                    cancellation: Some(token),
                },
            )
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.node_history.len(), 1);
        assert_eq!(record.failure().unwrap().class, ErrorClass::Cancelled);
        assert_eq!(tasks.calls("outline"), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_input_and_unknown_workflows() {
        let engine = engine(Arc::new(lesson_tasks()));
        let workflow = lesson_pipeline();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let err = engine.execute(&workflow.id, json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let err = engine
            .execute(&WorkflowId::new("missing"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(engine.list_executions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_definitions_are_not_registered() {
        let engine = engine(Arc::new(MockTasks::default()));
        let workflow = WorkflowBuilder::new("broken", "Broken")
            .node(Node::task("a", "llm", "x").then("ghost"))
            .build();

        let err = engine.register_workflow(workflow.clone()).await.unwrap_err();
        match err {
            EngineError::Validation(errors) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(
            engine.get_workflow(&workflow.id).await,
            Err(EngineError::NotFound(_))
        ));

        let ok = lesson_pipeline();
        engine.register_workflow(ok.clone()).await.unwrap();
        assert!(matches!(
            engine.register_workflow(ok).await,
            Err(EngineError::AlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn latest_version_is_executed() {
        let engine = engine(Arc::new(lesson_tasks()));
        let v1 = lesson_pipeline();
        let v2 = WorkflowBuilder::new("lesson", "Lesson plan v2")
            .version(2)
            .node(Node::transform("only", "identity"))
            .build();
        engine.register_workflow(v1.clone()).await.unwrap();
        engine.register_workflow(v2).await.unwrap();

        let record = engine.execute(&v1.id, json!({ "topic": "fractions" })).await.unwrap();
        assert_eq!(record.workflow_version, 2);
        assert_eq!(record.path(), vec!["only"]);

        assert_eq!(engine.list_versions(&v1.id).await.unwrap().len(), 2);
        assert_eq!(engine.get_workflow_version(&v1.id, 1).await.unwrap().name, "Lesson plan");
        assert!(matches!(
            engine.get_workflow_version(&v1.id, 3).await,
            Err(EngineError::VersionNotFound { version: 3, .. })
        ));
        assert_eq!(engine.list_workflows().await.len(), 1);
    }

    #[tokio::test]
    async fn records_are_stored_and_counted() {
        let tasks = Arc::new(lesson_tasks());
        let engine = engine(tasks.clone());
        let workflow = lesson_pipeline();
        engine.register_workflow(workflow.clone()).await.unwrap();

        let ok = engine
            .execute(&workflow.id, json!({ "topic": "fractions" }))
            .await
            .unwrap();
        let failed = engine.execute(&workflow.id, json!({})).await.unwrap();

        assert_eq!(engine.get_execution(&ok.execution_id).await.unwrap(), ok);
        assert_eq!(engine.list_executions(Some(&workflow.id)).await.unwrap().len(), 2);
        assert!(matches!(
            engine.get_execution(&ExecutionId::new()).await,
            Err(EngineError::ExecutionNotFound(_))
        ));

        let stats = engine.workflow_statistics(&workflow.id).await.unwrap();
        assert_eq!(stats.execution_count, 2);
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(failed.status, ExecutionStatus::Failed);

        let overview = engine.statistics().await.unwrap();
        assert_eq!(overview.total_executions, 2);
        assert!(matches!(
            engine.workflow_statistics(&WorkflowId::new("nope")).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn definitions_are_restored_from_store() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let tasks: Arc<MockTasks> = Arc::new(lesson_tasks());

        let first = WorkflowEngine::new(
            tasks.clone(),
            FunctionRegistry::with_builtins(),
            store.clone(),
            EngineConfig::default(),
        );
        first.register_workflow(lesson_pipeline()).await.unwrap();

        let second = WorkflowEngine::new(
            tasks,
            FunctionRegistry::with_builtins(),
            store,
            EngineConfig::default(),
        );
        assert_eq!(second.restore_definitions().await.unwrap(), 1);
        assert!(second.get_workflow(&WorkflowId::new("lesson")).await.is_ok());
    }

    #[test]
    fn engine_config_defaults_apply_to_partial_toml_tables() {
        let config: EngineConfig =
            serde_json::from_value(json!({ "retry_backoff_ms": 25 })).unwrap();
        assert_eq!(config.visit_bound_factor, 4);
        assert_eq!(config.retry_backoff_ms, 25);
    }
}
