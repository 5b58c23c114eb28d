use async_trait::async_trait;
use conduit_core::TaskError;
use conduit_core::workflow::TaskExecutor;
use serde_json::Value;

/// Task executor that returns its parameters unchanged
///
/// The language-model layer lives outside this process; the loopback lets
/// workflows be registered, exercised and inspected end to end without it.
pub struct LoopbackExecutor;

#[async_trait]
impl TaskExecutor for LoopbackExecutor {
    async fn run_task(
        &self,
        executor_id: &str,
        task_type: &str,
        parameters: Value,
    ) -> Result<Value, TaskError> {
        tracing::debug!("Loopback task {}/{}", executor_id, task_type);
        Ok(parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echoes_parameters() {
        let params = json!({ "topic": "fractions", "prompt": "Outline" });
        let out = LoopbackExecutor
            .run_task("llm", "outline", params.clone())
            .await
            .unwrap();
        assert_eq!(out, params);
    }
}
