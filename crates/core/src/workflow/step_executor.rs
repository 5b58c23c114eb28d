use super::mapper::lookup_path;
use crate::error::{StepError, TaskError};
use crate::functions::FunctionRegistry;
use crate::types::{AttemptRecord, Node, NodeKind, Predicate};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Host-provided executor for task nodes
///
/// Implementations classify their own failures as transient or fatal.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run_task(
        &self,
        executor_id: &str,
        task_type: &str,
        parameters: Value,
    ) -> Result<Value, TaskError>;
}

/// Successful result of a single step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub value: Value,
    /// Branch label chosen by a condition node
    pub branch: Option<String>,
}

/// All attempts made for one visit, plus the final result
#[derive(Debug)]
pub struct RetryRun {
    pub attempts: Vec<AttemptRecord>,
    pub result: Result<StepOutput, StepError>,
}

/// Step executor with retry and timeout logic
pub struct StepExecutor {
    tasks: Arc<dyn TaskExecutor>,
    functions: Arc<FunctionRegistry>,
    retry_backoff_ms: u64,
}

impl StepExecutor {
    pub fn new(
        tasks: Arc<dyn TaskExecutor>,
        functions: Arc<FunctionRegistry>,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            tasks,
            functions,
            retry_backoff_ms,
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Run one attempt, bounded by the node's timeout if configured
    pub async fn execute(&self, node: &Node, params: &Value) -> Result<StepOutput, StepError> {
        match node.timeout_ms {
            Some(limit) => {
                let action = self.execute_action(node, params);
                match timeout(Duration::from_millis(limit), action).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!("Step {} timed out after {}ms", node.id, limit);
                        Err(StepError::Timeout(limit))
                    }
                }
            }
            None => self.execute_action(node, params).await,
        }
    }

    /// Run a step, retrying transient failures up to the node's retry limit
    pub async fn execute_with_retry(&self, node: &Node, params: &Value) -> RetryRun {
        let max_attempts = node.retry_limit.saturating_add(1);
        let mut attempts = Vec::new();
        let mut attempt = 1;

        loop {
            tracing::debug!("Executing step {} (attempt {})", node.id, attempt);

            let started_at = Utc::now();
            let start = Instant::now();
            let result = self.execute(node, params).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            attempts.push(AttemptRecord {
                attempt,
                started_at,
                finished_at: Utc::now(),
                duration_ms,
                error: result.as_ref().err().map(|e| e.to_string()),
            });

            match result {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "Step {} failed on attempt {}: {}; retrying after {:?}",
                        node.id,
                        attempt,
                        e,
                        backoff
                    );
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    attempt += 1;
                }
                result => return RetryRun { attempts, result },
            }
        }
    }

    /// Exponential backoff before the attempt after `attempt`
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    async fn execute_action(&self, node: &Node, params: &Value) -> Result<StepOutput, StepError> {
        match &node.kind {
            NodeKind::Task {
                target_executor_id,
                task_type,
                static_parameters,
            } => {
                let mut parameters = static_parameters.clone();
                if let Value::Object(mapped) = params {
                    for (key, value) in mapped {
                        parameters.insert(key.clone(), value.clone());
                    }
                }

                let value = self
                    .tasks
                    .run_task(target_executor_id, task_type, Value::Object(parameters))
                    .await?;
                Ok(StepOutput { value, branch: None })
            }
            NodeKind::Transform { function } => {
                let transform = self.functions.transform(function).ok_or_else(|| {
                    StepError::Config(format!("unknown transform function '{}'", function))
                })?;
                let value = transform(params).map_err(|e| {
                    StepError::Config(format!("transform '{}' failed: {}", function, e))
                })?;
                Ok(StepOutput { value, branch: None })
            }
            NodeKind::Condition { predicate, .. } => {
                let label = self.select_branch(predicate, params)?;
                Ok(StepOutput {
                    value: serde_json::json!({ "branch": label }),
                    branch: Some(label),
                })
            }
        }
    }

    fn select_branch(&self, predicate: &Predicate, params: &Value) -> Result<String, StepError> {
        match predicate {
            Predicate::Function { name } => {
                let f = self.functions.predicate(name).ok_or_else(|| {
                    StepError::Config(format!("unknown predicate function '{}'", name))
                })?;
                f(params)
                    .map_err(|e| StepError::Config(format!("predicate '{}' failed: {}", name, e)))
            }
            Predicate::Expression {
                expression,
                when_true,
                when_false,
            } => {
                let holds = evaluate_condition(expression, params).map_err(StepError::Config)?;
                Ok(if holds { when_true.clone() } else { when_false.clone() })
            }
        }
    }
}

/// Evaluate a comparison expression against step parameters.
///
/// Supports `==`, `!=`, `>=`, `<=`, `>`, `<` and a bare key, which holds when
/// the key is present and neither `null` nor `false`. The left operand must be
/// a dotted path into `params` or a literal; a path that is missing or `null`
/// makes the comparison false. Quoted tokens and numbers are literals, and a
/// bare word on the right that resolves to nothing is compared as a string.
/// Ordering compares numerically when both sides are numbers.
pub fn evaluate_condition(condition: &str, params: &Value) -> Result<bool, String> {
    let condition = condition.trim();

    const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];
    let Some((op, left, right)) = OPERATORS.iter().find_map(|op| {
        condition
            .split_once(op)
            .map(|(left, right)| (*op, left.trim(), right.trim()))
    }) else {
        if condition.contains(' ') {
            return Err(format!("Unsupported condition: {}", condition));
        }
        return Ok(!matches!(
            lookup_path(params, condition),
            None | Some(Value::Null) | Some(Value::Bool(false))
        ));
    };

    if left.is_empty() || right.is_empty() {
        return Err(format!("Invalid condition format: {}", condition));
    }

    let Some(left_val) = literal(left).or_else(|| resolve_path(left, params)) else {
        return Ok(false);
    };
    let right_val = match literal(right) {
        Some(value) => value,
        None => match lookup_path(params, right) {
            Some(Value::Null) => return Ok(false),
            Some(_) => resolve_path(right, params).unwrap_or_default(),
            None => right.to_string(),
        },
    };
    let numbers = (left_val.parse::<f64>().ok(), right_val.parse::<f64>().ok());

    let result = match (op, numbers) {
        ("==", (Some(l), Some(r))) => l == r,
        ("!=", (Some(l), Some(r))) => l != r,
        ("==", _) => left_val == right_val,
        ("!=", _) => left_val != right_val,
        (">=", (Some(l), Some(r))) => l >= r,
        ("<=", (Some(l), Some(r))) => l <= r,
        (">", (Some(l), Some(r))) => l > r,
        ("<", (Some(l), Some(r))) => l < r,
        (">=", _) => left_val >= right_val,
        ("<=", _) => left_val <= right_val,
        (">", _) => left_val > right_val,
        _ => left_val < right_val,
    };

    Ok(result)
}

/// Quoted string or number written inline
fn literal(token: &str) -> Option<String> {
    for quote in ['"', '\''] {
        if let Some(inner) = token
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Some(inner.to_string());
        }
    }
    token.parse::<f64>().ok().map(|_| token.to_string())
}

/// Value at a dotted path, `None` when missing or `null`
fn resolve_path(path: &str, params: &Value) -> Option<String> {
    match lookup_path(params, path)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
