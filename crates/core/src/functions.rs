// Host-supplied pure functions used by transform and condition nodes

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Pure data transformation: step params in, step result out
pub type TransformFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Branch selector: step params in, branch label out
pub type PredicateFn = Arc<dyn Fn(&Value) -> Result<String, String> + Send + Sync>;

/// Name-indexed transform and predicate functions
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    transforms: HashMap<String, TransformFn>,
    predicates: HashMap<String, PredicateFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in functions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_transform("identity", |params| Ok(params.clone()));
        registry.register_transform("concat", concat);
        registry.register_transform("word_count", word_count);
        registry.register_predicate("present", present);
        registry
    }

    pub fn register_transform<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!("Registering transform function: {}", name);
        self.transforms.insert(name, Arc::new(f));
        self
    }

    pub fn register_predicate<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<String, String> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!("Registering predicate function: {}", name);
        self.predicates.insert(name, Arc::new(f));
        self
    }

    pub fn transform(&self, name: &str) -> Option<&TransformFn> {
        self.transforms.get(name)
    }

    pub fn predicate(&self, name: &str) -> Option<&PredicateFn> {
        self.predicates.get(name)
    }

    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    pub fn has_predicate(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn transform_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transforms.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn predicate_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.predicates.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("transforms", &self.transform_names())
            .field("predicates", &self.predicate_names())
            .finish()
    }
}

/// `{parts: [..], separator?}` -> `{text}`
fn concat(params: &Value) -> Result<Value, String> {
    let parts = params
        .get("parts")
        .and_then(Value::as_array)
        .ok_or_else(|| "concat expects an array under 'parts'".to_string())?;
    let separator = params
        .get("separator")
        .and_then(Value::as_str)
        .unwrap_or(" ");

    let text = parts
        .iter()
        .map(|part| match part {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(separator);

    Ok(json!({ "text": text }))
}

/// `{text}` -> `{word_count}`
fn word_count(params: &Value) -> Result<Value, String> {
    let text = params
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| "word_count expects a string under 'text'".to_string())?;
    Ok(json!({ "word_count": text.split_whitespace().count() }))
}

/// `{value}` -> "present" | "absent"
fn present(params: &Value) -> Result<String, String> {
    let label = match params.get("value") {
        None | Some(Value::Null) => "absent",
        Some(Value::String(s)) if s.is_empty() => "absent",
        Some(_) => "present",
    };
    Ok(label.to_string())
}
