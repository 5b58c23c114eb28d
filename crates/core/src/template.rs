// Process templates: pre-built, parameterised workflow definitions

use crate::error::{EngineError, EngineResult};
use crate::types::{Node, NodeKind, Predicate, WorkflowDefinition, WorkflowId};
use crate::workflow::builder::WorkflowBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Unique identifier for a template
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateId(pub String);

impl TemplateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateParameterType {
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    pub description: String,
    pub param_type: TemplateParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl TemplateParameter {
    fn new(
        name: &str,
        description: &str,
        param_type: TemplateParameterType,
        default_value: Option<&str>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            param_type,
            default_value: default_value.map(str::to_string),
            required: default_value.is_none(),
        }
    }
}

/// A workflow definition with `{{name}}` placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessTemplate {
    pub id: TemplateId,
    pub name: String,
    pub description: String,
    pub category: String,
    pub parameters: Vec<TemplateParameter>,
    pub workflow_template: WorkflowDefinition,
}

/// Templates shipped with the host
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<TemplateId, ProcessTemplate>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the built-in templates
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.insert(lesson_plan());
        catalog.insert(graded_review());
        catalog
    }

    pub fn insert(&mut self, template: ProcessTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    /// All templates, ordered by id
    pub fn list(&self) -> Vec<&ProcessTemplate> {
        self.templates.values().collect()
    }

    pub fn get(&self, id: &TemplateId) -> Option<&ProcessTemplate> {
        self.templates.get(id)
    }

    /// Produce a concrete definition from a template
    ///
    /// `workflow_id` overrides the id baked into the template, so one
    /// template can back several registered workflows.
    pub fn instantiate(
        &self,
        id: &TemplateId,
        parameters: &HashMap<String, String>,
        workflow_id: Option<WorkflowId>,
    ) -> EngineResult<WorkflowDefinition> {
        let template = self
            .get(id)
            .ok_or_else(|| EngineError::Template(format!("template '{}' not found", id)))?;

        let values = resolve_parameters(template, parameters)?;
        let mut workflow = template.workflow_template.clone();

        if let Some(workflow_id) = workflow_id {
            workflow.id = workflow_id;
        }
        workflow.name = replace_parameters(&workflow.name, &values);
        workflow.description = workflow
            .description
            .map(|d| replace_parameters(&d, &values));

        for node in workflow.nodes.values_mut() {
            node.name = replace_parameters(&node.name, &values);
            match &mut node.kind {
                NodeKind::Task {
                    static_parameters, ..
                } => {
                    for value in static_parameters.values_mut() {
                        replace_in_value(value, &values);
                    }
                }
                NodeKind::Condition {
                    predicate: Predicate::Expression { expression, .. },
                    ..
                } => {
                    *expression = replace_parameters(expression, &values);
                }
                NodeKind::Condition { .. } | NodeKind::Transform { .. } => {}
            }
        }

        tracing::info!("Instantiated template {} as workflow {}", id, workflow.id);
        Ok(workflow)
    }
}

/// Provided values merged with defaults, after type checks
fn resolve_parameters(
    template: &ProcessTemplate,
    provided: &HashMap<String, String>,
) -> EngineResult<HashMap<String, String>> {
    if let Some(unknown) = provided
        .keys()
        .find(|name| !template.parameters.iter().any(|p| &&p.name == name))
    {
        return Err(EngineError::Template(format!(
            "unknown parameter '{}' for template '{}'",
            unknown, template.id
        )));
    }

    let mut values = HashMap::new();
    for param in &template.parameters {
        let value = match provided.get(&param.name).or(param.default_value.as_ref()) {
            Some(value) => value.clone(),
            None if param.required => {
                return Err(EngineError::Template(format!(
                    "required parameter '{}' not provided",
                    param.name
                )))
            }
            None => String::new(),
        };

        validate_parameter(param, &value)?;
        values.insert(param.name.clone(), value);
    }
    Ok(values)
}

/// Validate a parameter value against its type
fn validate_parameter(param: &TemplateParameter, value: &str) -> EngineResult<()> {
    let ok = match param.param_type {
        TemplateParameterType::String => true,
        TemplateParameterType::Number => value.parse::<f64>().is_ok(),
        TemplateParameterType::Boolean => value.parse::<bool>().is_ok(),
    };
    if ok || (value.is_empty() && !param.required) {
        Ok(())
    } else {
        Err(EngineError::Template(format!(
            "parameter '{}' must be a {}",
            param.name,
            match param.param_type {
                TemplateParameterType::Number => "number",
                TemplateParameterType::Boolean => "boolean",
                TemplateParameterType::String => "string",
            }
        )))
    }
}

/// Replace `{{name}}` placeholders in a single left-to-right pass
///
/// Substituted values are never rescanned. Unknown placeholders are kept.
fn replace_parameters(text: &str, params: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some((open, close, name)) = next_placeholder(rest) {
        result.push_str(&rest[..open]);
        match params.get(name) {
            Some(value) => result.push_str(value),
            None => result.push_str(&rest[open..close]),
        }
        rest = &rest[close..];
    }
    result.push_str(rest);
    result
}

/// Byte span and trimmed name of the first `{{name}}` in `text`
fn next_placeholder(text: &str) -> Option<(usize, usize, &str)> {
    let open = text.find("{{")?;
    let close = open + 2 + text[open + 2..].find("}}")? + 2;
    Some((open, close, text[open + 2..close - 2].trim()))
}

fn replace_in_value(value: &mut Value, params: &HashMap<String, String>) {
    match value {
        Value::String(s) => *s = replace_parameters(s, params),
        Value::Array(items) => items.iter_mut().for_each(|v| replace_in_value(v, params)),
        Value::Object(map) => map.values_mut().for_each(|v| replace_in_value(v, params)),
        _ => {}
    }
}

fn lesson_plan() -> ProcessTemplate {
    let workflow = WorkflowBuilder::new("lesson_plan", "Lesson plan: {{topic}}")
        .description("Outline, draft and polish a lesson on {{topic}}")
        .node(
            Node::task("outline", "llm", "outline")
                .named("Outline {{topic}}")
                .param(
                    "prompt",
                    json!("Create a lesson outline about {{topic}} for grade {{grade_level}}."),
                )
                .input("topic", "topic")
                .output("outline", "outline")
                .retries(2)
                .then("content"),
        )
        .node(
            Node::task("content", "llm", "write")
                .named("Write lesson content")
                .param(
                    "prompt",
                    json!("Expand the outline into a {{duration_minutes}} minute lesson."),
                )
                .input("outline", "outline")
                .output("content", "content")
                .retries(2)
                .then("final"),
        )
        .node(
            Node::task("final", "llm", "polish")
                .named("Polish lesson")
                .input("content", "content")
                .output("final", "final")
                .retries(1),
        )
        .build();

    ProcessTemplate {
        id: TemplateId::new("lesson_plan"),
        name: "Lesson Plan".to_string(),
        description: "Linear outline, content and polish pipeline".to_string(),
        category: "lesson".to_string(),
        parameters: vec![
            TemplateParameter::new(
                "topic",
                "Subject of the lesson",
                TemplateParameterType::String,
                None,
            ),
            TemplateParameter::new(
                "grade_level",
                "Target grade",
                TemplateParameterType::Number,
                Some("5"),
            ),
            TemplateParameter::new(
                "duration_minutes",
                "Planned lesson length",
                TemplateParameterType::Number,
                Some("45"),
            ),
        ],
        workflow_template: workflow,
    }
}

fn graded_review() -> ProcessTemplate {
    let workflow = WorkflowBuilder::new("graded_review", "Graded review: {{subject}}")
        .node(
            Node::task("grade", "llm", "grade")
                .named("Grade submission")
                .param("prompt", json!("Score this {{subject}} submission from 0 to 100."))
                .input("submission", "submission")
                .output("score", "score")
                .retries(2)
                .then("check"),
        )
        .node(
            Node::condition(
                "check",
                Predicate::expression("score >= {{passing_score}}").labels("pass", "fail"),
            )
            .named("Passing score reached")
            .input("score", "score")
            .branch("pass", "publish")
            .branch("fail", "remediate"),
        )
        .node(
            Node::task("publish", "llm", "feedback")
                .named("Write feedback")
                .param("prompt", json!("Write encouraging feedback on this {{subject}} work."))
                .input("submission", "submission")
                .output("feedback", "feedback"),
        )
        .node(
            Node::task("remediate", "llm", "remediate")
                .named("Plan remediation")
                .param(
                    "prompt",
                    json!("Suggest practice exercises to improve this {{subject}} work."),
                )
                .input("submission", "submission")
                .output("exercises", "exercises")
                .retries(1),
        )
        .build();

    ProcessTemplate {
        id: TemplateId::new("graded_review"),
        name: "Graded Review".to_string(),
        description: "Grade a submission, then publish or remediate".to_string(),
        category: "assessment".to_string(),
        parameters: vec![
            TemplateParameter::new(
                "subject",
                "Subject of the submission",
                TemplateParameterType::String,
                None,
            ),
            TemplateParameter::new(
                "passing_score",
                "Minimum score that passes",
                TemplateParameterType::Number,
                Some("70"),
            ),
        ],
        workflow_template: workflow,
    }
}
