//! Data flow between the execution context and step parameters/results.
//!
//! Paths are dotted (`lesson.outline.title`); a numeric segment indexes into an
//! array. An empty path addresses the whole value. Neither function mutates
//! its inputs.

use crate::error::StepError;
use crate::types::{Context, FieldMapping};
use serde_json::{Map, Value};

/// Resolve a dotted path inside a JSON value.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve a dotted path inside a context.
pub fn lookup_context<'a>(context: &'a Context, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, rest),
        None => (path, ""),
    };
    lookup_path(context.get(head)?, rest)
}

/// Write `value` at a dotted path, creating intermediate objects.
///
/// Intermediate values that are not objects are replaced.
pub fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }

        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
}

/// Build step parameters from the context.
///
/// Without mappings the step sees a copy of the whole context.
pub fn extract_input(context: &Context, mappings: &[FieldMapping]) -> Result<Value, StepError> {
    if mappings.is_empty() {
        return Ok(Value::Object(context.clone()));
    }

    let mut params = Map::new();
    for mapping in mappings {
        let value = if mapping.from.is_empty() {
            Some(Value::Object(context.clone()))
        } else {
            lookup_context(context, &mapping.from).cloned()
        };
        match value {
            Some(value) => set_path(&mut params, &mapping.to, value),
            None if !mapping.required => continue,
            None => return Err(StepError::MissingContextKey(mapping.from.clone())),
        }
    }

    Ok(Value::Object(params))
}

/// Produce the context that results from merging a step result.
///
/// Without mappings an object result merges its top-level keys; any other
/// result is stored under `fallback_key`.
pub fn merge_output(
    context: &Context,
    result: &Value,
    mappings: &[FieldMapping],
    fallback_key: &str,
) -> Result<Context, StepError> {
    let mut merged = context.clone();

    if mappings.is_empty() {
        match result {
            Value::Object(map) => {
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
            other => {
                merged.insert(fallback_key.to_string(), other.clone());
            }
        }
        return Ok(merged);
    }

    for mapping in mappings {
        match lookup_path(result, &mapping.from) {
            Some(value) => set_path(&mut merged, &mapping.to, value.clone()),
            None if !mapping.required => continue,
            None => return Err(StepError::MissingResultKey(mapping.from.clone())),
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("context must be an object"),
        }
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let value = json!({
            "lesson": { "sections": [{ "title": "Intro" }, { "title": "Practice" }] }
        });

        assert_eq!(
            lookup_path(&value, "lesson.sections.1.title"),
            Some(&json!("Practice"))
        );
        assert_eq!(lookup_path(&value, "lesson.sections.7.title"), None);
        assert_eq!(lookup_path(&value, "lesson.sections.title"), None);
        assert_eq!(lookup_path(&value, ""), Some(&value));
    }

    #[test]
    fn extract_builds_nested_params() {
        let ctx = context(json!({ "topic": "fractions", "student": { "grade": 4 } }));
        let mappings = vec![
            FieldMapping::new("topic", "subject"),
            FieldMapping::new("student.grade", "audience.grade"),
        ];

        let params = extract_input(&ctx, &mappings).unwrap();
        assert_eq!(
            params,
            json!({ "subject": "fractions", "audience": { "grade": 4 } })
        );
    }

    #[test]
    fn extract_without_mappings_copies_context() {
        let ctx = context(json!({ "topic": "fractions" }));
        assert_eq!(extract_input(&ctx, &[]).unwrap(), json!({ "topic": "fractions" }));
    }

    #[test]
    fn empty_source_path_maps_whole_context() {
        let ctx = context(json!({ "topic": "fractions", "grade": 4 }));
        let mappings = vec![
            FieldMapping::new("", "lesson"),
            FieldMapping::new("topic", "topic"),
        ];

        assert_eq!(
            extract_input(&ctx, &mappings).unwrap(),
            json!({ "lesson": { "topic": "fractions", "grade": 4 }, "topic": "fractions" })
        );
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let ctx = context(json!({ "topic": "fractions" }));
        let err = extract_input(&ctx, &[FieldMapping::new("outline", "outline")]).unwrap_err();

        assert_eq!(err, StepError::MissingContextKey("outline".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn optional_mappings_skip_absent_keys() {
        let ctx = context(json!({ "topic": "fractions" }));
        let mappings = vec![
            FieldMapping::new("topic", "topic"),
            FieldMapping::optional("notes", "notes"),
        ];

        assert_eq!(
            extract_input(&ctx, &mappings).unwrap(),
            json!({ "topic": "fractions" })
        );
    }

    #[test]
    fn merge_writes_mapped_values_and_overwrites() {
        let ctx = context(json!({ "topic": "fractions", "draft": "old" }));
        let result = json!({ "text": "new draft", "meta": { "words": 2 } });
        let mappings = vec![
            FieldMapping::new("text", "draft"),
            FieldMapping::new("meta.words", "stats.draft_words"),
        ];

        let merged = merge_output(&ctx, &result, &mappings, "write").unwrap();
        assert_eq!(
            Value::Object(merged),
            json!({ "topic": "fractions", "draft": "new draft", "stats": { "draft_words": 2 } })
        );
    }

    #[test]
    fn merge_without_mappings() {
        let ctx = context(json!({ "topic": "fractions" }));

        let merged = merge_output(&ctx, &json!({ "outline": "1. Halves" }), &[], "plan").unwrap();
        assert_eq!(merged["outline"], "1. Halves");

        let merged = merge_output(&ctx, &json!("plain text"), &[], "plan").unwrap();
        assert_eq!(merged["plan"], "plain text");
        assert_eq!(merged["topic"], "fractions");
    }

    #[test]
    fn missing_result_key_is_fatal() {
        let ctx = Context::new();
        let err = merge_output(
            &ctx,
            &json!({ "text": "x" }),
            &[FieldMapping::new("outline", "outline")],
            "plan",
        )
        .unwrap_err();

        assert_eq!(err, StepError::MissingResultKey("outline".into()));
    }

    #[test]
    fn mapping_leaves_inputs_untouched() {
        let ctx = context(json!({ "topic": "fractions", "nested": { "a": 1 } }));
        let before = ctx.clone();
        let result = json!({ "nested": { "a": 2 } });
        let result_before = result.clone();

        let _ = extract_input(&ctx, &[FieldMapping::new("nested.a", "a")]).unwrap();
        let merged = merge_output(&ctx, &result, &[FieldMapping::new("nested.a", "nested.a")], "n")
            .unwrap();

        assert_eq!(ctx, before);
        assert_eq!(result, result_before);
        assert_eq!(merged["nested"]["a"], 2);
    }

    #[test]
    fn set_path_replaces_scalar_intermediates() {
        let mut map = Map::new();
        map.insert("stats".into(), json!(3));
        set_path(&mut map, "stats.words", json!(10));
        assert_eq!(Value::Object(map), json!({ "stats": { "words": 10 } }));
    }
}
