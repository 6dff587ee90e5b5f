//! `${...}` expression rendering against visible context elements.
//!
//! The first path segment names an element by its expression key (`env`, `phase`,
//! `workflow`, `artifact`, `setup`, `instances`, `service`, or a param name); the
//! rest walks that element's serialized fields. Numeric segments index arrays.

use super::ContextError;
use crate::models::ContextElement;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([^{}]+?)\s*\}").expect("placeholder pattern is a valid regex")
});

/// Whether the template text outside well-formed placeholders still opens one
fn has_unclosed_placeholder(template: &str) -> bool {
    let mut cursor = 0;
    for found in PLACEHOLDER.find_iter(template) {
        if template[cursor..found.start()].contains("${") {
            return true;
        }
        cursor = found.end();
    }
    template[cursor..].contains("${")
}

/// Render every placeholder in `template`; elements are searched nearest first
pub fn render_template(template: &str, elements: &[ContextElement]) -> Result<String, ContextError> {
    if !template.contains("${") {
        return Ok(template.to_string());
    }

    if has_unclosed_placeholder(template) {
        return Err(ContextError::MalformedTemplate {
            template: template.to_string(),
        });
    }

    let mut failure: Option<ContextError> = None;
    let rendered = PLACEHOLDER.replace_all(template, |captures: &Captures<'_>| {
        let expression = &captures[1];
        match resolve_expression(expression, elements) {
            Some(value) => value,
            None => {
                failure.get_or_insert(ContextError::UnresolvedPlaceholder {
                    placeholder: expression.to_string(),
                });
                String::new()
            }
        }
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(rendered.into_owned()),
    }
}

/// Render every string inside a JSON value, leaving other values untouched
pub fn render_value(value: &Value, elements: &[ContextElement]) -> Result<Value, ContextError> {
    Ok(match value {
        Value::String(text) => Value::String(render_template(text, elements)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, elements))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, elements)?);
            }
            Value::Object(rendered)
        }
        other => other.clone(),
    })
}

fn resolve_expression(expression: &str, elements: &[ContextElement]) -> Option<String> {
    let mut segments = expression.split('.');
    let key = segments.next()?;
    let element = elements
        .iter()
        .find(|element| element.expression_key() == key)?;
    let root = element.expression_value().ok()?;

    let mut current = &root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    match current {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(_) | Value::Number(_) => Some(current.to_string()),
        Value::Array(_) | Value::Object(_) => Some(current.to_string()),
    }
}
