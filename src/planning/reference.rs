//! Symbolic references from step parameters to earlier step outputs.
//!
//! A parameter value `"${s1}"` is replaced by the whole output of step `s1`, and
//! `"${s1.course.id}"` by the field at that path (numeric segments index arrays). A reference
//! embedded in a longer string is interpolated as text.

use std::{collections::HashMap, fmt};

use serde_json::{Map, Value};

use crate::error::ToolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRef {
    pub step_id: String,
    pub path: Vec<String>,
}

impl ParamRef {
    /// Parses the inside of `${...}`.
    fn parse_inner(inner: &str) -> Option<Self> {
        let mut parts = inner.trim().split('.');
        let step_id = parts.next().filter(|s| !s.is_empty())?.to_string();
        let path: Vec<String> = parts.map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return None;
        }
        Some(Self { step_id, path })
    }

    /// Parses a string that is exactly one reference.
    pub fn parse(value: &str) -> Option<Self> {
        let inner = value.strip_prefix("${")?.strip_suffix('}')?;
        if inner.contains("${") || inner.contains('}') {
            return None;
        }
        Self::parse_inner(inner)
    }

    fn lookup<'a>(&self, outputs: &'a HashMap<String, Value>) -> Result<&'a Value, ToolError> {
        let mut current = outputs.get(&self.step_id).ok_or_else(|| ToolError::Reference {
            reference: self.to_string(),
            reason: format!("step `{}` has no recorded output", self.step_id),
        })?;

        for segment in &self.path {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| ToolError::Reference {
                reference: self.to_string(),
                reason: format!("no field `{}` in output", segment),
            })?;
        }

        Ok(current)
    }
}

impl fmt::Display for ParamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}", self.step_id)?;
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        write!(f, "}}")
    }
}

/// Splits a string into literal text and embedded references.
fn embedded_refs(text: &str) -> Vec<(std::ops::Range<usize>, ParamRef)> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(start) = text[offset..].find("${") {
        let start = offset + start;
        let Some(len) = text[start + 2..].find('}') else {
            break;
        };
        let end = start + 2 + len;
        if let Some(reference) = ParamRef::parse_inner(&text[start + 2..end]) {
            found.push((start..end + 1, reference));
        }
        offset = end + 1;
    }
    found
}

/// All references anywhere inside a parameter value.
pub fn references_in(value: &Value) -> Vec<ParamRef> {
    match value {
        Value::String(text) => embedded_refs(text).into_iter().map(|(_, r)| r).collect(),
        Value::Array(items) => items.iter().flat_map(references_in).collect(),
        Value::Object(map) => map.values().flat_map(references_in).collect(),
        _ => Vec::new(),
    }
}

pub fn is_reference(value: &Value) -> bool {
    !references_in(value).is_empty()
}

fn resolve_value(value: &Value, outputs: &HashMap<String, Value>) -> Result<Value, ToolError> {
    match value {
        Value::String(text) => {
            if let Some(reference) = ParamRef::parse(text) {
                return reference.lookup(outputs).cloned();
            }
            let refs = embedded_refs(text);
            if refs.is_empty() {
                return Ok(value.clone());
            }
            let mut rendered = String::with_capacity(text.len());
            let mut last = 0;
            for (range, reference) in refs {
                rendered.push_str(&text[last..range.start]);
                match reference.lookup(outputs)? {
                    Value::String(s) => rendered.push_str(s),
                    other => rendered.push_str(&other.to_string()),
                }
                last = range.end;
            }
            rendered.push_str(&text[last..]);
            Ok(Value::String(rendered))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, outputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_parameters(map, outputs).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Substitutes every reference with data from completed steps' outputs.
pub fn resolve_parameters(
    parameters: &Map<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Result<Map<String, Value>, ToolError> {
    parameters
        .iter()
        .map(|(name, value)| Ok::<_, ToolError>((name.clone(), resolve_value(value, outputs)?)))
        .collect()
}
