//! Response validation module
//!
//! Turns the endpoint's raw text payload into a `DesignResult`.
//! Required fields are checked in a fixed order (analysis, colors,
//! layout, items) so the reported violation is deterministic.
//! Individual malformed recommendation entries are dropped with a
//! warning instead of failing the whole response.

use crate::types::{ColorRecommendation, DesignResult, FurnitureRecommendation};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Field name reported when the payload root is not an object
pub const ROOT_FIELD: &str = "(root)";

/// Errors raised while validating a response payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The payload is not JSON at all
    #[error("response is not valid JSON: {0}")]
    MalformedResponse(String),

    /// The payload parsed but a required field is missing or mistyped
    #[error("response field `{field}` {problem}")]
    SchemaViolation { field: String, problem: String },
}

impl ValidationError {
    fn schema(field: &str, problem: impl Into<String>) -> Self {
        Self::SchemaViolation {
            field: field.to_string(),
            problem: problem.into(),
        }
    }

    /// Name of the offending field for schema violations
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::SchemaViolation { field, .. } => Some(field),
            Self::MalformedResponse(_) => None,
        }
    }
}

/// Validate a raw response payload into a `DesignResult`
///
/// # Errors
/// * `ValidationError::MalformedResponse` if the payload is not JSON
/// * `ValidationError::SchemaViolation` naming the first missing or
///   mistyped field
pub fn validate(payload: &str) -> Result<DesignResult, ValidationError> {
    let value: Value = serde_json::from_str(strip_code_fence(payload))
        .map_err(|e| ValidationError::MalformedResponse(e.to_string()))?;
    let object = root_object(value)?;

    let analysis = require_string(&object, "analysis")?;
    let colors = parse_entries(require_array(&object, "colors")?, "colors", parse_color)?;
    let layout = require_string(&object, "layout")?;
    let items = parse_entries(require_array(&object, "items")?, "items", parse_item)?;

    Ok(DesignResult {
        analysis,
        colors,
        layout,
        items,
    })
}

/// True for `#` followed by exactly six hex digits
pub fn is_hex_color(code: &str) -> bool {
    code.strip_prefix('#')
        .is_some_and(|digits| digits.len() == 6 && digits.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Endpoints sometimes wrap JSON in a Markdown fence despite the
/// response-format hint.
fn strip_code_fence(payload: &str) -> &str {
    let trimmed = payload.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        // ```json{...}``` on a single line
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    }
    .trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn root_object(value: Value) -> Result<Map<String, Value>, ValidationError> {
    let value = match value {
        Value::Array(items) if items.len() == 1 => items.into_iter().next().unwrap_or(Value::Null),
        other => other,
    };
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::schema(
            ROOT_FIELD,
            format!("expected an object, found {}", type_name(&other)),
        )),
    }
}

fn require_string(object: &Map<String, Value>, field: &str) -> Result<String, ValidationError> {
    match object.get(field) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(other) => Err(ValidationError::schema(
            field,
            format!("expected a string, found {}", type_name(other)),
        )),
        None => Err(ValidationError::schema(field, "is missing")),
    }
}

fn require_array<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a [Value], ValidationError> {
    match object.get(field) {
        Some(Value::Array(entries)) => Ok(entries),
        Some(other) => Err(ValidationError::schema(
            field,
            format!("expected an array, found {}", type_name(other)),
        )),
        None => Err(ValidationError::schema(field, "is missing")),
    }
}

/// Keep the well-formed entries of a recommendation list.
///
/// An empty list is accepted as-is; a non-empty list whose entries are all
/// malformed counts as a missing field.
fn parse_entries<T>(
    entries: &[Value],
    field: &str,
    parse: fn(&Value) -> Result<T, String>,
) -> Result<Vec<T>, ValidationError> {
    let mut kept = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match parse(entry) {
            Ok(parsed) => kept.push(parsed),
            Err(reason) => warn!(field, index, %reason, "dropping malformed entry"),
        }
    }

    if kept.is_empty() && !entries.is_empty() {
        return Err(ValidationError::schema(
            field,
            format!("is missing: all {} entries were malformed", entries.len()),
        ));
    }
    Ok(kept)
}

fn parse_color(entry: &Value) -> Result<ColorRecommendation, String> {
    let object = entry
        .as_object()
        .ok_or_else(|| format!("expected an object, found {}", type_name(entry)))?;

    let hex = text_field(object, &["hex"]).ok_or("missing `hex`")?.trim();
    if !is_hex_color(hex) {
        return Err(format!("`{}` is not a #RRGGBB color code", hex));
    }
    let name = text_field(object, &["name"]).ok_or("missing `name`")?;
    let rationale = text_field(object, &["desc", "description"]).ok_or("missing `desc`")?;

    Ok(ColorRecommendation {
        hex: hex.to_string(),
        name: name.to_string(),
        rationale: rationale.to_string(),
    })
}

fn parse_item(entry: &Value) -> Result<FurnitureRecommendation, String> {
    let object = entry
        .as_object()
        .ok_or_else(|| format!("expected an object, found {}", type_name(entry)))?;

    let name = text_field(object, &["name"]).ok_or("missing `name`")?;
    let style = text_field(object, &["style"]).unwrap_or_default();
    let rationale = text_field(object, &["reason", "desc"]).unwrap_or_default();

    Ok(FurnitureRecommendation {
        name: name.to_string(),
        style: style.to_string(),
        rationale: rationale.to_string(),
    })
}

/// First string value among `keys`
fn text_field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| object.get(*key).and_then(Value::as_str))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
