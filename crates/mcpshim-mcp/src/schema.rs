//! Tool input-schema parsing.
//!
//! Providers describe tool inputs as JSON Schema; the shim only surfaces
//! the parts scripts care about: required names, sorted property names,
//! and a per-property detail view. Malformed schemas degrade to empty
//! views rather than erroring.

use mcpshim_core::protocol::PropertyDetail;
use serde::Deserialize;
use serde_json::Value;

#[derive(Default, Deserialize)]
struct InputSchema {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    properties: serde_json::Map<String, Value>,
}

#[derive(Default, Deserialize)]
struct PropertyEntry {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default, rename = "enum")]
    choices: Vec<Value>,
    #[serde(default, rename = "const")]
    constant: Option<Value>,
    #[serde(default)]
    description: String,
}

/// Extract `(required, properties)` from a tool input schema. Property
/// names are sorted lexicographically.
pub fn parse_schema(schema: &Value) -> (Vec<String>, Vec<String>) {
    let parsed: InputSchema = match serde_json::from_value(schema.clone()) {
        Ok(parsed) => parsed,
        Err(_) => return (Vec::new(), Vec::new()),
    };
    let mut properties: Vec<String> = parsed.properties.keys().cloned().collect();
    properties.sort();
    (parsed.required, properties)
}

/// Expand a tool input schema into per-property details, ordered by
/// property name. `required` is true iff the name appears in the schema's
/// required list.
pub fn parse_schema_detail(schema: &Value, required: &[String]) -> Vec<PropertyDetail> {
    let parsed: InputSchema = match serde_json::from_value(schema.clone()) {
        Ok(parsed) => parsed,
        Err(_) => return Vec::new(),
    };

    let mut names: Vec<&String> = parsed.properties.keys().collect();
    names.sort();

    names
        .into_iter()
        .map(|name| {
            let entry: PropertyEntry = parsed
                .properties
                .get(name)
                .and_then(|raw| serde_json::from_value(raw.clone()).ok())
                .unwrap_or_default();
            PropertyDetail {
                name: name.clone(),
                kind: entry.kind,
                choices: entry.choices.iter().map(value_to_string).collect(),
                constant: entry.constant.as_ref().map(value_to_string).unwrap_or_default(),
                description: entry.description,
                required: required.iter().any(|r| r == name),
            }
        })
        .collect()
}

/// Render a schema value the way it reads in the schema: strings bare,
/// everything else as JSON.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
