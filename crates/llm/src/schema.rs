//! Tool-schema sanitation and tool-name qualification.
//!
//! Tool parameter schemas arrive from callers (and MCP servers) in
//! whatever shape their authors wrote; the providers perform strict
//! validation and reject anything loose. The sanitizer rewrites a schema
//! into the subset every provider accepts, inferring missing `type`
//! keywords and filling structural gaps. The rewrite is idempotent.

use serde_json::{Map, Value, json};
use sha1::{Digest, Sha1};

/// Target dialect for sanitation.
///
/// OpenAI's Responses API rejects `integer` and insists on `properties`
/// for objects; Gemini rejects several JSON Schema keywords outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDialect {
    /// OpenAI Responses strict validation: coerce `integer` to `number`.
    OpenaiResponses,
    /// Generic: keep types as declared, only fill gaps.
    Generic,
    /// Gemini: additionally strip unsupported keywords.
    Gemini,
}

/// Produce a provider-acceptable schema from a possibly-untyped one.
pub fn sanitize(schema: &Value, dialect: SchemaDialect) -> Value {
    let mut value = schema.clone();
    sanitize_in_place(&mut value, dialect);
    value
}

fn sanitize_in_place(value: &mut Value, dialect: SchemaDialect) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    infer_type(obj);

    if dialect == SchemaDialect::OpenaiResponses
        && obj.get("type").and_then(Value::as_str) == Some("integer")
    {
        obj.insert("type".to_string(), Value::String("number".to_string()));
    }

    match obj.get("type").and_then(Value::as_str) {
        Some("object") => {
            if !obj.contains_key("properties") {
                obj.insert("properties".to_string(), Value::Object(Map::new()));
            }
        }
        Some("array") => {
            if !obj.contains_key("items") {
                obj.insert("items".to_string(), json!({ "type": "string" }));
            }
        }
        _ => {}
    }

    if dialect == SchemaDialect::Gemini {
        strip_gemini_unsupported(obj);
    }

    // Recurse through every keyword that nests schemas.
    if let Some(properties) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for (_, prop) in properties.iter_mut() {
            sanitize_in_place(prop, dialect);
        }
    }

    if let Some(items) = obj.get_mut("items") {
        sanitize_in_place(items, dialect);
    }

    for combinator in ["oneOf", "anyOf", "allOf"] {
        if let Some(entries) = obj.get_mut(combinator).and_then(Value::as_array_mut) {
            for entry in entries.iter_mut() {
                sanitize_in_place(entry, dialect);
            }
        }
    }

    if let Some(additional) = obj.get_mut("additionalProperties")
        && additional.is_object()
    {
        sanitize_in_place(additional, dialect);
    }

    if let Some(patterns) = obj.get_mut("patternProperties").and_then(Value::as_object_mut) {
        for (_, pattern) in patterns.iter_mut() {
            sanitize_in_place(pattern, dialect);
        }
    }
}

/// Infer a missing `type` from the keywords that are present.
fn infer_type(obj: &mut Map<String, Value>) {
    if obj.contains_key("type") {
        return;
    }

    let inferred = if obj.contains_key("properties") {
        "object"
    } else if obj.contains_key("items") {
        "array"
    } else if obj.contains_key("enum") || obj.contains_key("const") || obj.contains_key("format") {
        "string"
    } else if ["minimum", "maximum", "exclusiveMinimum", "exclusiveMaximum", "multipleOf"]
        .iter()
        .any(|k| obj.contains_key(*k))
    {
        "number"
    } else if obj.contains_key("oneOf") || obj.contains_key("anyOf") || obj.contains_key("allOf") {
        return;
    } else {
        return;
    };

    obj.insert("type".to_string(), Value::String(inferred.to_string()));
}

/// Gemini rejects several standard keywords, and only supports the
/// `enum` and `date-time` string formats.
fn strip_gemini_unsupported(obj: &mut Map<String, Value>) {
    obj.remove("additionalProperties");
    obj.remove("patternProperties");
    obj.remove("$schema");
    obj.remove("default");

    if obj.get("type").and_then(Value::as_str) == Some("string")
        && let Some(format) = obj.get("format").and_then(Value::as_str)
        && format != "enum"
        && format != "date-time"
    {
        obj.remove("format");
    }
}

/// Length cap providers impose on tool names.
const MAX_TOOL_NAME_LEN: usize = 64;

/// Qualify an MCP tool as `<server>__<tool>`, truncating with a SHA1
/// suffix when the result would exceed the 64-character cap.
///
/// Deterministic: the same `(server, tool)` pair always yields the same
/// name, so calls correlate across processes.
pub fn qualify_tool_name(server: &str, tool: &str) -> String {
    let qualified = format!("{server}__{tool}");
    if qualified.len() <= MAX_TOOL_NAME_LEN {
        return qualified;
    }

    let digest = Sha1::digest(qualified.as_bytes());
    let suffix: String = digest.iter().map(|b| format!("{b:02x}")).collect();

    let mut name = qualified[..MAX_TOOL_NAME_LEN - suffix.len()].to_string();
    name.push_str(&suffix);
    name
}
