//! Validate JSON values against the JSON Schema subset used by tools and events.

use serde_json::Value;

/// Validate tool arguments (or event properties) against a JSON Schema.
///
/// Supports `type`, `required`, `properties`, `items`, `enum`, `minItems`
/// and `maxItems`, recursing into nested objects and arrays. Returns
/// `Err(message)` describing the first violation found, prefixed with the
/// JSON path of the offending value.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), String> {
    validate_at(args, schema, "$")
}

fn validate_at(value: &Value, schema: &Value, path: &str) -> Result<(), String> {
    if let Some(expected_type) = schema.get("type").and_then(|v| v.as_str()) {
        if !value_matches_type(value, expected_type) {
            return Err(format!(
                "{path}: expected {expected_type}, got {}",
                json_type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|v| v.as_array()) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value {value} is not one of {}", Value::Array(allowed.clone())));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
            for field in required {
                if let Some(name) = field.as_str() {
                    if !obj.contains_key(name) {
                        return Err(format!("{path}: missing required field '{name}'"));
                    }
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
            for (key, field_value) in obj {
                if let Some(prop_schema) = properties.get(key) {
                    validate_at(field_value, prop_schema, &format!("{path}.{key}"))?;
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(min) = schema.get("minItems").and_then(|v| v.as_u64()) {
            if (items.len() as u64) < min {
                return Err(format!(
                    "{path}: expected at least {min} items, got {}",
                    items.len()
                ));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(|v| v.as_u64()) {
            if (items.len() as u64) > max {
                return Err(format!(
                    "{path}: expected at most {max} items, got {}",
                    items.len()
                ));
            }
        }
        if let Some(item_schema) = schema.get("items") {
            for (index, item) in items.iter().enumerate() {
                validate_at(item, item_schema, &format!("{path}[{index}]"))?;
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
