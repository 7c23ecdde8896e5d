// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Lightweight JSON-Schema checking for tool arguments plus per-tool
//! remediations.  The checker covers what tool schemas actually use —
//! required properties, primitive types, enums, arrays and nested objects —
//! and reports the first violation as a readable message the model can act
//! on.

use std::collections::HashMap;

use serde_json::Value;

/// A known-tool repair applied when validation fails.  Returns true when the
/// arguments were modified (recorded as `remediation_applied` metadata).
pub type Remediation = fn(&mut Value) -> bool;

pub(crate) fn default_remediations() -> HashMap<String, Remediation> {
    let mut map: HashMap<String, Remediation> = HashMap::new();
    map.insert("todo_write".to_string(), todo_write_remediation);
    map
}

/// Validate `args` against a tool's declared parameter schema.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    check_object(schema, args, "arguments")
}

fn check_object(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("{path} must be an object"))?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(name) {
                return Err(format!("{path}: missing required property {name:?}"));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop_schema) in props {
            if let Some(v) = obj.get(name) {
                check_value(prop_schema, v, &format!("{path}.{name}"))?;
            }
        }
    }

    Ok(())
}

fn check_value(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    match schema.get("type").and_then(Value::as_str) {
        Some("string") => {
            let s = value
                .as_str()
                .ok_or_else(|| format!("{path} must be a string"))?;
            if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
                let hit = allowed.iter().filter_map(Value::as_str).any(|a| a == s);
                if !hit {
                    let values: Vec<&str> =
                        allowed.iter().filter_map(Value::as_str).collect();
                    return Err(format!(
                        "{path}: {s:?} is not one of {values:?}"
                    ));
                }
            }
            Ok(())
        }
        Some("integer") => {
            if value.as_i64().is_some() || value.as_u64().is_some() {
                Ok(())
            } else {
                Err(format!("{path} must be an integer"))
            }
        }
        Some("number") => value
            .as_f64()
            .map(|_| ())
            .ok_or_else(|| format!("{path} must be a number")),
        Some("boolean") => value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| format!("{path} must be a boolean")),
        Some("array") => {
            let items = value
                .as_array()
                .ok_or_else(|| format!("{path} must be an array"))?;
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check_value(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
            Ok(())
        }
        Some("object") => check_object(schema, value, path),
        // Untyped or union-typed property: accept anything.
        _ => Ok(()),
    }
}

/// Remediation for the todo tool: unknown `priority` values are coerced to
/// `medium` instead of failing the call.
pub fn todo_write_remediation(args: &mut Value) -> bool {
    const VALID: [&str; 4] = ["low", "medium", "high", "critical"];
    let mut changed = false;
    if let Some(todos) = args.get_mut("todos").and_then(Value::as_array_mut) {
        for todo in todos {
            if let Some(priority) = todo.get("priority") {
                let ok = priority
                    .as_str()
                    .map(|p| VALID.contains(&p))
                    .unwrap_or(false);
                if !ok {
                    todo["priority"] = Value::String("medium".into());
                    changed = true;
                }
            }
        }
    }
    changed
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
