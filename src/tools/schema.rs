//! 工具 Schema：调用格式生成与输入校验
//!
//! - tool_call_schema_json：用 schemars 生成 `{"tool": ..., "args": {...}}` 的 JSON Schema，拼入 system prompt
//! - validate：按工具声明的 input_schema 校验 ToolUse 输入（object/array/string/number/integer/boolean/enum/required）

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

use crate::conversation::ToolValidation;

/// 工具调用请求格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 apply_patch、search_project、run_command
    pub tool: String,
    /// 工具参数对象，字段由各工具的 input schema 决定
    pub args: Map<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 按 schema 校验输入，收集全部错误（路径形如 `$.sources[0]`）
pub fn validate(schema: &Value, input: &Value) -> ToolValidation {
    let mut errors = Vec::new();
    validate_at(schema, input, "$", &mut errors);
    ToolValidation {
        valid: errors.is_empty(),
        errors,
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "boolean" => value.is_boolean(),
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

fn validate_at(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    match schema.get("type") {
        Some(Value::String(t)) if !type_matches(t, value) => {
            errors.push(format!("{}: expected {}, got {}", path, t, json_type_name(value)));
            return;
        }
        Some(Value::Array(types)) => {
            let ok = types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value));
            if !ok {
                errors.push(format!("{}: unexpected type {}", path, json_type_name(value)));
                return;
            }
        }
        _ => {}
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            let choices: Vec<String> = allowed.iter().map(Value::to_string).collect();
            errors.push(format!("{}: must be one of {}", path, choices.join(", ")));
        }
    }

    if let Value::Object(obj) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for field in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(field) {
                    errors.push(format!("{}: missing required property '{}'", path, field));
                }
            }
        }
        if let Some(Value::Object(props)) = schema.get("properties") {
            for (key, sub) in props {
                if let Some(v) = obj.get(key) {
                    validate_at(sub, v, &format!("{}.{}", path, key), errors);
                }
            }
            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                for key in obj.keys().filter(|k| !props.contains_key(*k)) {
                    errors.push(format!("{}: unknown property '{}'", path, key));
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            validate_at(item_schema, item, &format!("{}[{}]", path, i), errors);
        }
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                errors.push(format!("{}: expected at least {} items", path, min));
            }
        }
    }
}
