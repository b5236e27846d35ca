use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Engine-side typed variable: `{"value": ..., "type": "String"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedValue {
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_info: Option<Value>,
}

/// Json and json-serialized Object values arrive as strings and are parsed back.
pub fn decode_value(typed: TypedValue) -> Value {
    let serialized_json = match typed.kind.as_deref() {
        Some("Json") => true,
        Some("Object") => typed.value_info.as_ref()
            .and_then(|info| info.get("serializationDataFormat"))
            .and_then(Value::as_str)
            .is_some_and(|f| f == "application/json"),
        _ => false,
    };
    if serialized_json {
        if let Value::String(raw) = &typed.value {
            if let Ok(parsed) = serde_json::from_str(raw) {
                return parsed;
            }
        }
    }
    typed.value
}

pub fn encode_value(value: &Value) -> TypedValue {
    let (value, kind) = match value {
        Value::Null => (Value::Null, "Null"),
        Value::Bool(b) => (json!(b), "Boolean"),
        Value::String(s) => (json!(s), "String"),
        Value::Number(n) if n.is_i64() || n.is_u64() => (Value::Number(n.clone()), "Long"),
        Value::Number(n) => (Value::Number(n.clone()), "Double"),
        Value::Array(_) | Value::Object(_) => (Value::String(value.to_string()), "Json"),
    };
    TypedValue {
        value,
        kind: Some(kind.to_string()),
        value_info: None,
    }
}

pub fn decode_variables(typed: HashMap<String, TypedValue>) -> HashMap<String, Value> {
    typed.into_iter().map(|(k, v)| (k, decode_value(v))).collect()
}

pub fn encode_variables(variables: &HashMap<String, Value>) -> HashMap<String, TypedValue> {
    variables.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect()
}
