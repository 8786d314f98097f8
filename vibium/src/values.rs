//! Deep deserialization of BiDi remote values into plain JSON.
//!
//! Script results come back as `RemoteValue` trees; callers of `eval` and
//! friends want ordinary JSON. Nodes collapse to their `sharedId`.

use serde_json::{json, Map, Value};

use crate::error::{EngineError, Result};

/// Convert a `script.evaluate`/`script.callFunction` result payload into the
/// script's value, surfacing thrown exceptions as [`EngineError`].
pub fn unwrap_evaluate_result(result: &Value) -> Result<Value> {
    match result.get("type").and_then(Value::as_str) {
        Some("success") => Ok(remote_value_to_json(
            result.get("result").unwrap_or(&Value::Null),
        )),
        Some("exception") => {
            let details = result.get("exceptionDetails").unwrap_or(&Value::Null);
            let text = details
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    details
                        .get("exception")
                        .map(|e| remote_value_to_json(e).to_string())
                })
                .unwrap_or_else(|| "script threw".to_string());
            Err(EngineError::ScriptException { text })
        }
        _ => Err(EngineError::protocol(format!(
            "unexpected evaluate result: {result}"
        ))),
    }
}

/// The raw remote value of a successful evaluation, without JSON conversion.
pub fn unwrap_evaluate_remote(result: &Value) -> Result<Value> {
    match result.get("type").and_then(Value::as_str) {
        Some("success") => Ok(result.get("result").cloned().unwrap_or(Value::Null)),
        _ => unwrap_evaluate_result(result).map(|_| Value::Null),
    }
}

/// Recursively flatten a BiDi `RemoteValue` into plain JSON.
pub fn remote_value_to_json(value: &Value) -> Value {
    let ty = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match ty {
        "undefined" | "null" => Value::Null,
        "string" | "boolean" => value.get("value").cloned().unwrap_or(Value::Null),
        "number" => match value.get("value") {
            // NaN, Infinity, -Infinity and -0 arrive as strings
            Some(Value::String(_)) => Value::Null,
            Some(v) => v.clone(),
            None => Value::Null,
        },
        "bigint" => value.get("value").cloned().unwrap_or(Value::Null),
        "array" | "set" | "nodelist" | "htmlcollection" => value
            .get("value")
            .and_then(Value::as_array)
            .map(|items| Value::Array(items.iter().map(remote_value_to_json).collect()))
            .unwrap_or(Value::Null),
        "object" | "map" => {
            let mut out = Map::new();
            if let Some(pairs) = value.get("value").and_then(Value::as_array) {
                for pair in pairs {
                    let (Some(key), Some(val)) = (pair.get(0), pair.get(1)) else {
                        continue;
                    };
                    let key = match key {
                        Value::String(s) => s.clone(),
                        other => match remote_value_to_json(other) {
                            Value::String(s) => s,
                            other => other.to_string(),
                        },
                    };
                    out.insert(key, remote_value_to_json(val));
                }
            }
            Value::Object(out)
        }
        "node" => match value.get("sharedId") {
            Some(id) => json!({ "sharedId": id }),
            None => Value::Null,
        },
        "date" => value.get("value").cloned().unwrap_or(Value::Null),
        "regexp" => value
            .get("value")
            .and_then(|v| v.get("pattern"))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Pull the `sharedId`s out of an evaluation result that returned a list of
/// nodes.
pub fn shared_ids_of_array(result: &Value) -> Result<Vec<String>> {
    let remote = unwrap_evaluate_remote(result)?;
    let items = match remote.get("type").and_then(Value::as_str) {
        Some("array") | Some("nodelist") | Some("htmlcollection") => remote
            .get("value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    Ok(items
        .iter()
        .filter_map(|item| {
            item.get("sharedId")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_flatten() {
        assert_eq!(
            remote_value_to_json(&json!({"type": "string", "value": "hi"})),
            json!("hi")
        );
        assert_eq!(
            remote_value_to_json(&json!({"type": "number", "value": 5})),
            json!(5)
        );
        assert_eq!(
            remote_value_to_json(&json!({"type": "number", "value": "NaN"})),
            Value::Null
        );
        assert_eq!(remote_value_to_json(&json!({"type": "undefined"})), Value::Null);
    }

    #[test]
    fn nested_objects_flatten() {
        let remote = json!({
            "type": "object",
            "value": [
                ["users", {"type": "array", "value": [{"type": "string", "value": "M"}]}],
                ["count", {"type": "number", "value": 1}]
            ]
        });
        assert_eq!(
            remote_value_to_json(&remote),
            json!({"users": ["M"], "count": 1})
        );
    }

    #[test]
    fn exceptions_surface_as_script_errors() {
        let result = json!({
            "type": "exception",
            "exceptionDetails": {"text": "ReferenceError: nope is not defined"}
        });
        match unwrap_evaluate_result(&result) {
            Err(EngineError::ScriptException { text }) => {
                assert!(text.contains("ReferenceError"))
            }
            other => panic!("expected script exception, got {other:?}"),
        }
    }

    #[test]
    fn node_arrays_yield_shared_ids() {
        let result = json!({
            "type": "success",
            "result": {
                "type": "array",
                "value": [
                    {"type": "node", "sharedId": "n-1"},
                    {"type": "node", "sharedId": "n-2"}
                ]
            }
        });
        assert_eq!(shared_ids_of_array(&result).unwrap(), vec!["n-1", "n-2"]);
    }
}
