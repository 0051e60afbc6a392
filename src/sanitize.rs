use serde_json::{Map, Value};

/// Keys never stored, compared case-insensitively.
const DENIED_KEYS: &[&str] = &[
    "password",
    "pwd",
    "creditcard",
    "cc",
    "ssn",
    "token",
    "auth",
    "authorization",
    "value",
];

fn is_denied(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    DENIED_KEYS.contains(&lower.as_str())
}

/// Recursively drop deny-listed keys from objects at any depth.
/// Arrays stay arrays; scalars are returned unchanged.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter(|(k, _)| !is_denied(k))
                .map(|(k, v)| (k, sanitize(v)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        other => other,
    }
}

/// Sanitize event metadata. Missing or null metadata becomes `{}`.
pub fn sanitize_metadata(metadata: Option<Value>) -> Value {
    match metadata {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => sanitize(v),
    }
}
