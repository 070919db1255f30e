use crate::errors::ToolError;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Renders a value with object keys sorted at every depth.
pub fn stable_stringify(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String(key.clone()),
                        stable_stringify(&map[key.as_str()])
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => format!(
            "[{}]",
            items.iter().map(stable_stringify).collect::<Vec<_>>().join(",")
        ),
        other => other.to_string(),
    }
}

/// First 8 bytes of the SHA-256 of the canonical JSON, hex encoded.
pub fn short_hash(value: &Value) -> String {
    let digest = Sha256::digest(stable_stringify(value).as_bytes());
    hex::encode(&digest[..8])
}

pub fn to_result_string<T: Serialize>(value: &T) -> Result<String, ToolError> {
    Ok(serde_json::to_string(value)?)
}
