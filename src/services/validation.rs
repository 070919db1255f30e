use crate::errors::ToolError;
use serde_json::{Map, Value};

/// Defensive extraction of tool-call arguments.
///
/// Arguments come from an LLM-facing dispatcher: numbers may arrive as floats
/// or numeric strings, lists may mix strings and numbers, and `null` means
/// "absent".
#[derive(Clone, Debug, Default)]
pub struct Validation;

fn present<'a>(args: &'a Value, key: &str) -> Option<&'a Value> {
    args.get(key).filter(|v| !v.is_null())
}

fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

impl Validation {
    pub fn new() -> Self {
        Self
    }

    pub fn ensure_string(&self, args: &Value, key: &str) -> Result<String, ToolError> {
        let text = present(args, key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::invalid_params(format!("{} is required", key)))?;
        Ok(text.to_string())
    }

    pub fn optional_string(&self, args: &Value, key: &str) -> Option<String> {
        present(args, key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// Strings and numbers become list entries; anything else is skipped.
    pub fn string_list(&self, args: &Value, key: &str) -> Vec<String> {
        match present(args, key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(match n.as_i64() {
                        Some(i) => i.to_string(),
                        None => n.to_string(),
                    }),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
            _ => Vec::new(),
        }
    }

    pub fn optional_i64(&self, args: &Value, key: &str) -> Option<i64> {
        present(args, key)
            .and_then(as_number)
            .filter(|n| n.is_finite())
            .map(|n| n.trunc() as i64)
    }

    pub fn optional_u64(&self, args: &Value, key: &str) -> Option<u64> {
        self.optional_i64(args, key)
            .filter(|n| *n >= 0)
            .map(|n| n as u64)
    }

    pub fn optional_bool(&self, args: &Value, key: &str) -> Option<bool> {
        match present(args, key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            _ => None,
        }
    }

    pub fn optional_object(&self, args: &Value, key: &str) -> Option<Map<String, Value>> {
        present(args, key).and_then(|v| v.as_object()).cloned()
    }

    /// Present-and-non-null raw value, for pass-through fields like `output`.
    pub fn optional_value(&self, args: &Value, key: &str) -> Option<Value> {
        present(args, key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::Validation;
    use serde_json::json;

    #[test]
    fn numbers_arrive_as_floats_or_strings() {
        let v = Validation::new();
        let args = json!({"limit": 25.0, "from": "1700000000", "neg": -3});
        assert_eq!(v.optional_u64(&args, "limit"), Some(25));
        assert_eq!(v.optional_i64(&args, "from"), Some(1_700_000_000));
        assert_eq!(v.optional_u64(&args, "neg"), None);
        assert_eq!(v.optional_u64(&args, "missing"), None);
    }

    #[test]
    fn string_lists_accept_mixed_entries() {
        let v = Validation::new();
        let args = json!({"ids": ["10", 11, 12.5, null, "  "], "one": "web-1"});
        assert_eq!(v.string_list(&args, "ids"), vec!["10", "11", "12.5"]);
        assert_eq!(v.string_list(&args, "one"), vec!["web-1"]);
        assert!(v.string_list(&args, "none").is_empty());
    }

    #[test]
    fn required_strings_are_trimmed() {
        let v = Validation::new();
        let args = json!({"command": "  uptime ", "blank": " "});
        assert_eq!(v.ensure_string(&args, "command").ok().as_deref(), Some("uptime"));
        assert!(v.ensure_string(&args, "blank").is_err());
    }
}
