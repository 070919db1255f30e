use crate::constants::zabbix::{BATCH_HISTORY_LIMIT, BATCH_LIMIT_PER_SEARCH, BATCH_MAX_HISTORY_ITEMS};
use crate::errors::ToolError;
use crate::services::validation::Validation;
use crate::utils::json::stable_stringify;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

const DEFAULT_BATCH_OUTPUT: [&str; 7] = [
    "itemid", "hostid", "name", "key_", "value_type", "lastvalue", "units",
];

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub searches: Vec<String>,
    pub hostids: Vec<String>,
    pub output: Value,
    pub limit_per_search: usize,
    pub start_search: bool,
}

impl BatchRequest {
    pub fn from_args(validation: &Validation, args: &Value) -> Result<Self, ToolError> {
        let searches = validation.string_list(args, "searches");
        if searches.is_empty() {
            return Err(ToolError::invalid_params(
                "searches is required and must not be empty",
            ));
        }
        let output = match validation.optional_value(args, "output") {
            Some(value @ (Value::String(_) | Value::Array(_))) => value,
            _ => serde_json::json!(DEFAULT_BATCH_OUTPUT),
        };
        let limit_per_search = validation
            .optional_u64(args, "limit_per_search")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(BATCH_LIMIT_PER_SEARCH);
        Ok(Self {
            searches,
            hostids: validation.string_list(args, "hostids"),
            output,
            limit_per_search,
            start_search: validation.optional_bool(args, "start_search").unwrap_or(true),
        })
    }

    /// Over-fetches twice the per-pattern cap so dedup still leaves enough items.
    pub fn pattern_params(&self, pattern: &str) -> Value {
        let mut params = serde_json::json!({
            "output": self.output,
            "search": { "key_": pattern },
            "searchWildcardsEnabled": true,
            "startSearch": self.start_search,
            "limit": self.limit_per_search * 2,
        });
        if !self.hostids.is_empty() {
            params["hostids"] = serde_json::json!(self.hostids);
        }
        params
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternResult {
    pub pattern: String,
    pub items: Vec<Value>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub results: Vec<PatternResult>,
    pub total_items: usize,
    pub total_unique: usize,
    pub pattern_count: usize,
}

impl BatchResult {
    pub fn item_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.results
            .iter()
            .flat_map(|result| result.items.iter())
            .filter_map(|item| item.get("itemid").and_then(|v| v.as_str()))
            .filter(|id| seen.insert(id.to_string()))
            .map(str::to_string)
            .collect()
    }
}

fn dedup_key(item: &Value) -> String {
    match item.get("itemid").and_then(|v| v.as_str()) {
        Some(id) => id.to_string(),
        None => stable_stringify(item),
    }
}

/// Merges per-pattern responses in pattern order. `None` marks a failed pattern.
pub fn merge_results(patterns: Vec<(String, Option<Value>)>, limit_per_search: usize) -> BatchResult {
    let mut seen: HashSet<String> = HashSet::new();
    let pattern_count = patterns.len();
    let results = patterns
        .into_iter()
        .map(|(pattern, response)| {
            let mut items = Vec::new();
            if let Some(Value::Array(candidates)) = response {
                for item in candidates {
                    if items.len() >= limit_per_search {
                        break;
                    }
                    if seen.insert(dedup_key(&item)) {
                        items.push(item);
                    }
                }
            }
            PatternResult {
                pattern,
                count: items.len(),
                items,
            }
        })
        .collect();

    BatchResult {
        results,
        total_items: seen.len(),
        total_unique: seen.len(),
        pattern_count,
    }
}

pub fn history_limit(validation: &Validation, args: &Value) -> usize {
    validation
        .optional_u64(args, "history_limit")
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .unwrap_or(BATCH_HISTORY_LIMIT)
}

/// `history.get` params for the first unique ids, or `None` when the batch found nothing.
pub fn history_params(batch: &BatchResult, history_limit: usize) -> Option<Value> {
    let mut ids = batch.item_ids();
    if ids.is_empty() {
        return None;
    }
    ids.truncate(BATCH_MAX_HISTORY_ITEMS);
    Some(serde_json::json!({
        "output": "extend",
        "itemids": ids,
        "limit": history_limit * ids.len(),
        "sortfield": "clock",
        "sortorder": "DESC",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str) -> Value {
        json!({ "itemid": id, "key_": format!("key.{}", id) })
    }

    #[test]
    fn requires_searches() {
        let err = BatchRequest::from_args(&Validation::new(), &json!({"searches": []}))
            .expect_err("empty searches");
        assert_eq!(err.message, "searches is required and must not be empty");
    }

    #[test]
    fn pattern_params_use_defaults() {
        let request =
            BatchRequest::from_args(&Validation::new(), &json!({"searches": ["system.cpu"]}))
                .expect("valid");
        let params = request.pattern_params("system.cpu");
        assert_eq!(params["limit"], json!(20));
        assert_eq!(params["startSearch"], json!(true));
        assert_eq!(params["search"]["key_"], json!("system.cpu"));
        assert_eq!(params["output"].as_array().map(Vec::len), Some(7));
        assert!(params.get("hostids").is_none());
    }

    #[test]
    fn duplicates_across_patterns_are_dropped() {
        let merged = merge_results(
            vec![
                ("cpu".to_string(), Some(json!([item("1"), item("2"), item("3")]))),
                ("load".to_string(), Some(json!([item("2"), item("4")]))),
                ("broken".to_string(), None),
            ],
            2,
        );
        assert_eq!(merged.pattern_count, 3);
        assert_eq!(merged.results[0].count, 2);
        assert_eq!(merged.results[1].items, vec![item("4")]);
        assert_eq!(merged.results[2].count, 0);
        assert_eq!(merged.total_unique, 3);
        assert_eq!(merged.item_ids(), vec!["1", "2", "4"]);
    }

    #[test]
    fn history_params_cap_item_count() {
        let items: Vec<Value> = (0..80).map(|n| item(&n.to_string())).collect();
        let merged = merge_results(vec![("all".to_string(), Some(Value::Array(items)))], 100);
        let params = history_params(&merged, 5).expect("params");
        assert_eq!(params["itemids"].as_array().map(Vec::len), Some(50));
        assert_eq!(params["limit"], json!(250));

        let empty = merge_results(vec![("none".to_string(), Some(json!([])))], 10);
        assert!(history_params(&empty, 5).is_none());
    }
}
