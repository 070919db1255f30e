pub mod batch;
pub mod client;
pub mod config;

use crate::constants::cache::{
    AUTH_TTL_MS, CLEANUP_INTERVAL_MS, CONFIG_TTL_MS, HISTORY_BATCH_TTL_MS, PROBLEMS_TTL_MS,
    RESPONSE_TTL_MS,
};
use crate::constants::rate_limit::{ZABBIX_BURST, ZABBIX_RATE_PER_SEC};
use crate::constants::zabbix::MAX_SEVERITY;
use crate::errors::ToolError;
use crate::services::credentials::CredentialStore;
use crate::services::logger::Logger;
use crate::services::rate_limiter::RateLimiter;
use crate::services::tool_executor::{ToolCall, ToolHandler, ToolName};
use crate::services::validation::Validation;
use crate::utils::json::to_result_string;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use batch::{history_limit, history_params, merge_results, BatchRequest, BatchResult};
use client::ZabbixClient;

pub const ZABBIX_TOOL_TYPE: &str = "zabbix";

const DEFAULT_HOST_OUTPUT: [&str; 5] = ["hostid", "host", "name", "status", "available"];

/// Process-level knobs, read once at startup.
#[derive(Debug, Clone)]
pub struct ZabbixTunables {
    pub rate_per_sec: f64,
    pub burst: u32,
    pub config_ttl: Duration,
    pub response_ttl: Duration,
    pub auth_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ZabbixTunables {
    fn default() -> Self {
        Self {
            rate_per_sec: ZABBIX_RATE_PER_SEC,
            burst: ZABBIX_BURST,
            config_ttl: Duration::from_millis(CONFIG_TTL_MS),
            response_ttl: Duration::from_millis(RESPONSE_TTL_MS),
            auth_ttl: Duration::from_millis(AUTH_TTL_MS),
            cleanup_interval: Duration::from_millis(CLEANUP_INTERVAL_MS),
        }
    }
}

impl ZabbixTunables {
    pub fn from_env() -> Self {
        Self {
            rate_per_sec: resolve_rate_per_sec(),
            burst: resolve_burst(),
            config_ttl: resolve_duration_ms("OPSGATE_CONFIG_CACHE_TTL_MS", CONFIG_TTL_MS),
            response_ttl: resolve_duration_ms("OPSGATE_RESPONSE_CACHE_TTL_MS", RESPONSE_TTL_MS),
            auth_ttl: resolve_duration_ms("OPSGATE_AUTH_CACHE_TTL_MS", AUTH_TTL_MS),
            cleanup_interval: resolve_duration_ms("OPSGATE_CACHE_CLEANUP_MS", CLEANUP_INTERVAL_MS),
        }
    }
}

fn resolve_rate_per_sec() -> f64 {
    std::env::var("OPSGATE_ZABBIX_RATE_PER_SEC")
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(ZABBIX_RATE_PER_SEC)
}

fn resolve_burst() -> u32 {
    std::env::var("OPSGATE_ZABBIX_BURST")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(ZABBIX_BURST)
}

fn resolve_duration_ms(var: &str, fallback_ms: u64) -> Duration {
    let ms = std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback_ms);
    Duration::from_millis(ms)
}

pub struct ZabbixManager {
    logger: Logger,
    validation: Validation,
    client: ZabbixClient,
}

impl ZabbixManager {
    pub fn new(
        logger: Logger,
        validation: Validation,
        store: Arc<dyn CredentialStore>,
        limiter: Arc<RateLimiter>,
        tunables: &ZabbixTunables,
    ) -> Self {
        let logger = logger.child("zabbix");
        Self {
            client: ZabbixClient::new(logger.clone(), store, limiter, tunables),
            logger,
            validation,
        }
    }

    pub fn client(&self) -> &ZabbixClient {
        &self.client
    }

    fn instance_id(&self, args: &Value) -> Option<u64> {
        self.validation.optional_u64(args, "tool_instance_id")
    }

    pub async fn get_hosts(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let params = hosts_params(&self.validation, args);
        self.client
            .cached_request(
                cancel,
                incident_id,
                self.instance_id(args),
                "host.get",
                params,
                self.client.default_response_ttl(),
            )
            .await
    }

    pub async fn get_problems(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let params = problems_params(&self.validation, args);
        self.client
            .cached_request(
                cancel,
                incident_id,
                self.instance_id(args),
                "problem.get",
                params,
                Duration::from_millis(PROBLEMS_TTL_MS),
            )
            .await
    }

    pub async fn get_history(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let params = history_query_params(&self.validation, args)?;
        self.client
            .cached_request(
                cancel,
                incident_id,
                self.instance_id(args),
                "history.get",
                params,
                self.client.default_response_ttl(),
            )
            .await
    }

    pub async fn get_items(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let params = items_params(&self.validation, args);
        self.client
            .cached_request(
                cancel,
                incident_id,
                self.instance_id(args),
                "item.get",
                params,
                self.client.default_response_ttl(),
            )
            .await
    }

    pub async fn get_triggers(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let params = triggers_params(&self.validation, args);
        self.client
            .cached_request(
                cancel,
                incident_id,
                self.instance_id(args),
                "trigger.get",
                params,
                self.client.default_response_ttl(),
            )
            .await
    }

    /// One cached `item.get` per search pattern, merged with cross-pattern dedup.
    /// A failing pattern contributes an empty entry; cancellation fails the whole batch.
    pub async fn get_items_batch(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        args: &Value,
    ) -> Result<BatchResult, ToolError> {
        let request = BatchRequest::from_args(&self.validation, args)?;
        let instance_id = self.instance_id(args);
        let ttl = self.client.default_response_ttl();

        let queries = request.searches.iter().map(|pattern| {
            let params = request.pattern_params(pattern);
            async move {
                let outcome = self
                    .client
                    .cached_request(cancel, incident_id, instance_id, "item.get", params, ttl)
                    .await;
                (pattern.clone(), outcome)
            }
        });
        let outcomes = futures::future::join_all(queries).await;

        let mut responses = Vec::with_capacity(outcomes.len());
        for (pattern, outcome) in outcomes {
            match outcome {
                Ok(value) => responses.push((pattern, Some(value))),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    self.logger.warn(
                        "Batch pattern query failed",
                        Some(&serde_json::json!({
                            "pattern": pattern,
                            "code": err.code,
                            "error": err.message,
                        })),
                    );
                    responses.push((pattern, None));
                }
            }
        }
        Ok(merge_results(responses, request.limit_per_search))
    }

    pub async fn get_items_batch_with_history(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let batch = self.get_items_batch(cancel, incident_id, args).await?;
        let Some(params) = history_params(&batch, history_limit(&self.validation, args)) else {
            return Ok(serde_json::to_value(&batch)?);
        };

        match self
            .client
            .cached_request(
                cancel,
                incident_id,
                self.instance_id(args),
                "history.get",
                params,
                Duration::from_millis(HISTORY_BATCH_TTL_MS),
            )
            .await
        {
            Ok(history) => Ok(serde_json::json!({ "items": batch, "history": history })),
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                self.logger.warn(
                    "Batch history query failed, returning items only",
                    Some(&serde_json::json!({ "code": err.code, "error": err.message })),
                );
                Ok(serde_json::to_value(&batch)?)
            }
        }
    }

    /// Uncached pass-through for methods without a dedicated operation.
    pub async fn api_request(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let method = self.validation.ensure_string(args, "method")?;
        let params = self
            .validation
            .optional_value(args, "params")
            .unwrap_or_else(|| Value::Object(Map::new()));
        self.client
            .request(cancel, incident_id, self.instance_id(args), &method, params)
            .await
    }

    pub fn invalidate_incident(&self, incident_id: &str) -> usize {
        self.client.invalidate_incident(incident_id)
    }

    pub fn clear_caches(&self) {
        self.client.clear_caches();
        self.logger.info("Cleared Zabbix caches", None);
    }

    pub fn stop(&self) {
        self.client.stop();
    }
}

#[async_trait]
impl ToolHandler for ZabbixManager {
    async fn handle(&self, call: ToolCall) -> Result<String, ToolError> {
        let cancel = &call.cancel;
        let incident = call.incident_id.as_str();
        let args = &call.args;
        let result = match call.tool {
            ToolName::ZabbixGetHosts => self.get_hosts(cancel, incident, args).await?,
            ToolName::ZabbixGetProblems => self.get_problems(cancel, incident, args).await?,
            ToolName::ZabbixGetHistory => self.get_history(cancel, incident, args).await?,
            ToolName::ZabbixGetItems => self.get_items(cancel, incident, args).await?,
            ToolName::ZabbixGetTriggers => self.get_triggers(cancel, incident, args).await?,
            ToolName::ZabbixGetItemsBatch => {
                let batch = self.get_items_batch(cancel, incident, args).await?;
                return to_result_string(&batch);
            }
            ToolName::ZabbixGetItemsBatchWithHistory => {
                self.get_items_batch_with_history(cancel, incident, args)
                    .await?
            }
            ToolName::ZabbixApiRequest => self.api_request(cancel, incident, args).await?,
            other => {
                return Err(ToolError::invalid_params(format!(
                    "{} is not a Zabbix operation",
                    other
                )))
            }
        };
        to_result_string(&result)
    }
}

fn insert_list(params: &mut Value, key: &str, list: Vec<String>) {
    if !list.is_empty() {
        params[key] = serde_json::json!(list);
    }
}

fn hosts_params(validation: &Validation, args: &Value) -> Value {
    let mut params = serde_json::json!({
        "output": validation
            .optional_value(args, "output")
            .unwrap_or_else(|| serde_json::json!(DEFAULT_HOST_OUTPUT)),
    });
    if let Some(filter) = validation.optional_object(args, "filter") {
        params["filter"] = Value::Object(filter);
    }
    if let Some(search) = validation.optional_object(args, "search") {
        params["search"] = Value::Object(search);
    }
    if let Some(start) = validation.optional_bool(args, "start_search") {
        params["startSearch"] = Value::Bool(start);
    }
    if let Some(limit) = validation.optional_u64(args, "limit") {
        params["limit"] = serde_json::json!(limit);
    }
    params
}

fn problems_params(validation: &Validation, args: &Value) -> Value {
    let mut params = serde_json::json!({
        "output": "extend",
        "selectHosts": "extend",
        "selectTags": "extend",
        "sortfield": ["eventid"],
        "sortorder": "DESC",
    });
    if validation.optional_bool(args, "recent") == Some(true) {
        params["recent"] = Value::Bool(true);
    }
    if let Some(min) = validation.optional_i64(args, "severity_min") {
        let min = min.clamp(0, MAX_SEVERITY);
        params["severities"] = serde_json::json!((min..=MAX_SEVERITY).collect::<Vec<_>>());
    }
    insert_list(&mut params, "hostids", validation.string_list(args, "hostids"));
    if let Some(limit) = validation.optional_u64(args, "limit") {
        params["limit"] = serde_json::json!(limit);
    }
    params
}

fn history_query_params(validation: &Validation, args: &Value) -> Result<Value, ToolError> {
    let itemids = validation.string_list(args, "itemids");
    if itemids.is_empty() {
        return Err(ToolError::invalid_params("itemids is required"));
    }
    let mut params = serde_json::json!({
        "output": "extend",
        "itemids": itemids,
        "history": validation.optional_i64(args, "history").unwrap_or(0),
        "sortfield": validation
            .optional_string(args, "sortfield")
            .unwrap_or_else(|| "clock".to_string()),
        "sortorder": validation
            .optional_string(args, "sortorder")
            .unwrap_or_else(|| "DESC".to_string()),
    });
    for key in ["time_from", "time_till"] {
        if let Some(ts) = validation.optional_i64(args, key) {
            params[key] = serde_json::json!(ts);
        }
    }
    if let Some(limit) = validation.optional_u64(args, "limit") {
        params["limit"] = serde_json::json!(limit);
    }
    Ok(params)
}

fn items_params(validation: &Validation, args: &Value) -> Value {
    let mut params = serde_json::json!({
        "output": validation
            .optional_value(args, "output")
            .unwrap_or_else(|| Value::String("extend".to_string())),
    });
    insert_list(&mut params, "hostids", validation.string_list(args, "hostids"));
    if let Some(filter) = validation.optional_object(args, "filter") {
        params["filter"] = Value::Object(filter);
    }
    if let Some(search) = validation.optional_object(args, "search") {
        params["search"] = Value::Object(search);
    }
    if let Some(start) = validation.optional_bool(args, "start_search") {
        params["startSearch"] = Value::Bool(start);
    }
    if let Some(limit) = validation.optional_u64(args, "limit") {
        params["limit"] = serde_json::json!(limit);
    }
    params
}

fn triggers_params(validation: &Validation, args: &Value) -> Value {
    let mut params = serde_json::json!({
        "output": validation
            .optional_value(args, "output")
            .unwrap_or_else(|| Value::String("extend".to_string())),
        "selectHosts": "extend",
        "expandDescription": true,
    });
    insert_list(&mut params, "hostids", validation.string_list(args, "hostids"));
    if validation.optional_bool(args, "only_true") == Some(true) {
        params["only_true"] = serde_json::json!(1);
    }
    if let Some(min) = validation.optional_i64(args, "min_severity") {
        params["min_severity"] = serde_json::json!(min);
    }
    params
}
