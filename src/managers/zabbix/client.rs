use super::config::{
    auth_cache_key, config_cache_key, incident_prefix, ZabbixAuth, ZabbixConfig, PROXY_CACHE_KEY,
};
use super::{ZabbixTunables, ZABBIX_TOOL_TYPE};
use crate::constants::limits::MAX_BODY_PREVIEW_BYTES;
use crate::constants::zabbix::{CONTENT_TYPE, JSONRPC_VERSION};
use crate::errors::{RpcError, ToolError, ToolErrorKind};
use crate::services::cache::TtlCache;
use crate::services::credentials::{CredentialStore, ProxySettings};
use crate::services::logger::Logger;
use crate::services::rate_limiter::RateLimiter;
use crate::utils::json::short_hash;
use crate::utils::text::truncate_utf8_prefix;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub enum ConfigEntry {
    Zabbix(Arc<ZabbixConfig>),
    Proxy(ProxySettings),
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

type ClientKey = (bool, u64, Option<String>);

type Gate = Arc<AsyncMutex<()>>;

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Authenticated, rate-limited JSON-RPC transport with config, auth and response caches.
pub struct ZabbixClient {
    logger: Logger,
    store: Arc<dyn CredentialStore>,
    limiter: Arc<RateLimiter>,
    config_cache: TtlCache<ConfigEntry>,
    response_cache: TtlCache<Value>,
    auth_tokens: Mutex<HashMap<String, CachedToken>>,
    auth_ttl: Duration,
    clients: Mutex<HashMap<ClientKey, Client>>,
    flights: Mutex<HashMap<String, Gate>>,
    next_id: AtomicU64,
}

impl ZabbixClient {
    pub fn new(
        logger: Logger,
        store: Arc<dyn CredentialStore>,
        limiter: Arc<RateLimiter>,
        tunables: &ZabbixTunables,
    ) -> Self {
        Self {
            logger,
            store,
            limiter,
            config_cache: TtlCache::new(tunables.config_ttl, tunables.cleanup_interval),
            response_cache: TtlCache::new(tunables.response_ttl, tunables.cleanup_interval),
            auth_tokens: Mutex::new(HashMap::new()),
            auth_ttl: tunables.auth_ttl,
            clients: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn default_response_ttl(&self) -> Duration {
        self.response_cache.default_ttl()
    }

    /// Concurrent callers for the same incident share one credential fetch.
    pub async fn config(
        &self,
        incident_id: &str,
        instance_id: Option<u64>,
    ) -> Result<Arc<ZabbixConfig>, ToolError> {
        let key = config_cache_key(incident_id, ZABBIX_TOOL_TYPE, instance_id);
        if let Some(config) = self.cached_config(&key) {
            return Ok(config);
        }

        let gate = self.gate(&key);
        let held = gate.lock().await;
        let result = match self.cached_config(&key) {
            Some(config) => Ok(config),
            None => self.load_config(&key, incident_id, instance_id).await,
        };
        drop(held);
        self.release(&key, &gate);
        result
    }

    fn cached_config(&self, key: &str) -> Option<Arc<ZabbixConfig>> {
        match self.config_cache.get(key) {
            Some(ConfigEntry::Zabbix(config)) => Some(config),
            _ => None,
        }
    }

    async fn load_config(
        &self,
        key: &str,
        incident_id: &str,
        instance_id: Option<u64>,
    ) -> Result<Arc<ZabbixConfig>, ToolError> {
        let creds = self
            .store
            .fetch_credentials(incident_id, ZABBIX_TOOL_TYPE, instance_id)
            .await?;
        let proxy = self.proxy_settings().await;
        let config = Arc::new(ZabbixConfig::from_settings(&creds.settings, proxy.as_ref())?);
        self.config_cache
            .set(key, ConfigEntry::Zabbix(config.clone()));
        Ok(config)
    }

    fn gate(&self, key: &str) -> Gate {
        match self.flights.lock() {
            Ok(mut guard) => guard.entry(key.to_string()).or_default().clone(),
            Err(_) => Gate::default(),
        }
    }

    /// Drops the gate once no other caller holds or awaits it.
    fn release(&self, key: &str, gate: &Gate) {
        if let Ok(mut guard) = self.flights.lock() {
            if Arc::strong_count(gate) <= 2 {
                guard.remove(key);
            }
        }
    }

    async fn proxy_settings(&self) -> Option<ProxySettings> {
        if let Some(ConfigEntry::Proxy(proxy)) = self.config_cache.get(PROXY_CACHE_KEY) {
            return Some(proxy);
        }
        match self.store.fetch_proxy_settings().await {
            Ok(Some(proxy)) => {
                self.config_cache
                    .set(PROXY_CACHE_KEY, ConfigEntry::Proxy(proxy.clone()));
                Some(proxy)
            }
            Ok(None) => None,
            Err(err) => {
                self.logger.warn(
                    "Failed to load proxy settings, continuing without proxy",
                    Some(&serde_json::json!({ "error": err.message })),
                );
                None
            }
        }
    }

    /// Response-cache lookup, then a rate-limited call on miss.
    pub async fn cached_request(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        instance_id: Option<u64>,
        method: &str,
        params: Value,
        ttl: Duration,
    ) -> Result<Value, ToolError> {
        let config = self.config(incident_id, instance_id).await?;
        let url = config.require_url()?;
        let key = response_cache_key(url, method, &params);
        if let Some(hit) = self.response_cache.get(&key) {
            self.logger.debug(
                "Response cache hit",
                Some(&serde_json::json!({ "method": method, "key": key })),
            );
            return Ok(hit);
        }

        let result = self.send(cancel, &config, method, params).await?;
        self.response_cache.set_with_ttl(key, result.clone(), ttl);
        Ok(result)
    }

    pub async fn request(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        instance_id: Option<u64>,
        method: &str,
        params: Value,
    ) -> Result<Value, ToolError> {
        let config = self.config(incident_id, instance_id).await?;
        config.require_url()?;
        self.send(cancel, &config, method, params).await
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        config: &ZabbixConfig,
        method: &str,
        params: Value,
    ) -> Result<Value, ToolError> {
        let auth = self.auth_token(cancel, config).await?;
        self.rpc(cancel, config, method, params, Some(auth)).await
    }

    async fn auth_token(
        &self,
        cancel: &CancellationToken,
        config: &ZabbixConfig,
    ) -> Result<String, ToolError> {
        let (username, password) = match &config.auth {
            ZabbixAuth::Token(token) => return Ok(token.clone()),
            ZabbixAuth::Login { username, password } => (username, password),
            ZabbixAuth::None => {
                return Err(ToolError::invalid_params("no authentication method configured")
                    .with_hint("Set zabbix_token, or zabbix_username and zabbix_password."))
            }
        };

        let key = auth_cache_key(&config.url, username);
        if let Some(token) = self.cached_token(&key) {
            return Ok(token);
        }

        let flight = format!("auth:{}", key);
        let gate = self.gate(&flight);
        let held = tokio::select! {
            _ = cancel.cancelled() => None,
            held = gate.lock() => Some(held),
        };
        let result = match held {
            None => Err(request_cancelled()),
            Some(_) => match self.cached_token(&key) {
                Some(token) => Ok(token),
                None => self.login(cancel, config, &key, username, password).await,
            },
        };
        drop(held);
        self.release(&flight, &gate);
        result
    }

    async fn login(
        &self,
        cancel: &CancellationToken,
        config: &ZabbixConfig,
        key: &str,
        username: &str,
        password: &str,
    ) -> Result<String, ToolError> {
        let result = self
            .rpc(
                cancel,
                config,
                "user.login",
                serde_json::json!({ "user": username, "password": password }),
                None,
            )
            .await?;
        let token = result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ToolError::new(
                    ToolErrorKind::RemoteApi,
                    "INVALID_RESPONSE",
                    "failed to parse auth token: user.login did not return a string",
                )
            })?;

        self.remember_token(key, &token);
        self.logger.info(
            "Authenticated with Zabbix",
            Some(&serde_json::json!({ "url": config.url, "username": username })),
        );
        Ok(token)
    }

    /// Live token for `key`. An expired entry is removed.
    fn cached_token(&self, key: &str) -> Option<String> {
        let mut guard = self.auth_tokens.lock().ok()?;
        let now = Instant::now();
        match guard.get(key).map(|cached| (now < cached.expires_at, cached.token.clone())) {
            Some((true, token)) => Some(token),
            Some((false, _)) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    fn remember_token(&self, key: &str, token: &str) {
        if let Ok(mut guard) = self.auth_tokens.lock() {
            let now = Instant::now();
            guard.retain(|_, cached| cached.expires_at > now);
            guard.insert(
                key.to_string(),
                CachedToken {
                    token: token.to_string(),
                    expires_at: now + self.auth_ttl,
                },
            );
        }
    }

    async fn rpc(
        &self,
        cancel: &CancellationToken,
        config: &ZabbixConfig,
        method: &str,
        params: Value,
        auth: Option<String>,
    ) -> Result<Value, ToolError> {
        self.limiter.wait(cancel).await?;
        let client = self.http_client(config)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut body = serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
            "id": id,
        });
        if let Some(auth) = auth {
            body["auth"] = Value::String(auth);
        }

        let started = Instant::now();
        let request = client
            .post(&config.url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(serde_json::to_vec(&body)?);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(request_cancelled()),
            res = request.send() => res.map_err(map_reqwest_error)?,
        };
        let status = response.status();
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(request_cancelled()),
            res = response.text() => res.map_err(map_reqwest_error)?,
        };
        self.logger.debug(
            "Zabbix request finished",
            Some(&serde_json::json!({
                "method": method,
                "id": id,
                "status": status.as_u16(),
                "duration_ms": started.elapsed().as_millis() as u64,
            })),
        );

        if !status.is_success() {
            return Err(ToolError::http_status(
                status.as_u16(),
                &truncate_utf8_prefix(&text, MAX_BODY_PREVIEW_BYTES),
            ));
        }

        let envelope: RpcResponse = serde_json::from_str(&text).map_err(|err| {
            ToolError::new(
                ToolErrorKind::RemoteApi,
                "INVALID_RESPONSE",
                format!("failed to parse response: {}", err),
            )
        })?;
        if let Some(error) = envelope.error {
            return Err(error.into());
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    fn http_client(&self, config: &ZabbixConfig) -> Result<Client, ToolError> {
        let key: ClientKey = (
            config.verify_tls,
            config.timeout.as_secs(),
            config.proxy_url.clone(),
        );
        if let Ok(mut guard) = self.clients.lock() {
            if let Some(existing) = guard.get(&key) {
                return Ok(existing.clone());
            }

            let mut builder = Client::builder().timeout(config.timeout);
            if !config.verify_tls {
                builder = builder.danger_accept_invalid_certs(true);
            }
            builder = match config.proxy_url.as_deref().map(parse_proxy) {
                Some(Ok(proxy)) => builder.proxy(proxy),
                Some(Err(reason)) => {
                    self.logger.warn(
                        "Invalid proxy URL, connecting directly",
                        Some(&serde_json::json!({ "error": reason })),
                    );
                    builder.no_proxy()
                }
                None => builder.no_proxy(),
            };

            let client = builder
                .build()
                .map_err(|err| ToolError::internal(format!("Failed to build HTTP client: {}", err)))?;
            guard.insert(key, client.clone());
            return Ok(client);
        }
        Err(ToolError::internal("Failed to access HTTP client cache"))
    }

    /// Drops cached configuration of one incident. Returns the number of entries removed.
    pub fn invalidate_incident(&self, incident_id: &str) -> usize {
        let removed = self.config_cache.delete_by_prefix(&incident_prefix(incident_id));
        self.logger.info(
            "Invalidated incident configuration",
            Some(&serde_json::json!({ "incident_id": incident_id, "removed": removed })),
        );
        removed
    }

    pub fn clear_caches(&self) {
        self.config_cache.clear();
        self.response_cache.clear();
        if let Ok(mut guard) = self.auth_tokens.lock() {
            guard.clear();
        }
    }

    pub fn stop(&self) {
        self.config_cache.stop();
        self.response_cache.stop();
    }

    pub fn stats(&self) -> Value {
        let auth_tokens = self.auth_tokens.lock().map(|guard| guard.len()).unwrap_or(0);
        serde_json::json!({
            "config_cache": self.config_cache.stats(),
            "response_cache": self.response_cache.stats(),
            "auth_tokens": auth_tokens,
            "rate_limiter": self.limiter.stats(),
        })
    }
}

/// `{method}:{hash}`; the hash covers the endpoint so two Zabbix instances never share entries.
pub fn response_cache_key(url: &str, method: &str, params: &Value) -> String {
    let scope = serde_json::json!({ "url": url, "params": params });
    format!("{}:{}", method, short_hash(&scope))
}

fn parse_proxy(raw: &str) -> Result<reqwest::Proxy, String> {
    let parsed = url::Url::parse(raw).map_err(|err| format!("{}: {}", raw, err))?;
    reqwest::Proxy::all(parsed.as_str()).map_err(|err| format!("{}: {}", raw, err))
}

fn request_cancelled() -> ToolError {
    ToolError::cancelled("Zabbix request cancelled by caller")
}

fn map_reqwest_error(err: reqwest::Error) -> ToolError {
    if err.is_timeout() {
        return ToolError::timeout("HTTP request timed out");
    }
    if err.is_connect() {
        return ToolError::transport(format!("Failed to connect: {}", err));
    }
    ToolError::transport(format!("HTTP request failed: {}", err))
}
