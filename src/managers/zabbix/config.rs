use crate::constants::network::TIMEOUT_API_REQUEST_SECS;
use crate::constants::zabbix::API_PATH;
use crate::errors::{SettingsError, ToolError};
use crate::services::credentials::ProxySettings;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

pub const PROXY_CACHE_KEY: &str = "proxy:settings";

#[derive(Clone, PartialEq, Eq)]
pub enum ZabbixAuth {
    Token(String),
    Login { username: String, password: String },
    None,
}

impl fmt::Debug for ZabbixAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZabbixAuth::Token(_) => f.write_str("Token(<redacted>)"),
            ZabbixAuth::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            ZabbixAuth::None => f.write_str("None"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZabbixConfig {
    /// Endpoint URL, always ending in `/api_jsonrpc.php`. Empty when unset.
    pub url: String,
    pub auth: ZabbixAuth,
    pub verify_tls: bool,
    pub timeout: Duration,
    pub proxy_url: Option<String>,
}

impl ZabbixConfig {
    pub fn from_settings(
        settings: &Map<String, Value>,
        proxy: Option<&ProxySettings>,
    ) -> Result<Self, SettingsError> {
        let url = string_field(settings, &["zabbix_url"])
            .map(|raw| normalize_api_url(&raw))
            .unwrap_or_default();

        let auth = match string_field(settings, &["zabbix_token"]) {
            Some(token) => ZabbixAuth::Token(token),
            None => match (
                string_field(settings, &["zabbix_username", "zabbix_user"]),
                string_field(settings, &["zabbix_password"]),
            ) {
                (Some(username), Some(password)) => ZabbixAuth::Login { username, password },
                _ => ZabbixAuth::None,
            },
        };

        let verify_tls = match settings.get("zabbix_verify_ssl") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(raw)) => !matches!(raw.trim(), "false" | "0" | "no"),
            Some(_) => {
                return Err(SettingsError::InvalidType {
                    field: "zabbix_verify_ssl".to_string(),
                    expected: "a boolean",
                })
            }
        };

        let timeout_secs = match settings.get("zabbix_timeout").filter(|v| !v.is_null()) {
            None => TIMEOUT_API_REQUEST_SECS,
            Some(value) => {
                let secs = value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
                    .ok_or_else(|| SettingsError::InvalidType {
                        field: "zabbix_timeout".to_string(),
                        expected: "a number of seconds",
                    })?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(SettingsError::OutOfRange {
                        field: "zabbix_timeout".to_string(),
                        value: value.to_string(),
                    });
                }
                secs.ceil() as u64
            }
        };

        Ok(Self {
            url,
            auth,
            verify_tls,
            timeout: Duration::from_secs(timeout_secs),
            proxy_url: proxy
                .and_then(|proxy| proxy.zabbix_proxy())
                .map(str::to_string),
        })
    }

    pub fn require_url(&self) -> Result<&str, ToolError> {
        if self.url.is_empty() {
            return Err(ToolError::invalid_params("Zabbix URL not configured")
                .with_hint("Set zabbix_url on the Zabbix tool instance."));
        }
        Ok(&self.url)
    }
}

fn string_field(settings: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        settings
            .get(*key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

pub fn normalize_api_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.ends_with(API_PATH) {
        return trimmed.to_string();
    }
    format!("{}{}", trimmed.trim_end_matches('/'), API_PATH)
}

/// `creds:{incident}:{tool}:{instance|default}`; prefix `creds:{incident}:` scopes one incident.
pub fn config_cache_key(incident_id: &str, tool_type: &str, instance_id: Option<u64>) -> String {
    let instance = instance_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "default".to_string());
    format!("{}{}:{}", incident_prefix(incident_id), tool_type, instance)
}

pub fn incident_prefix(incident_id: &str) -> String {
    format!("creds:{}:", incident_id)
}

pub fn auth_cache_key(url: &str, username: &str) -> String {
    format!("{}:{}", url, username)
}
