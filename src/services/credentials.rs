use crate::errors::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Settings of one enabled tool instance, as stored by the outer system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCredentials {
    pub tool_type: String,
    pub tool_name: String,
    pub settings: Map<String, Value>,
    pub instance_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub proxy_url: String,
    #[serde(default)]
    pub zabbix_enabled: bool,
}

impl ProxySettings {
    pub fn zabbix_proxy(&self) -> Option<&str> {
        let url = self.proxy_url.trim();
        if self.zabbix_enabled && !url.is_empty() {
            Some(url)
        } else {
            None
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolves the enabled instance of `tool_type` for an incident.
    /// `instance_id` pins a specific instance; `None` means the first enabled one.
    async fn fetch_credentials(
        &self,
        incident_id: &str,
        tool_type: &str,
        instance_id: Option<u64>,
    ) -> Result<ToolCredentials, ToolError>;

    async fn fetch_proxy_settings(&self) -> Result<Option<ProxySettings>, ToolError> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
struct StoredInstance {
    id: u64,
    tool_type: String,
    name: String,
    settings: Map<String, Value>,
    enabled: bool,
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    instances: RwLock<Vec<StoredInstance>>,
    proxy: RwLock<Option<ProxySettings>>,
    fetches: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an enabled instance and returns its id.
    pub fn insert(&self, tool_type: &str, name: &str, settings: Value) -> u64 {
        let mut guard = self.instances.write().unwrap_or_else(|err| err.into_inner());
        let id = guard.iter().map(|inst| inst.id).max().unwrap_or(0) + 1;
        guard.push(StoredInstance {
            id,
            tool_type: tool_type.to_string(),
            name: name.to_string(),
            settings: settings.as_object().cloned().unwrap_or_default(),
            enabled: true,
        });
        id
    }

    pub fn update_settings(&self, instance_id: u64, settings: Value) -> bool {
        let mut guard = self.instances.write().unwrap_or_else(|err| err.into_inner());
        match guard.iter_mut().find(|inst| inst.id == instance_id) {
            Some(inst) => {
                inst.settings = settings.as_object().cloned().unwrap_or_default();
                true
            }
            None => false,
        }
    }

    pub fn set_enabled(&self, instance_id: u64, enabled: bool) -> bool {
        let mut guard = self.instances.write().unwrap_or_else(|err| err.into_inner());
        match guard.iter_mut().find(|inst| inst.id == instance_id) {
            Some(inst) => {
                inst.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_proxy_settings(&self, proxy: Option<ProxySettings>) {
        *self.proxy.write().unwrap_or_else(|err| err.into_inner()) = proxy;
    }

    /// Number of `fetch_credentials` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn fetch_credentials(
        &self,
        _incident_id: &str,
        tool_type: &str,
        instance_id: Option<u64>,
    ) -> Result<ToolCredentials, ToolError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let guard = self.instances.read().unwrap_or_else(|err| err.into_inner());
        let found = guard.iter().find(|inst| {
            inst.enabled
                && inst.tool_type == tool_type
                && instance_id.map(|id| id == inst.id).unwrap_or(true)
        });
        match found {
            Some(inst) => Ok(ToolCredentials {
                tool_type: inst.tool_type.clone(),
                tool_name: inst.name.clone(),
                settings: inst.settings.clone(),
                instance_id: inst.id,
            }),
            None => Err(ToolError::not_found(format!(
                "no enabled tool instance found for type: {}",
                tool_type
            ))
            .with_details(serde_json::json!({
                "tool_type": tool_type,
                "instance_id": instance_id,
            }))),
        }
    }

    async fn fetch_proxy_settings(&self) -> Result<Option<ProxySettings>, ToolError> {
        Ok(self
            .proxy
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone())
    }
}
