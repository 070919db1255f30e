use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::ToolError;
use crate::services::logger::Logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    SshExecuteCommand,
    SshTestConnectivity,
    SshGetServerInfo,
    ZabbixGetHosts,
    ZabbixGetProblems,
    ZabbixGetHistory,
    ZabbixGetItems,
    ZabbixGetTriggers,
    ZabbixGetItemsBatch,
    ZabbixGetItemsBatchWithHistory,
    ZabbixApiRequest,
}

impl ToolName {
    pub const ALL: [ToolName; 11] = [
        ToolName::SshExecuteCommand,
        ToolName::SshTestConnectivity,
        ToolName::SshGetServerInfo,
        ToolName::ZabbixGetHosts,
        ToolName::ZabbixGetProblems,
        ToolName::ZabbixGetHistory,
        ToolName::ZabbixGetItems,
        ToolName::ZabbixGetTriggers,
        ToolName::ZabbixGetItemsBatch,
        ToolName::ZabbixGetItemsBatchWithHistory,
        ToolName::ZabbixApiRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::SshExecuteCommand => "ssh.execute_command",
            ToolName::SshTestConnectivity => "ssh.test_connectivity",
            ToolName::SshGetServerInfo => "ssh.get_server_info",
            ToolName::ZabbixGetHosts => "zabbix.get_hosts",
            ToolName::ZabbixGetProblems => "zabbix.get_problems",
            ToolName::ZabbixGetHistory => "zabbix.get_history",
            ToolName::ZabbixGetItems => "zabbix.get_items",
            ToolName::ZabbixGetTriggers => "zabbix.get_triggers",
            ToolName::ZabbixGetItemsBatch => "zabbix.get_items_batch",
            ToolName::ZabbixGetItemsBatchWithHistory => "zabbix.get_items_batch_with_history",
            ToolName::ZabbixApiRequest => "zabbix.api_request",
        }
    }

    /// Credential-store tool type that backs this operation.
    pub fn tool_type(self) -> &'static str {
        match self {
            ToolName::SshExecuteCommand
            | ToolName::SshTestConnectivity
            | ToolName::SshGetServerInfo => "ssh",
            _ => "zabbix",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ToolError> {
        let trimmed = raw.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|tool| tool.as_str() == trimmed)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|tool| tool.as_str()).collect();
                ToolError::invalid_params(format!("Unknown tool: {}", trimmed))
                    .with_hint(format!("Known tools: {}", known.join(", ")))
                    .with_details(serde_json::json!({ "known_tools": known }))
            })
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub cancel: CancellationToken,
    pub incident_id: String,
    pub tool: ToolName,
    pub args: Value,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Returns the JSON-encoded result payload.
    async fn handle(&self, call: ToolCall) -> Result<String, ToolError>;
}

#[derive(Clone)]
pub struct ToolExecutor {
    logger: Logger,
    handlers: Arc<HashMap<ToolName, Arc<dyn ToolHandler>>>,
}

impl ToolExecutor {
    pub fn new(logger: Logger, handlers: HashMap<ToolName, Arc<dyn ToolHandler>>) -> Self {
        Self {
            logger: logger.child("executor"),
            handlers: Arc::new(handlers),
        }
    }

    pub fn registered_tools(&self) -> Vec<ToolName> {
        let mut tools: Vec<ToolName> = self.handlers.keys().copied().collect();
        tools.sort_by_key(|tool| tool.as_str());
        tools
    }

    pub async fn execute(
        &self,
        cancel: CancellationToken,
        incident_id: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<String, ToolError> {
        let tool = ToolName::parse(tool_name)?;
        let handler = self.handlers.get(&tool).cloned().ok_or_else(|| {
            ToolError::not_found(format!("Tool is not registered: {}", tool))
        })?;
        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };
        if !args.is_object() {
            return Err(ToolError::invalid_params("Tool arguments must be an object"));
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        self.logger.debug(
            "tool call started",
            Some(&serde_json::json!({
                "call_id": call_id,
                "tool": tool.as_str(),
                "incident_id": incident_id,
            })),
        );

        let result = handler
            .handle(ToolCall {
                cancel,
                incident_id: incident_id.to_string(),
                tool,
                args,
            })
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(payload) => self.logger.info(
                "tool call finished",
                Some(&serde_json::json!({
                    "call_id": call_id,
                    "tool": tool.as_str(),
                    "incident_id": incident_id,
                    "duration_ms": duration_ms,
                    "bytes": payload.len(),
                })),
            ),
            Err(err) => self.logger.warn(
                "tool call failed",
                Some(&serde_json::json!({
                    "call_id": call_id,
                    "tool": tool.as_str(),
                    "incident_id": incident_id,
                    "duration_ms": duration_ms,
                    "kind": err.kind,
                    "code": err.code,
                    "error": err.message,
                })),
            ),
        }
        result
    }
}
