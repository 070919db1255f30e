use crate::errors::{ToolError, ToolErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error object returned inside a JSON-RPC response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("Zabbix API error: {message} (code: {code}, data: {data})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: String,
}

impl From<RpcError> for ToolError {
    fn from(err: RpcError) -> Self {
        let message = err.to_string();
        ToolError::new(ToolErrorKind::RemoteApi, "RPC_ERROR", message).with_details(
            serde_json::json!({
                "code": err.code,
                "message": err.message,
                "data": err.data,
            }),
        )
    }
}

/// Raised while decoding a loosely typed settings map into a typed config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("{field} must be {expected}")]
    InvalidType {
        field: String,
        expected: &'static str,
    },
    #[error("{field} is out of range: {value}")]
    OutOfRange { field: String, value: String },
    #[error("{field} is required")]
    Missing { field: String },
}

impl From<SettingsError> for ToolError {
    fn from(err: SettingsError) -> Self {
        ToolError::invalid_params(format!("Invalid tool settings: {}", err))
            .with_hint("Fix the tool instance settings in the credential store.")
    }
}
