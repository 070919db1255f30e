mod rpc_error;
mod tool_error;

pub use rpc_error::{RpcError, SettingsError};
pub use tool_error::{ToolError, ToolErrorKind};
