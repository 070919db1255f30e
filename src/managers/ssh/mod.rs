pub mod config;
pub mod transport;

use crate::errors::{ToolError, ToolErrorKind};
use crate::services::credentials::CredentialStore;
use crate::services::logger::Logger;
use crate::services::security::{clean_command, CommandValidator};
use crate::services::tool_executor::{ToolCall, ToolHandler, ToolName};
use crate::services::validation::Validation;
use crate::utils::json::to_result_string;
use crate::utils::text::command_preview;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use config::{SshHost, SshKey, SshSettings};
use transport::{ConnectOptions, Ssh2Transport, SshTransport};

pub const SSH_TOOL_TYPE: &str = "ssh";

const SERVER_INFO_COMMAND: &str = concat!(
    r#"echo "HOSTNAME=$(hostname)" && "#,
    r#"echo "OS=$(cat /etc/os-release 2>/dev/null | grep PRETTY_NAME | cut -d'"' -f2 || uname -s)" && "#,
    r#"echo "UPTIME=$(uptime -p 2>/dev/null || uptime | awk -F'up ' '{print $2}' | awk -F',' '{print $1}')""#,
);

#[derive(Debug, Clone, Serialize)]
pub struct ServerResult {
    pub server: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerResult {
    fn failed(server: &str, error: String, started: Instant) -> Self {
        Self {
            server: server.to_string(),
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecuteSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecuteResult {
    pub results: Vec<ServerResult>,
    pub summary: ExecuteSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteResult {
    fn config_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    fn from_results(results: Vec<ServerResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            summary: ExecuteSummary {
                total: results.len(),
                succeeded,
                failed: results.len() - succeeded,
            },
            results,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityEntry {
    pub server: String,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectivitySummary {
    pub total: usize,
    pub reachable: usize,
    pub unreachable: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectivityResult {
    pub results: Vec<ConnectivityEntry>,
    pub summary: ConnectivitySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectivityResult {
    fn config_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct SshManager {
    logger: Logger,
    validation: Validation,
    validator: Arc<CommandValidator>,
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn SshTransport>,
    known_hosts: Arc<DashMap<String, String>>,
}

impl SshManager {
    pub fn new(
        logger: Logger,
        validation: Validation,
        validator: Arc<CommandValidator>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            logger: logger.child("ssh"),
            validation,
            validator,
            store,
            transport: Arc::new(Ssh2Transport),
            known_hosts: Arc::new(DashMap::new()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn SshTransport>) -> Self {
        self.transport = transport;
        self
    }

    async fn load_settings(
        &self,
        incident_id: &str,
        instance_id: Option<u64>,
    ) -> Result<SshSettings, ToolError> {
        let creds = self
            .store
            .fetch_credentials(incident_id, SSH_TOOL_TYPE, instance_id)
            .await?;
        Ok(SshSettings::from_settings(&creds.settings)?)
    }

    pub async fn execute_command(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        command: &str,
        servers: &[String],
        instance_id: Option<u64>,
    ) -> Result<ExecuteResult, ToolError> {
        let command = match clean_command(command) {
            Ok(command) => command,
            Err(err) => return Ok(ExecuteResult::config_error(err.message)),
        };
        let settings = match self.load_settings(incident_id, instance_id).await {
            Ok(settings) => settings,
            Err(err) if err.kind == ToolErrorKind::InvalidParams => {
                return Ok(ExecuteResult::config_error(err.message))
            }
            Err(err) => return Err(err),
        };
        if settings.hosts.is_empty() {
            return Ok(ExecuteResult::config_error("No SSH hosts configured"));
        }
        if settings.keys.is_empty() {
            return Ok(ExecuteResult::config_error("No SSH keys configured"));
        }
        let targets = match settings.select_hosts(servers) {
            Ok(targets) => targets,
            Err(err) => return Ok(ExecuteResult::config_error(err.message)),
        };

        self.logger.info(
            "Executing command",
            Some(&serde_json::json!({
                "incident_id": incident_id,
                "command": command_preview(&command),
                "hosts": targets.len(),
            })),
        );

        let options = self.connect_options(&settings);
        let futures = targets.iter().map(|host| {
            let key = settings.key_for(host).cloned();
            self.execute_on_host(cancel, host.clone(), key, &command, &settings, &options)
        });
        let results = futures::future::join_all(futures).await;
        Ok(ExecuteResult::from_results(results))
    }

    async fn execute_on_host(
        &self,
        cancel: &CancellationToken,
        host: SshHost,
        key: Result<SshKey, ToolError>,
        command: &str,
        settings: &SshSettings,
        options: &ConnectOptions,
    ) -> ServerResult {
        let started = Instant::now();
        if let Err(err) = self.validator.validate(command, host.allow_write_commands) {
            self.logger.warn(
                "Command blocked by read-only policy",
                Some(&serde_json::json!({
                    "server": host.hostname,
                    "command": command_preview(command),
                })),
            );
            return ServerResult::failed(&host.hostname, err.message, started);
        }
        let key = match key {
            Ok(key) => key,
            Err(err) => return ServerResult::failed(&host.hostname, err.message, started),
        };

        if cancel.is_cancelled() {
            return ServerResult::failed(&host.hostname, "Cancelled by caller".to_string(), started);
        }

        let abort = Arc::new(AtomicBool::new(false));
        let command_timeout = settings.command_timeout;
        let task = {
            let host = host.clone();
            let options = options.clone();
            let command = command.to_string();
            let abort = abort.clone();
            let transport = self.transport.clone();
            tokio::task::spawn_blocking(move || {
                transport.execute(&host, &key, &command, command_timeout, &options, &abort)
            })
        };

        let backstop = settings.connect_timeout * 2 + command_timeout;
        let outcome = tokio::select! {
            joined = task => joined.unwrap_or_else(|err| {
                Err(ToolError::internal(format!("SSH worker failed: {}", err)))
            }),
            _ = tokio::time::sleep(backstop) => {
                abort.store(true, Ordering::SeqCst);
                Err(ToolError::timeout(format!(
                    "Command timed out after {}s",
                    command_timeout.as_secs()
                )))
            }
            _ = cancel.cancelled() => {
                abort.store(true, Ordering::SeqCst);
                Err(ToolError::cancelled("Cancelled by caller"))
            }
        };

        match outcome {
            Ok(output) => ServerResult {
                server: host.hostname.clone(),
                success: output.exit_code == 0,
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
            Err(err) => {
                self.logger.warn(
                    "Host execution failed",
                    Some(&serde_json::json!({
                        "server": host.hostname,
                        "kind": err.kind,
                        "error": err.message,
                    })),
                );
                ServerResult::failed(&host.hostname, err.message, started)
            }
        }
    }

    pub async fn test_connectivity(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        servers: &[String],
        instance_id: Option<u64>,
    ) -> Result<ConnectivityResult, ToolError> {
        let settings = match self.load_settings(incident_id, instance_id).await {
            Ok(settings) => settings,
            Err(err) if err.kind == ToolErrorKind::InvalidParams => {
                return Ok(ConnectivityResult::config_error(err.message))
            }
            Err(err) => return Err(err),
        };
        if settings.hosts.is_empty() {
            return Ok(ConnectivityResult::config_error("No SSH hosts configured"));
        }
        if settings.keys.is_empty() {
            return Ok(ConnectivityResult::config_error("No SSH keys configured"));
        }
        let targets = match settings.select_hosts(servers) {
            Ok(targets) => targets,
            Err(err) => return Ok(ConnectivityResult::config_error(err.message)),
        };

        let options = self.connect_options(&settings);
        let futures = targets.iter().map(|host| {
            let key = settings.key_for(host).cloned();
            self.reach_host(cancel, host.clone(), key, &settings, &options)
        });
        let results = futures::future::join_all(futures).await;
        let reachable = results.iter().filter(|r| r.reachable).count();
        Ok(ConnectivityResult {
            summary: ConnectivitySummary {
                total: results.len(),
                reachable,
                unreachable: results.len() - reachable,
            },
            results,
            error: None,
        })
    }

    async fn reach_host(
        &self,
        cancel: &CancellationToken,
        host: SshHost,
        key: Result<SshKey, ToolError>,
        settings: &SshSettings,
        options: &ConnectOptions,
    ) -> ConnectivityEntry {
        let unreachable = |server: &str, error: String| ConnectivityEntry {
            server: server.to_string(),
            reachable: false,
            error: Some(error),
        };
        let key = match key {
            Ok(key) => key,
            Err(err) => return unreachable(&host.hostname, err.message),
        };
        if cancel.is_cancelled() {
            return unreachable(&host.hostname, "Cancelled by caller".to_string());
        }
        let task = {
            let host = host.clone();
            let options = options.clone();
            let transport = self.transport.clone();
            tokio::task::spawn_blocking(move || transport.handshake(&host, &key, &options))
        };
        let backstop = settings.connect_timeout * 2 + Duration::from_secs(1);
        let outcome = tokio::select! {
            joined = task => joined.unwrap_or_else(|err| {
                Err(ToolError::internal(format!("SSH worker failed: {}", err)))
            }),
            _ = tokio::time::sleep(backstop) => Err(ToolError::timeout(format!(
                "Connection timed out after {}s",
                backstop.as_secs()
            ))),
            _ = cancel.cancelled() => Err(ToolError::cancelled("Cancelled by caller")),
        };
        match outcome {
            Ok(()) => ConnectivityEntry {
                server: host.hostname,
                reachable: true,
                error: None,
            },
            Err(err) => unreachable(&host.hostname, err.message),
        }
    }

    pub async fn get_server_info(
        &self,
        cancel: &CancellationToken,
        incident_id: &str,
        servers: &[String],
        instance_id: Option<u64>,
    ) -> Result<ExecuteResult, ToolError> {
        self.execute_command(cancel, incident_id, SERVER_INFO_COMMAND, servers, instance_id)
            .await
    }

    fn connect_options(&self, settings: &SshSettings) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: settings.connect_timeout,
            policy: settings.known_hosts_policy,
            known_hosts: self.known_hosts.clone(),
            logger: self.logger.clone(),
        }
    }
}

#[async_trait]
impl ToolHandler for SshManager {
    async fn handle(&self, call: ToolCall) -> Result<String, ToolError> {
        let servers = self.validation.string_list(&call.args, "servers");
        let instance_id = self.validation.optional_u64(&call.args, "tool_instance_id");
        match call.tool {
            ToolName::SshExecuteCommand => {
                let command = self
                    .validation
                    .optional_string(&call.args, "command")
                    .unwrap_or_default();
                let result = self
                    .execute_command(&call.cancel, &call.incident_id, &command, &servers, instance_id)
                    .await?;
                to_result_string(&result)
            }
            ToolName::SshTestConnectivity => {
                let result = self
                    .test_connectivity(&call.cancel, &call.incident_id, &servers, instance_id)
                    .await?;
                to_result_string(&result)
            }
            ToolName::SshGetServerInfo => {
                let result = self
                    .get_server_info(&call.cancel, &call.incident_id, &servers, instance_id)
                    .await?;
                to_result_string(&result)
            }
            other => Err(ToolError::invalid_params(format!(
                "{} is not an SSH operation",
                other
            ))),
        }
    }
}
