use crate::errors::ToolError;
use crate::managers;
use crate::managers::zabbix::ZabbixTunables;
use crate::services::credentials::CredentialStore;
use crate::services::logger::Logger;
use crate::services::rate_limiter::RateLimiter;
use crate::services::security::CommandValidator;
use crate::services::tool_executor::{ToolExecutor, ToolHandler, ToolName};
use crate::services::validation::Validation;
use std::collections::HashMap;
use std::sync::Arc;

pub struct App {
    pub logger: Logger,
    pub tool_executor: Arc<ToolExecutor>,
    pub ssh_manager: Arc<managers::ssh::SshManager>,
    pub zabbix_manager: Arc<managers::zabbix::ZabbixManager>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl App {
    fn validate_tool_wiring(
        handlers: &HashMap<ToolName, Arc<dyn ToolHandler>>,
    ) -> Result<(), ToolError> {
        let missing: Vec<&str> = ToolName::ALL
            .iter()
            .filter(|tool| !handlers.contains_key(tool))
            .map(|tool| tool.as_str())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(ToolError::internal("Tool wiring is incomplete")
            .with_hint("Every ToolName variant must be registered with a handler.")
            .with_details(serde_json::json!({ "missing_tools": missing })))
    }

    pub fn initialize(store: Arc<dyn CredentialStore>) -> Result<Self, ToolError> {
        Self::with_tunables(store, ZabbixTunables::from_env())
    }

    pub fn with_tunables(
        store: Arc<dyn CredentialStore>,
        tunables: ZabbixTunables,
    ) -> Result<Self, ToolError> {
        let logger = Logger::new("opsgate");
        let validation = Validation::new();
        let validator = Arc::new(CommandValidator::new());
        let rate_limiter = Arc::new(RateLimiter::new(tunables.rate_per_sec, tunables.burst));

        let ssh_manager = Arc::new(managers::ssh::SshManager::new(
            logger.clone(),
            validation.clone(),
            validator,
            store.clone(),
        ));
        let zabbix_manager = Arc::new(managers::zabbix::ZabbixManager::new(
            logger.clone(),
            validation,
            store,
            rate_limiter.clone(),
            &tunables,
        ));

        let mut handlers: HashMap<ToolName, Arc<dyn ToolHandler>> = HashMap::new();
        for tool in ToolName::ALL {
            let handler: Arc<dyn ToolHandler> = match tool.tool_type() {
                managers::ssh::SSH_TOOL_TYPE => ssh_manager.clone(),
                _ => zabbix_manager.clone(),
            };
            handlers.insert(tool, handler);
        }
        Self::validate_tool_wiring(&handlers)?;

        let tool_executor = Arc::new(ToolExecutor::new(logger.clone(), handlers));
        logger.info(
            "Initialized",
            Some(&serde_json::json!({
                "tools": ToolName::ALL.len(),
                "rate_per_sec": tunables.rate_per_sec,
                "burst": tunables.burst,
            })),
        );

        Ok(Self {
            logger,
            tool_executor,
            ssh_manager,
            zabbix_manager,
            rate_limiter,
        })
    }

    /// Stops background cache sweepers. Safe to call more than once.
    pub fn shutdown(&self) {
        self.zabbix_manager.stop();
        self.logger.info("Shut down", None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::credentials::MemoryCredentialStore;

    #[test]
    fn every_tool_is_wired() {
        let app = App::with_tunables(
            Arc::new(MemoryCredentialStore::new()),
            ZabbixTunables::default(),
        )
        .expect("initialize");
        assert_eq!(app.tool_executor.registered_tools().len(), ToolName::ALL.len());
        app.shutdown();
        app.shutdown();
    }

    #[test]
    fn empty_table_is_rejected() {
        let err = App::validate_tool_wiring(&HashMap::new()).expect_err("incomplete");
        assert!(err.details.is_some());
    }
}
