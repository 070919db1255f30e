mod common;
use common::{closed_port, ssh_host, ssh_store, INCIDENT};

use opsgate::errors::ToolErrorKind;
use opsgate::managers::ssh::SshManager;
use opsgate::services::credentials::MemoryCredentialStore;
use opsgate::services::logger::Logger;
use opsgate::services::security::CommandValidator;
use opsgate::services::validation::Validation;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn manager(store: Arc<MemoryCredentialStore>) -> SshManager {
    SshManager::new(
        Logger::new("test"),
        Validation::new(),
        Arc::new(CommandValidator::new()),
        store,
    )
}

#[tokio::test]
async fn unreachable_hosts_fail_individually() {
    let store = ssh_store(vec![
        ssh_host("web-1", closed_port()),
        ssh_host("web-2", closed_port()),
        ssh_host("db-1", closed_port()),
    ]);
    let result = manager(store)
        .execute_command(&CancellationToken::new(), INCIDENT, "uptime", &[], None)
        .await
        .expect("envelope");

    assert!(result.error.is_none());
    assert_eq!(result.summary.total, 3);
    assert_eq!(result.summary.failed, 3);
    assert_eq!(result.summary.succeeded, 0);
    for host in &result.results {
        assert_eq!(host.exit_code, -1);
        assert!(!host.success);
        assert!(host.error.as_deref().map(|e| !e.is_empty()).unwrap_or(false));
    }
}

#[tokio::test]
async fn unknown_server_fails_the_whole_call() {
    let store = ssh_store(vec![ssh_host("web-1", closed_port())]);
    let result = manager(store)
        .execute_command(
            &CancellationToken::new(),
            INCIDENT,
            "uptime",
            &["web-9".to_string()],
            None,
        )
        .await
        .expect("envelope");

    assert_eq!(result.error.as_deref(), Some("Server not configured: web-9"));
    assert!(result.results.is_empty());
}

#[tokio::test]
async fn blocked_command_never_dials() {
    let store = ssh_store(vec![ssh_host("web-1", closed_port())]);
    let result = manager(store)
        .execute_command(&CancellationToken::new(), INCIDENT, "rm -rf /var/log", &[], None)
        .await
        .expect("envelope");

    assert_eq!(result.summary.failed, 1);
    let error = result.results[0].error.clone().unwrap_or_default();
    assert!(error.contains("Command blocked"), "{}", error);
    assert!(error.contains("Allow Write Commands"), "{}", error);
}

#[tokio::test]
async fn empty_command_is_a_config_error() {
    let store = ssh_store(vec![ssh_host("web-1", closed_port())]);
    let result = manager(store)
        .execute_command(&CancellationToken::new(), INCIDENT, "   ", &[], None)
        .await
        .expect("envelope");
    assert_eq!(result.error.as_deref(), Some("command is required"));
}

#[tokio::test]
async fn missing_keys_are_reported() {
    let store = Arc::new(MemoryCredentialStore::new());
    store.insert(
        "ssh",
        "prod-ssh",
        serde_json::json!({ "ssh_hosts": [ssh_host("web-1", 22)] }),
    );
    let result = manager(store)
        .execute_command(&CancellationToken::new(), INCIDENT, "uptime", &[], None)
        .await
        .expect("envelope");
    assert_eq!(result.error.as_deref(), Some("No SSH keys configured"));
}

#[tokio::test]
async fn missing_instance_propagates_not_found() {
    let err = manager(Arc::new(MemoryCredentialStore::new()))
        .execute_command(&CancellationToken::new(), INCIDENT, "uptime", &[], None)
        .await
        .expect_err("no ssh instance");
    assert_eq!(err.kind, ToolErrorKind::NotFound);
}

#[tokio::test]
async fn connectivity_reports_unreachable_hosts() {
    let store = ssh_store(vec![
        ssh_host("web-1", closed_port()),
        ssh_host("web-2", closed_port()),
    ]);
    let result = manager(store)
        .test_connectivity(&CancellationToken::new(), INCIDENT, &["web-2".to_string()], None)
        .await
        .expect("envelope");

    assert_eq!(result.summary.total, 1);
    assert_eq!(result.summary.unreachable, 1);
    assert_eq!(result.results[0].server, "web-2");
    assert!(result.results[0].error.is_some());
}

#[tokio::test]
async fn cancelled_call_returns_promptly() {
    let store = ssh_store(vec![ssh_host("web-1", closed_port())]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = manager(store)
        .execute_command(&cancel, INCIDENT, "uptime", &[], None)
        .await
        .expect("envelope");
    assert_eq!(result.summary.failed, 1);
}
