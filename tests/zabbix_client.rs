mod common;
use common::{zabbix_store, INCIDENT};

use mockito::Matcher;
use opsgate::errors::ToolErrorKind;
use opsgate::managers::zabbix::{ZabbixManager, ZabbixTunables};
use opsgate::services::credentials::MemoryCredentialStore;
use opsgate::services::logger::Logger;
use opsgate::services::rate_limiter::RateLimiter;
use opsgate::services::validation::Validation;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn manager(store: Arc<MemoryCredentialStore>, limiter: Arc<RateLimiter>) -> ZabbixManager {
    ZabbixManager::new(
        Logger::new("test"),
        Validation::new(),
        store,
        limiter,
        &ZabbixTunables::default(),
    )
}

fn rpc_result(result: Value) -> String {
    json!({ "jsonrpc": "2.0", "result": result, "id": 1 }).to_string()
}

#[tokio::test]
async fn repeated_problem_query_hits_cache() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api_jsonrpc.php")
        .match_header("content-type", "application/json-rpc")
        .match_body(Matcher::PartialJson(json!({
            "jsonrpc": "2.0",
            "method": "problem.get",
            "auth": "api-token",
            "params": { "severities": [4, 5] }
        })))
        .with_status(200)
        .with_body(rpc_result(json!([{ "eventid": "901", "name": "Disk full" }])))
        .expect(1)
        .create_async()
        .await;

    let limiter = Arc::new(RateLimiter::new(0.0, 5));
    let zabbix = manager(zabbix_store(&server.url()), limiter.clone());
    let cancel = CancellationToken::new();
    let args = json!({ "severity_min": 4 });

    let first = zabbix.get_problems(&cancel, INCIDENT, &args).await.expect("first");
    let second = zabbix.get_problems(&cancel, INCIDENT, &args).await.expect("second");

    assert_eq!(first, second);
    assert_eq!(first[0]["eventid"], json!("901"));
    assert!((limiter.tokens() - 4.0).abs() < 1e-9);
    mock.assert_async().await;
    zabbix.stop();
}

#[tokio::test]
async fn login_token_is_cached_per_user() {
    let mut server = mockito::Server::new_async().await;
    let login = server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({
            "method": "user.login",
            "params": { "user": "ops", "password": "secret" }
        })))
        .with_status(200)
        .with_body(rpc_result(json!("session-1")))
        .expect(1)
        .create_async()
        .await;
    let items = server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({ "method": "item.get", "auth": "session-1" })))
        .with_status(200)
        .with_body(rpc_result(json!([])))
        .expect(2)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    store.insert(
        "zabbix",
        "zbx",
        json!({
            "zabbix_url": format!("{}/", server.url()),
            "zabbix_user": "ops",
            "zabbix_password": "secret"
        }),
    );
    let zabbix = manager(store, Arc::new(RateLimiter::new(100.0, 100)));
    let cancel = CancellationToken::new();

    zabbix
        .get_items(&cancel, INCIDENT, &json!({ "limit": 1 }))
        .await
        .expect("first");
    zabbix
        .get_items(&cancel, INCIDENT, &json!({ "limit": 2 }))
        .await
        .expect("second");

    login.assert_async().await;
    items.assert_async().await;
}

#[tokio::test]
async fn rpc_error_keeps_code_and_data() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api_jsonrpc.php")
        .with_status(200)
        .with_body(
            json!({
                "jsonrpc": "2.0",
                "error": { "code": -32602, "message": "Invalid params.", "data": "No permissions to referred object." },
                "id": 1
            })
            .to_string(),
        )
        .create_async()
        .await;

    let zabbix = manager(zabbix_store(&server.url()), Arc::new(RateLimiter::new(100.0, 100)));
    let err = zabbix
        .get_triggers(&CancellationToken::new(), INCIDENT, &json!({}))
        .await
        .expect_err("rpc error");

    assert_eq!(err.kind, ToolErrorKind::RemoteApi);
    assert_eq!(err.code, "RPC_ERROR");
    let details = err.details.expect("details");
    assert_eq!(details["code"], json!(-32602));
    assert_eq!(details["data"], json!("No permissions to referred object."));
}

#[tokio::test]
async fn http_status_error_is_distinct_from_transport() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api_jsonrpc.php")
        .with_status(500)
        .with_body("upstream exploded")
        .create_async()
        .await;

    let zabbix = manager(zabbix_store(&server.url()), Arc::new(RateLimiter::new(100.0, 100)));
    let err = zabbix
        .get_hosts(&CancellationToken::new(), INCIDENT, &json!({}))
        .await
        .expect_err("http 500");

    assert_eq!(err.code, "HTTP_STATUS");
    assert_eq!(err.message, "HTTP error 500: upstream exploded");
    assert!(!err.retryable);
}

#[tokio::test]
async fn batch_deduplicates_across_patterns() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({
            "method": "item.get",
            "params": { "search": { "key_": "system.cpu" }, "limit": 4 }
        })))
        .with_status(200)
        .with_body(rpc_result(json!([
            { "itemid": "1", "key_": "system.cpu.util" },
            { "itemid": "2", "key_": "system.cpu.load" }
        ])))
        .create_async()
        .await;
    server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({
            "method": "item.get",
            "params": { "search": { "key_": "system.cpu.load" } }
        })))
        .with_status(200)
        .with_body(rpc_result(json!([
            { "itemid": "2", "key_": "system.cpu.load" },
            { "itemid": "3", "key_": "system.cpu.load[all,avg5]" }
        ])))
        .create_async()
        .await;
    server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({
            "method": "item.get",
            "params": { "search": { "key_": "vfs.fs" } }
        })))
        .with_status(500)
        .create_async()
        .await;

    let zabbix = manager(zabbix_store(&server.url()), Arc::new(RateLimiter::new(100.0, 100)));
    let batch = zabbix
        .get_items_batch(
            &CancellationToken::new(),
            INCIDENT,
            &json!({ "searches": ["system.cpu", "system.cpu.load", "vfs.fs"], "limit_per_search": 2 }),
        )
        .await
        .expect("batch");

    assert_eq!(batch.pattern_count, 3);
    assert_eq!(batch.total_unique, 3);
    assert_eq!(batch.results[0].count, 2);
    assert_eq!(batch.results[1].count, 1);
    assert_eq!(batch.results[1].items[0]["itemid"], json!("3"));
    assert_eq!(batch.results[2].count, 0);
}

#[tokio::test]
async fn batch_patterns_share_one_login() {
    let mut server = mockito::Server::new_async().await;
    let login = server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({ "method": "user.login" })))
        .with_status(200)
        .with_body(rpc_result(json!("session-7")))
        .expect(1)
        .create_async()
        .await;
    let items = server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({ "method": "item.get", "auth": "session-7" })))
        .with_status(200)
        .with_body(rpc_result(json!([])))
        .expect(3)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    store.insert(
        "zabbix",
        "zbx",
        json!({
            "zabbix_url": server.url(),
            "zabbix_user": "ops",
            "zabbix_password": "secret"
        }),
    );
    let zabbix = manager(store.clone(), Arc::new(RateLimiter::new(100.0, 100)));
    let batch = zabbix
        .get_items_batch(
            &CancellationToken::new(),
            INCIDENT,
            &json!({ "searches": ["system.cpu", "vm.memory", "net.if"] }),
        )
        .await
        .expect("batch");

    assert_eq!(batch.pattern_count, 3);
    assert_eq!(store.fetch_count(), 1);
    login.assert_async().await;
    items.assert_async().await;
    zabbix.stop();
}

#[tokio::test]
async fn batch_with_history_attaches_history() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({ "method": "item.get" })))
        .with_status(200)
        .with_body(rpc_result(json!([{ "itemid": "7", "key_": "agent.ping" }])))
        .create_async()
        .await;
    let history = server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({
            "method": "history.get",
            "params": { "itemids": ["7"], "limit": 3 }
        })))
        .with_status(200)
        .with_body(rpc_result(json!([{ "itemid": "7", "clock": "1700000000", "value": "1" }])))
        .expect(1)
        .create_async()
        .await;

    let zabbix = manager(zabbix_store(&server.url()), Arc::new(RateLimiter::new(100.0, 100)));
    let result = zabbix
        .get_items_batch_with_history(
            &CancellationToken::new(),
            INCIDENT,
            &json!({ "searches": "agent.ping", "history_limit": 3 }),
        )
        .await
        .expect("batch with history");

    assert_eq!(result["items"]["total_unique"], json!(1));
    assert_eq!(result["history"][0]["value"], json!("1"));
    history.assert_async().await;
}

#[tokio::test]
async fn api_request_is_never_cached() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api_jsonrpc.php")
        .match_body(Matcher::PartialJson(json!({ "method": "hostgroup.get", "params": {} })))
        .with_status(200)
        .with_body(rpc_result(json!([])))
        .expect(2)
        .create_async()
        .await;

    let zabbix = manager(zabbix_store(&server.url()), Arc::new(RateLimiter::new(100.0, 100)));
    let cancel = CancellationToken::new();
    let args = json!({ "method": "hostgroup.get" });
    zabbix.api_request(&cancel, INCIDENT, &args).await.expect("first");
    zabbix.api_request(&cancel, INCIDENT, &args).await.expect("second");
    mock.assert_async().await;
}

#[tokio::test]
async fn invalidation_refetches_credentials() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api_jsonrpc.php")
        .with_status(200)
        .with_body(rpc_result(json!([])))
        .create_async()
        .await;

    let store = zabbix_store(&server.url());
    let zabbix = manager(store.clone(), Arc::new(RateLimiter::new(100.0, 100)));
    let cancel = CancellationToken::new();

    zabbix.get_hosts(&cancel, INCIDENT, &json!({})).await.expect("first");
    zabbix.get_hosts(&cancel, INCIDENT, &json!({})).await.expect("second");
    assert_eq!(store.fetch_count(), 1);

    assert_eq!(zabbix.invalidate_incident(INCIDENT), 1);
    assert_eq!(zabbix.invalidate_incident("inc-other"), 0);
    zabbix.get_hosts(&cancel, INCIDENT, &json!({})).await.expect("third");
    assert_eq!(store.fetch_count(), 2);

    zabbix.clear_caches();
    zabbix.get_hosts(&cancel, INCIDENT, &json!({})).await.expect("fourth");
    assert_eq!(store.fetch_count(), 3);
}

#[tokio::test]
async fn updated_settings_apply_after_invalidation() {
    let mut old = mockito::Server::new_async().await;
    let old_hosts = old
        .mock("POST", "/api_jsonrpc.php")
        .with_status(200)
        .with_body(rpc_result(json!([{ "hostid": "1" }])))
        .expect(1)
        .create_async()
        .await;
    let mut new = mockito::Server::new_async().await;
    let new_hosts = new
        .mock("POST", "/api_jsonrpc.php")
        .with_status(200)
        .with_body(rpc_result(json!([{ "hostid": "2" }])))
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryCredentialStore::new());
    let id = store.insert(
        "zabbix",
        "prod-zabbix",
        json!({ "zabbix_url": old.url(), "zabbix_token": "api-token" }),
    );
    let zabbix = manager(store.clone(), Arc::new(RateLimiter::new(100.0, 100)));
    let cancel = CancellationToken::new();

    let first = zabbix.get_hosts(&cancel, INCIDENT, &json!({})).await.expect("first");
    assert!(store.update_settings(id, json!({ "zabbix_url": new.url(), "zabbix_token": "api-token" })));
    assert!(!store.update_settings(id + 100, json!({})));
    let stale = zabbix.get_hosts(&cancel, INCIDENT, &json!({})).await.expect("stale");
    assert_eq!(first, stale);

    zabbix.invalidate_incident(INCIDENT);
    let fresh = zabbix.get_hosts(&cancel, INCIDENT, &json!({})).await.expect("fresh");
    assert_eq!(fresh[0]["hostid"], json!("2"));

    old_hosts.assert_async().await;
    new_hosts.assert_async().await;
    zabbix.stop();
}

#[tokio::test]
async fn cancelled_caller_never_reaches_network() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api_jsonrpc.php")
        .with_status(200)
        .with_body(rpc_result(json!([])))
        .expect(0)
        .create_async()
        .await;

    let zabbix = manager(zabbix_store(&server.url()), Arc::new(RateLimiter::new(100.0, 100)));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = zabbix
        .get_problems(&cancel, INCIDENT, &json!({}))
        .await
        .expect_err("cancelled");

    assert_eq!(err.kind, ToolErrorKind::Cancelled);
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_url_and_auth_are_config_errors() {
    let store = Arc::new(MemoryCredentialStore::new());
    store.insert("zabbix", "zbx", json!({ "zabbix_token": "t" }));
    let zabbix = manager(store, Arc::new(RateLimiter::new(100.0, 100)));
    let err = zabbix
        .get_hosts(&CancellationToken::new(), INCIDENT, &json!({}))
        .await
        .expect_err("no url");
    assert_eq!(err.message, "Zabbix URL not configured");

    let store = Arc::new(MemoryCredentialStore::new());
    store.insert("zabbix", "zbx", json!({ "zabbix_url": "http://127.0.0.1:9" }));
    let zabbix = manager(store, Arc::new(RateLimiter::new(100.0, 100)));
    let err = zabbix
        .get_hosts(&CancellationToken::new(), INCIDENT, &json!({}))
        .await
        .expect_err("no auth");
    assert_eq!(err.message, "no authentication method configured");
}
