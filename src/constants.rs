pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_COMMAND_SECS: u64 = 30;
    pub const TIMEOUT_SSH_CONNECT_SECS: u64 = 10;
    pub const TIMEOUT_API_REQUEST_SECS: u64 = 30;
    pub const KEEPALIVE_INTERVAL_SECS: u32 = 30;
}

pub mod limits {
    pub const COMMAND_PREVIEW_LENGTH: usize = 80;
    pub const MAX_CAPTURE_BYTES: usize = 256 * 1024;
    pub const MAX_BODY_PREVIEW_BYTES: usize = 512;
}

pub mod cache {
    pub const CONFIG_TTL_MS: u64 = 5 * 60_000;
    pub const RESPONSE_TTL_MS: u64 = 30_000;
    pub const PROBLEMS_TTL_MS: u64 = 15_000;
    pub const HISTORY_BATCH_TTL_MS: u64 = 15_000;
    pub const AUTH_TTL_MS: u64 = 30 * 60_000;
    pub const CLEANUP_INTERVAL_MS: u64 = 60_000;
}

pub mod rate_limit {
    pub const ZABBIX_RATE_PER_SEC: f64 = 10.0;
    pub const ZABBIX_BURST: u32 = 20;
    pub const MIN_WAIT_MS: u64 = 1;
    pub const MAX_WAIT_MS: u64 = 1_000;
}

pub mod zabbix {
    pub const API_PATH: &str = "/api_jsonrpc.php";
    pub const JSONRPC_VERSION: &str = "2.0";
    pub const CONTENT_TYPE: &str = "application/json-rpc";
    pub const BATCH_LIMIT_PER_SEARCH: usize = 10;
    pub const BATCH_HISTORY_LIMIT: usize = 5;
    pub const BATCH_MAX_HISTORY_ITEMS: usize = 50;
    pub const MAX_SEVERITY: i64 = 5;
}
