pub mod cache;
pub mod credentials;
pub mod logger;
pub mod rate_limiter;
pub mod security;
pub mod tool_executor;
pub mod validation;
