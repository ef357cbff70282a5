pub mod agent_store;
pub mod app_state;
pub mod breaker;
pub mod call_log;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod prompt;
pub mod providers;
pub mod quota;
pub mod rate_limiter;
pub mod upstream;
