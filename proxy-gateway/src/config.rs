use anyhow::Context;
use std::env;
use std::time::Duration;

/// Process configuration, enumerated in spec.md §6 "Process configuration".
///
/// Follows `integration-gateway/src/config.rs`'s `from_env` style: required
/// values via `anyhow::Context`, optional ones via `.ok().and_then(...)`
/// with a documented default, numeric values clamped with `.max`/`.min`.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub database_url: String,
    pub redis_url: String,
    pub prompt_master_key_base64: String,

    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,

    pub free_tier_limit: u32,
    pub paid_tier_limit: u32,
    pub rate_window_seconds: u64,

    pub quota_trial_size: i64,
    pub quota_free_grant: i64,

    pub deadline_default: Duration,
    pub deadline_min: Duration,
    pub deadline_max: Duration,

    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_open_timeout: Duration,

    pub allowed_cors_origins: Vec<String>,
    pub metrics_port: u16,
    pub http_port: u16,

    pub key_cache_ttl: Duration,
    pub agent_cache_ttl: Duration,
    pub shutdown_drain: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
        let prompt_master_key_base64 =
            env::var("PROMPT_MASTER_KEY").context("PROMPT_MASTER_KEY must be set (base64, 32 bytes)")?;

        let openai_api_key = env::var("OPENAI_API_KEY").ok();
        let anthropic_api_key = env::var("ANTHROPIC_API_KEY").ok();
        let google_api_key = env::var("GOOGLE_API_KEY").ok();

        let free_tier_limit = env_u32("RATE_LIMIT_FREE_PER_MINUTE").unwrap_or(10).max(1);
        let paid_tier_limit = env_u32("RATE_LIMIT_PAID_PER_MINUTE").unwrap_or(1000).max(1);
        let rate_window_seconds = env_u64("RATE_LIMIT_WINDOW_SECONDS").unwrap_or(60).max(1);

        let quota_trial_size = env_i64("QUOTA_TRIAL_SIZE").unwrap_or(3).max(0);
        let quota_free_grant = env_i64("QUOTA_FREE_GRANT").unwrap_or(100).max(0);

        let deadline_default_secs = env_u64("DEADLINE_DEFAULT_SECONDS").unwrap_or(30);
        let deadline_min_secs = env_u64("DEADLINE_MIN_SECONDS").unwrap_or(5);
        let deadline_max_secs = env_u64("DEADLINE_MAX_SECONDS").unwrap_or(120);
        let deadline_default =
            Duration::from_secs(deadline_default_secs.clamp(deadline_min_secs, deadline_max_secs));

        let breaker_failure_threshold = env_u32("BREAKER_FAILURE_THRESHOLD").unwrap_or(5).max(1);
        let breaker_success_threshold = env_u32("BREAKER_SUCCESS_THRESHOLD").unwrap_or(3).max(1);
        let breaker_open_timeout = Duration::from_secs(env_u64("BREAKER_OPEN_TIMEOUT_SECONDS").unwrap_or(30));

        let allowed_cors_origins = env::var("ALLOWED_CORS_ORIGINS")
            .ok()
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let metrics_port = env_u32("METRICS_PORT").unwrap_or(9090).min(65535) as u16;
        let http_port = env_u32("HTTP_PORT").unwrap_or(8080).min(65535) as u16;

        let key_cache_ttl = Duration::from_secs(env_u64("KEY_CACHE_TTL_SECONDS").unwrap_or(5).max(1));
        let agent_cache_ttl = Duration::from_secs(env_u64("AGENT_CACHE_TTL_SECONDS").unwrap_or(600).max(1));
        let shutdown_drain = Duration::from_secs(env_u64("SHUTDOWN_DRAIN_SECONDS").unwrap_or(60));

        Ok(Self {
            database_url,
            redis_url,
            prompt_master_key_base64,
            openai_api_key,
            anthropic_api_key,
            google_api_key,
            free_tier_limit,
            paid_tier_limit,
            rate_window_seconds,
            quota_trial_size,
            quota_free_grant,
            deadline_default,
            deadline_min: Duration::from_secs(deadline_min_secs),
            deadline_max: Duration::from_secs(deadline_max_secs),
            breaker_failure_threshold,
            breaker_success_threshold,
            breaker_open_timeout,
            allowed_cors_origins,
            metrics_port,
            http_port,
            key_cache_ttl,
            agent_cache_ttl,
            shutdown_drain,
        })
    }

    /// Clamp a caller- or config-suggested deadline into `[min, max]` per spec.md §4.8.
    pub fn clamp_deadline(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.deadline_default)
            .clamp(self.deadline_min, self.deadline_max)
    }
}

fn env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_i64(name: &str) -> Option<i64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
