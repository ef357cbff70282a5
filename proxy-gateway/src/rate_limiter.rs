use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Outcome of a rate-limit check (spec.md §4.5): whether the call is
/// admitted, the limit and remaining count for response headers, and — on
/// rejection — a `Retry-After` hint in seconds (minimum 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: Option<u64>,
}

/// Sliding-window per-tenant rate limiter. Grounded on the trait shape of
/// `integration-gateway/src/rate_limiter.rs`'s `RateLimiterEngine`, but the
/// algorithm itself is generalized from that file's fixed-window `INCR`s
/// to a true sliding window, per spec.md §4.5 ("remove entries older than
/// now − W, then count").
#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn check(&self, tenant_id: &str, limit: u32, window_seconds: u64) -> RateDecision;
}

/// Redis-backed sliding window using a per-tenant sorted set keyed by
/// nanosecond timestamps (spec.md §6 "Sliding-window entries are stored as
/// an ordered set keyed by nanosecond timestamps"). The whole check —
/// prune, count, conditionally insert — runs as one Lua script so no two
/// concurrent requests can both observe room for the last slot.
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    script: Script,
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ns = tonumber(ARGV[1])
local window_ns = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ns - window_ns)
local count = redis.call('ZCARD', key)

if count >= limit then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local retry_after_ns = window_ns
    if oldest[2] ~= nil then
        retry_after_ns = (tonumber(oldest[2]) + window_ns) - now_ns
    end
    return {0, count, retry_after_ns}
end

redis.call('ZADD', key, now_ns, now_ns .. '-' .. tostring(math.random(1, 1000000000)))
redis.call('PEXPIRE', key, math.ceil(window_ns / 1000000) + 1000)
return {1, count + 1, 0}
"#;

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn check(&self, tenant_id: &str, limit: u32, window_seconds: u64) -> RateDecision {
        let key = format!("{{ratelimit:{tenant_id}}}");
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        let window_ns = (window_seconds as i64).saturating_mul(1_000_000_000);

        let mut conn = self.conn.clone();
        let result: redis::RedisResult<(i64, i64, i64)> = self
            .script
            .key(&key)
            .arg(now_ns)
            .arg(window_ns)
            .arg(limit)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok((allowed, count, retry_after_ns)) => {
                let remaining = (limit as i64 - count).max(0) as u32;
                RateDecision {
                    allowed: allowed == 1,
                    limit,
                    remaining,
                    retry_after_secs: if allowed == 1 {
                        None
                    } else {
                        Some(((retry_after_ns.max(0) as u64) / 1_000_000_000).max(1))
                    },
                }
            }
            Err(error) => {
                // spec.md §4.5: "fail-open only if the counter store is
                // unreachable and only after logging; never fail-open on
                // arithmetic errors." A script invocation error here is a
                // store-reachability problem, not an arithmetic one.
                tracing::error!(%error, "rate limiter counter store unreachable, failing open");
                RateDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    retry_after_secs: None,
                }
            }
        }
    }
}

/// In-memory double for tests, mirroring
/// `integration-gateway/src/rate_limiter.rs`'s `InMemoryRateLimiter`.
pub struct InMemoryRateLimiter {
    windows: Mutex<HashMap<String, Vec<u128>>>,
    clock_offset_ns: Arc<Mutex<u128>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock_offset_ns: Arc::new(Mutex::new(0)),
        }
    }

    /// Test-only hook: advance the limiter's notion of "now" without sleeping,
    /// so P6's "a full W seconds later admissions resume" is cheap to assert.
    pub async fn advance_time(&self, nanos: u128) {
        let mut offset = self.clock_offset_ns.lock().await;
        *offset += nanos;
    }

    async fn now_ns(&self) -> u128 {
        let base = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        base + *self.clock_offset_ns.lock().await
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn check(&self, tenant_id: &str, limit: u32, window_seconds: u64) -> RateDecision {
        let now = self.now_ns().await;
        let window_ns = (window_seconds as u128) * 1_000_000_000;
        let mut windows = self.windows.lock().await;
        let entries = windows.entry(tenant_id.to_string()).or_default();
        entries.retain(|&ts| ts + window_ns > now);

        if entries.len() as u32 >= limit {
            let oldest = entries.first().copied().unwrap_or(now);
            let retry_after_ns = (oldest + window_ns).saturating_sub(now);
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_secs: Some(((retry_after_ns / 1_000_000_000) as u64).max(1)),
            };
        }

        entries.push(now);
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - entries.len() as u32,
            retry_after_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = InMemoryRateLimiter::new();
        for i in 0..10 {
            let decision = limiter.check("tenant-a", 10, 60).await;
            assert!(decision.allowed, "request {i} should be admitted");
        }
        let eleventh = limiter.check("tenant-a", 10, 60).await;
        assert!(!eleventh.allowed);
        assert!(eleventh.retry_after_secs.unwrap_or(0) >= 1);
    }

    #[tokio::test]
    async fn admissions_resume_after_full_window() {
        let limiter = InMemoryRateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check("tenant-b", 10, 60).await.allowed);
        }
        assert!(!limiter.check("tenant-b", 10, 60).await.allowed);
        limiter.advance_time(61_000_000_000).await;
        assert!(limiter.check("tenant-b", 10, 60).await.allowed);
    }

    #[tokio::test]
    async fn tenants_do_not_share_windows() {
        let limiter = InMemoryRateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check("tenant-c", 10, 60).await.allowed);
        }
        assert!(!limiter.check("tenant-c", 10, 60).await.allowed);
        assert!(limiter.check("tenant-d", 10, 60).await.allowed);
    }
}
