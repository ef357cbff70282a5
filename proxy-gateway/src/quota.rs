use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::warn;

/// Outcome of a quota reservation attempt (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Reserved from the tenant's main (paid + free) quota.
    Main,
    /// Reserved from the per-(tenant, agent) trial allowance.
    Trial,
    /// Neither quota nor trial allowance has room.
    Exhausted,
}

/// Abstracts the fast counter store used for admission decisions so the
/// pipeline and tests can swap Redis for an in-memory double, mirroring
/// `integration-gateway/src/rate_limiter.rs`'s `RateLimiterEngine` split.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Seed the counter from the durable tenant record if this is the first
    /// time this tenant has been seen by the counter store.
    async fn ensure_seeded(&self, tenant_id: &str, seed_remaining: i64);

    /// Atomically check-and-decrement by one. Returns the outcome and, on
    /// success, the new `remaining` value.
    async fn reserve(&self, tenant_id: &str, agent_id: &str, trial_size: i64, trial_enabled: bool) -> (ReserveOutcome, i64);

    /// Symmetric refund of a prior reservation (amount <= 0 is a no-op).
    async fn refund(&self, tenant_id: &str, agent_id: &str, outcome: ReserveOutcome);

    async fn remaining(&self, tenant_id: &str) -> i64;
}

const RESERVE_SCRIPT: &str = r#"
local quota_key = KEYS[1]
local trial_key = KEYS[2]
local trial_size = tonumber(ARGV[1])
local trial_enabled = tonumber(ARGV[2])

if trial_enabled == 1 then
    local trial_exists = redis.call('EXISTS', trial_key)
    if trial_exists == 0 then
        redis.call('SET', trial_key, trial_size)
    end
    local trial_remaining = tonumber(redis.call('GET', trial_key))
    if trial_remaining > 0 then
        redis.call('DECR', trial_key)
        return {2, trial_remaining - 1}
    end
end

local remaining = tonumber(redis.call('GET', quota_key))
if remaining == nil or remaining <= 0 then
    return {0, 0}
end
redis.call('DECR', quota_key)
return {1, remaining - 1}
"#;

const REFUND_SCRIPT: &str = r#"
local quota_key = KEYS[1]
local trial_key = KEYS[2]
local outcome = tonumber(ARGV[1])

if outcome == 2 then
    redis.call('INCR', trial_key)
else
    redis.call('INCR', quota_key)
end
return 1
"#;

pub struct RedisQuotaStore {
    conn: ConnectionManager,
    reserve_script: Script,
    refund_script: Script,
}

impl RedisQuotaStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            reserve_script: Script::new(RESERVE_SCRIPT),
            refund_script: Script::new(REFUND_SCRIPT),
        }
    }

    fn quota_key(tenant_id: &str) -> String {
        format!("{{quota:{tenant_id}}}")
    }

    fn trial_key(tenant_id: &str, agent_id: &str) -> String {
        format!("{{quota:{tenant_id}}}:trial:{agent_id}")
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn ensure_seeded(&self, tenant_id: &str, seed_remaining: i64) {
        let mut conn = self.conn.clone();
        let key = Self::quota_key(tenant_id);
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(&key)
            .arg(seed_remaining)
            .arg("NX")
            .query_async(&mut conn)
            .await;
        if let Err(error) = result {
            warn!(%error, tenant_id, "failed to seed quota counter");
        }
    }

    async fn reserve(&self, tenant_id: &str, agent_id: &str, trial_size: i64, trial_enabled: bool) -> (ReserveOutcome, i64) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<(i64, i64)> = self
            .reserve_script
            .key(Self::quota_key(tenant_id))
            .key(Self::trial_key(tenant_id, agent_id))
            .arg(trial_size)
            .arg(if trial_enabled { 1 } else { 0 })
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok((0, remaining)) => (ReserveOutcome::Exhausted, remaining),
            Ok((1, remaining)) => (ReserveOutcome::Main, remaining),
            Ok((2, remaining)) => (ReserveOutcome::Trial, remaining),
            Ok(_) => (ReserveOutcome::Exhausted, 0),
            Err(error) => {
                // spec.md §4.4: "MUST NOT fail open (i.e., MUST NOT serve
                // calls without accounting)." Treat store failure as exhausted.
                tracing::error!(%error, tenant_id, "quota counter store unreachable, failing closed");
                (ReserveOutcome::Exhausted, 0)
            }
        }
    }

    async fn refund(&self, tenant_id: &str, agent_id: &str, outcome: ReserveOutcome) {
        if outcome == ReserveOutcome::Exhausted {
            return;
        }
        let mut conn = self.conn.clone();
        let code = if outcome == ReserveOutcome::Trial { 2 } else { 1 };
        let result: redis::RedisResult<i64> = self
            .refund_script
            .key(Self::quota_key(tenant_id))
            .key(Self::trial_key(tenant_id, agent_id))
            .arg(code)
            .invoke_async(&mut conn)
            .await;
        if let Err(error) = result {
            tracing::error!(%error, tenant_id, "failed to refund quota counter");
        }
    }

    async fn remaining(&self, tenant_id: &str) -> i64 {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(Self::quota_key(tenant_id))
            .query_async(&mut conn)
            .await
            .unwrap_or(0)
    }
}

/// In-memory double for tests.
pub struct InMemoryQuotaStore {
    quota: Mutex<HashMap<String, i64>>,
    trial: Mutex<HashMap<(String, String), i64>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self {
            quota: Mutex::new(HashMap::new()),
            trial: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn ensure_seeded(&self, tenant_id: &str, seed_remaining: i64) {
        let mut quota = self.quota.lock().await;
        quota.entry(tenant_id.to_string()).or_insert(seed_remaining);
    }

    async fn reserve(&self, tenant_id: &str, agent_id: &str, trial_size: i64, trial_enabled: bool) -> (ReserveOutcome, i64) {
        if trial_enabled {
            let mut trial = self.trial.lock().await;
            let entry = trial.entry((tenant_id.to_string(), agent_id.to_string())).or_insert(trial_size);
            if *entry > 0 {
                *entry -= 1;
                return (ReserveOutcome::Trial, *entry);
            }
        }
        let mut quota = self.quota.lock().await;
        let entry = quota.entry(tenant_id.to_string()).or_insert(0);
        if *entry <= 0 {
            return (ReserveOutcome::Exhausted, 0);
        }
        *entry -= 1;
        (ReserveOutcome::Main, *entry)
    }

    async fn refund(&self, tenant_id: &str, agent_id: &str, outcome: ReserveOutcome) {
        match outcome {
            ReserveOutcome::Main => {
                let mut quota = self.quota.lock().await;
                *quota.entry(tenant_id.to_string()).or_insert(0) += 1;
            }
            ReserveOutcome::Trial => {
                let mut trial = self.trial.lock().await;
                *trial.entry((tenant_id.to_string(), agent_id.to_string())).or_insert(0) += 1;
            }
            ReserveOutcome::Exhausted => {}
        }
    }

    async fn remaining(&self, tenant_id: &str) -> i64 {
        *self.quota.lock().await.get(tenant_id).unwrap_or(&0)
    }
}

/// Durable sync of `used` back to Postgres, modeled on
/// `integration-gateway/src/usage.rs`'s `UsageTracker`: buffer deltas in
/// memory, flush on a ticker, and if the durable write fails the deltas
/// stay buffered so the next tick retries (at-least-once replay per
/// spec.md §4.4's reconciler requirement).
pub trait DurableQuotaSink: Send + Sync {
    fn record_used_delta(&self, tenant_id: &str, delta: i64);
}

#[derive(Clone)]
pub struct QuotaReconciler {
    inner: Arc<Mutex<HashMap<String, i64>>>,
}

impl QuotaReconciler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn record_delta(&self, tenant_id: &str, delta: i64) {
        let inner = self.inner.clone();
        let tenant_id = tenant_id.to_string();
        tokio::spawn(async move {
            let mut guard = inner.lock().await;
            *guard.entry(tenant_id).or_insert(0) += delta;
        });
    }

    pub fn spawn_flush_task(&self, pool: sqlx::PgPool, flush_interval: Duration) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let deltas: Vec<(String, i64)> = {
                    let mut guard = inner.lock().await;
                    let drained: Vec<_> = guard.drain().collect();
                    drained
                };
                for (tenant_id, delta) in deltas {
                    if delta == 0 {
                        continue;
                    }
                    let result = sqlx::query(
                        "UPDATE quotas SET used = GREATEST(0, used + $1) WHERE tenant_id = $2",
                    )
                    .bind(delta)
                    .bind(&tenant_id)
                    .execute(&pool)
                    .await;
                    if let Err(error) = result {
                        warn!(%error, tenant_id, "failed to reconcile quota delta, re-queuing");
                        let mut guard = inner.lock().await;
                        *guard.entry(tenant_id).or_insert(0) += delta;
                    }
                }
            }
        });
    }
}

impl Default for QuotaReconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trial_allowance_consumed_before_main_quota() {
        let store = InMemoryQuotaStore::new();
        store.ensure_seeded("tenant-a", 100).await;
        for _ in 0..3 {
            let (outcome, _) = store.reserve("tenant-a", "agent-1", 3, true).await;
            assert_eq!(outcome, ReserveOutcome::Trial);
        }
        let (outcome, remaining) = store.reserve("tenant-a", "agent-1", 3, true).await;
        assert_eq!(outcome, ReserveOutcome::Main);
        assert_eq!(remaining, 99);
    }

    #[tokio::test]
    async fn refund_is_symmetric_and_floored() {
        let store = InMemoryQuotaStore::new();
        store.ensure_seeded("tenant-b", 1).await;
        let (outcome, remaining) = store.reserve("tenant-b", "agent-1", 0, false).await;
        assert_eq!(outcome, ReserveOutcome::Main);
        assert_eq!(remaining, 0);
        store.refund("tenant-b", "agent-1", outcome).await;
        assert_eq!(store.remaining("tenant-b").await, 1);

        let (exhausted, _) = {
            store.reserve("tenant-b", "agent-1", 0, false).await;
            store.reserve("tenant-b", "agent-1", 0, false).await
        };
        assert_eq!(exhausted, ReserveOutcome::Exhausted);
    }

    #[tokio::test]
    async fn exhausted_quota_rejects() {
        let store = InMemoryQuotaStore::new();
        store.ensure_seeded("tenant-c", 0).await;
        let (outcome, _) = store.reserve("tenant-c", "agent-1", 0, false).await;
        assert_eq!(outcome, ReserveOutcome::Exhausted);
    }
}
