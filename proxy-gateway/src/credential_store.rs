use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Result of validating an API key secret (spec.md §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub tenant_id: String,
    pub revoked: bool,
    /// Tier per spec.md §3: "paid ≡ tenant has ever purchased quota".
    pub tenant_is_paid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateOutcome {
    Valid(ApiKeyRecord),
    Invalid,
    Revoked,
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn validate(&self, secret: &str) -> ValidateOutcome;
    /// Best-effort `last_used_at` bump — failure MUST NOT fail the request
    /// (spec.md §4.2), so callers should `tokio::spawn` this and ignore errors.
    async fn touch_last_used(&self, key_id: &str);
}

struct CacheEntry {
    record: ApiKeyRecord,
    cached_at: Instant,
}

/// Postgres-backed credential store with a bounded TTL cache, mirroring
/// `integration-gateway/src/main.rs`'s key-cache refresh pattern but
/// re-checking revocation on every cache miss so a revocation is never
/// served past the TTL window (spec.md §4.2: "MUST expire within a short
/// bounded window ... so revocation is observed promptly").
pub struct PgCredentialStore {
    pool: PgPool,
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn validate(&self, secret: &str) -> ValidateOutcome {
        let key_hash = hash_secret(secret);

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key_hash) {
                if entry.cached_at.elapsed() < self.ttl {
                    return if entry.record.revoked {
                        ValidateOutcome::Revoked
                    } else {
                        ValidateOutcome::Valid(entry.record.clone())
                    };
                }
            }
        }

        let row = sqlx::query_as::<_, (String, String, bool, bool)>(
            "SELECT ak.id, ak.tenant_id, ak.revoked_at IS NOT NULL, t.total_purchased > 0
             FROM api_keys ak JOIN tenants t ON t.id = ak.tenant_id
             WHERE ak.key_hash = $1",
        )
        .bind(&key_hash)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some((key_id, tenant_id, revoked, tenant_is_paid))) => {
                let record = ApiKeyRecord { key_id, tenant_id, revoked, tenant_is_paid };
                let mut cache = self.cache.write().await;
                cache.insert(
                    key_hash,
                    CacheEntry { record: record.clone(), cached_at: Instant::now() },
                );
                if revoked {
                    ValidateOutcome::Revoked
                } else {
                    ValidateOutcome::Valid(record)
                }
            }
            Ok(None) => ValidateOutcome::Invalid,
            Err(error) => {
                tracing::error!(%error, "credential store lookup failed");
                ValidateOutcome::Invalid
            }
        }
    }

    async fn touch_last_used(&self, key_id: &str) {
        let result = sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await;
        if let Err(error) = result {
            tracing::warn!(%error, key_id, "failed to update last_used_at");
        }
    }
}

/// In-memory double for tests.
pub struct InMemoryCredentialStore {
    keys: Arc<RwLock<HashMap<String, ApiKeyRecord>>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, secret: &str, key_id: &str, tenant_id: &str, revoked: bool) {
        self.insert_with_tier(secret, key_id, tenant_id, revoked, false).await;
    }

    pub async fn insert_with_tier(&self, secret: &str, key_id: &str, tenant_id: &str, revoked: bool, tenant_is_paid: bool) {
        let mut keys = self.keys.write().await;
        keys.insert(
            hash_secret(secret),
            ApiKeyRecord {
                key_id: key_id.to_string(),
                tenant_id: tenant_id.to_string(),
                revoked,
                tenant_is_paid,
            },
        );
    }

    pub async fn revoke(&self, secret: &str) {
        let mut keys = self.keys.write().await;
        if let Some(record) = keys.get_mut(&hash_secret(secret)) {
            record.revoked = true;
        }
    }
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn validate(&self, secret: &str) -> ValidateOutcome {
        let keys = self.keys.read().await;
        match keys.get(&hash_secret(secret)) {
            Some(record) if record.revoked => ValidateOutcome::Revoked,
            Some(record) => ValidateOutcome::Valid(record.clone()),
            None => ValidateOutcome::Invalid,
        }
    }

    async fn touch_last_used(&self, _key_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_key_resolves_to_tenant() {
        let store = InMemoryCredentialStore::new();
        store.insert("secret-123", "key-1", "tenant-1", false).await;
        match store.validate("secret-123").await {
            ValidateOutcome::Valid(record) => assert_eq!(record.tenant_id, "tenant-1"),
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_secret_is_invalid() {
        let store = InMemoryCredentialStore::new();
        assert_eq!(store.validate("nope").await, ValidateOutcome::Invalid);
    }

    #[tokio::test]
    async fn revoked_key_rejected_immediately() {
        let store = InMemoryCredentialStore::new();
        store.insert("secret-123", "key-1", "tenant-1", false).await;
        store.revoke("secret-123").await;
        assert_eq!(store.validate("secret-123").await, ValidateOutcome::Revoked);
    }
}
