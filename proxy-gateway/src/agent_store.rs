use async_trait::async_trait;
use bigdecimal::BigDecimal;
use common_crypto::{decrypt_detached, CryptoError};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::prompt::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Draft,
    Active,
    Inactive,
}

impl AgentStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => AgentStatus::Active,
            "inactive" => AgentStatus::Inactive,
            _ => AgentStatus::Draft,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub agent_id: String,
    pub owner_tenant_id: String,
    pub status: AgentStatus,
    pub price: BigDecimal,
    pub version: i64,
    pub trial_enabled: bool,
}

/// Decrypted form, materialized only within one request and discarded
/// (spec.md §3 — "never persisted in clear"). No `Debug`/`Display`/`Serialize`
/// on purpose: this type must never end up in a log line or response body.
#[derive(Clone)]
pub struct AgentConfiguration {
    pub system_prompt: String,
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentStoreError {
    #[error("agent not found")]
    NotFound,
    #[error("decryption failed: {0}")]
    Decrypt(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn fetch(&self, agent_id: &str) -> Result<Agent, AgentStoreError>;
    async fn fetch_configuration(&self, agent: &Agent) -> Result<AgentConfiguration, AgentStoreError>;
    async fn record_successful_call(&self, agent_id: &str);
}

struct CachedConfig {
    version: i64,
    status: AgentStatus,
    config: AgentConfiguration,
    cached_at: Instant,
}

struct AgentRow {
    agent_id: String,
    owner_tenant_id: String,
    status: String,
    price: BigDecimal,
    ciphertext: Vec<u8>,
    nonce: Vec<u8>,
    version: i64,
    trial_enabled: bool,
}

/// Postgres-backed agent store with a bounded-freshness cache of decrypted
/// configurations, keyed by `(agent_id, version)` per spec.md §4.3. Grounded
/// on `integration-gateway`'s `load_active_keys` periodic-refresh pattern
/// and `payment-service/src/repo.rs`'s runtime-checked `sqlx::query_as` CRUD
/// style (no `query!` macro, so this builds without a live `DATABASE_URL`).
pub struct PgAgentStore {
    pool: PgPool,
    master_key: [u8; 32],
    cache: RwLock<HashMap<String, CachedConfig>>,
    ttl: Duration,
}

impl PgAgentStore {
    pub fn new(pool: PgPool, master_key: [u8; 32], ttl: Duration) -> Self {
        Self {
            pool,
            master_key,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    async fn fetch_row(&self, agent_id: &str) -> Result<AgentRow, AgentStoreError> {
        let row = sqlx::query_as::<_, (String, String, String, BigDecimal, Vec<u8>, Vec<u8>, i64, bool)>(
            "SELECT id, owner_tenant_id, status, price, ciphertext, nonce, version, trial_enabled FROM agents WHERE id = $1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AgentStoreError::Store(e.to_string()))?;

        let (agent_id, owner_tenant_id, status, price, ciphertext, nonce, version, trial_enabled) =
            row.ok_or(AgentStoreError::NotFound)?;

        Ok(AgentRow {
            agent_id,
            owner_tenant_id,
            status,
            price,
            ciphertext,
            nonce,
            version,
            trial_enabled,
        })
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<AgentConfiguration, AgentStoreError> {
        let nonce_arr: [u8; 12] = nonce.try_into().map_err(|_| AgentStoreError::Store("bad nonce length".into()))?;
        let plaintext = decrypt_detached(&self.master_key, &nonce_arr, ciphertext)?;
        let parsed: DecryptedConfig =
            serde_json::from_slice(&plaintext).map_err(|e| AgentStoreError::Store(e.to_string()))?;
        Ok(AgentConfiguration {
            system_prompt: parsed.system_prompt,
            provider: parsed.provider,
            model: parsed.model,
            temperature: parsed.temperature,
            top_p: parsed.top_p,
            max_output_tokens: parsed.max_output_tokens,
        })
    }
}

#[derive(serde::Deserialize)]
struct DecryptedConfig {
    system_prompt: String,
    provider: String,
    model: String,
    temperature: f64,
    top_p: f64,
    max_output_tokens: u32,
}

#[async_trait]
impl AgentStore for PgAgentStore {
    async fn fetch(&self, agent_id: &str) -> Result<Agent, AgentStoreError> {
        let row = self.fetch_row(agent_id).await?;
        Ok(Agent {
            agent_id: row.agent_id,
            owner_tenant_id: row.owner_tenant_id,
            status: AgentStatus::from_str(&row.status),
            price: row.price,
            version: row.version,
            trial_enabled: row.trial_enabled,
        })
    }

    async fn fetch_configuration(&self, agent: &Agent) -> Result<AgentConfiguration, AgentStoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&agent.agent_id) {
                let fresh = entry.cached_at.elapsed() < self.ttl;
                let same_version = entry.version == agent.version;
                if fresh && same_version && entry.status == agent.status {
                    return Ok(entry.config.clone());
                }
            }
        }

        let row = self.fetch_row(&agent.agent_id).await?;
        let status = AgentStatus::from_str(&row.status);
        let config = self.decrypt(&row.ciphertext, &row.nonce)?;

        let mut cache = self.cache.write().await;
        cache.insert(
            agent.agent_id.clone(),
            CachedConfig {
                version: row.version,
                status,
                config: config.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(config)
    }

    async fn record_successful_call(&self, agent_id: &str) {
        let result = sqlx::query(
            "UPDATE agents SET total_calls = total_calls + 1, accumulated_revenue = accumulated_revenue + price WHERE id = $1",
        )
        .bind(agent_id)
        .execute(&self.pool)
        .await;
        if let Err(error) = result {
            tracing::warn!(%error, agent_id, "failed to update agent call stats");
        }
    }
}

/// In-memory double for tests.
pub struct InMemoryAgentStore {
    agents: Arc<RwLock<HashMap<String, (Agent, AgentConfiguration)>>>,
    pub call_counts: Arc<RwLock<HashMap<String, u64>>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            call_counts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, agent: Agent, config: AgentConfiguration) {
        let mut agents = self.agents.write().await;
        agents.insert(agent.agent_id.clone(), (agent, config));
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) {
        let mut agents = self.agents.write().await;
        if let Some((agent, _)) = agents.get_mut(agent_id) {
            agent.status = status;
        }
    }
}

impl Default for InMemoryAgentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn fetch(&self, agent_id: &str) -> Result<Agent, AgentStoreError> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|(a, _)| a.clone()).ok_or(AgentStoreError::NotFound)
    }

    async fn fetch_configuration(&self, agent: &Agent) -> Result<AgentConfiguration, AgentStoreError> {
        let agents = self.agents.read().await;
        agents
            .get(&agent.agent_id)
            .map(|(_, c)| c.clone())
            .ok_or(AgentStoreError::NotFound)
    }

    async fn record_successful_call(&self, agent_id: &str) {
        let mut counts = self.call_counts.write().await;
        *counts.entry(agent_id.to_string()).or_insert(0) += 1;
    }
}

/// Validate an inbound message list per spec.md §4.1 step 6: non-empty,
/// each message has a non-empty role and content.
pub fn validate_messages(messages: &[ChatMessage]) -> Result<(), &'static str> {
    if messages.is_empty() {
        return Err("messages must not be empty");
    }
    for message in messages {
        if message.role.trim().is_empty() {
            return Err("message role must not be empty");
        }
        if message.content.trim().is_empty() {
            return Err("message content must not be empty");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn draft_agent_not_served() {
        let store = InMemoryAgentStore::new();
        store
            .insert(
                Agent {
                    agent_id: "a1".into(),
                    owner_tenant_id: "t1".into(),
                    status: AgentStatus::Draft,
                    price: BigDecimal::from(1),
                    version: 1,
                    trial_enabled: true,
                },
                AgentConfiguration {
                    system_prompt: "hi".into(),
                    provider: "openai".into(),
                    model: "gpt".into(),
                    temperature: 0.5,
                    top_p: 1.0,
                    max_output_tokens: 100,
                },
            )
            .await;
        let agent = store.fetch("a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Draft);
    }

    #[test]
    fn rejects_empty_messages() {
        assert!(validate_messages(&[]).is_err());
    }

    #[test]
    fn rejects_blank_content() {
        let messages = vec![ChatMessage { role: "user".into(), content: "   ".into() }];
        assert!(validate_messages(&messages).is_err());
    }

    #[test]
    fn accepts_well_formed_messages() {
        let messages = vec![ChatMessage { role: "user".into(), content: "hello".into() }];
        assert!(validate_messages(&messages).is_ok());
    }
}
