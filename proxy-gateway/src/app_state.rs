use std::sync::Arc;

use crate::breaker::BreakerRegistry;
use crate::config::GatewayConfig;
use crate::credential_store::CredentialStore;
use crate::agent_store::AgentStore;
use crate::metrics::GatewayMetrics;
use crate::quota::{QuotaReconciler, QuotaStore};
use crate::rate_limiter::RateLimiterEngine;

/// Shared, process-wide state injected into every handler. Built once at
/// startup and owned explicitly (no ambient singleton), per spec.md §9's
/// "Global mutable state" note and `integration-gateway/src/app_state.rs`'s
/// `AppState` shape. Stores/engines are behind trait objects so tests can
/// swap in the in-memory doubles defined alongside each module.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<GatewayMetrics>,
    pub credential_store: Arc<dyn CredentialStore>,
    pub agent_store: Arc<dyn AgentStore>,
    pub quota_store: Arc<dyn QuotaStore>,
    pub quota_reconciler: QuotaReconciler,
    pub rate_limiter: Arc<dyn RateLimiterEngine>,
    pub breaker_registry: Arc<BreakerRegistry>,
    pub http_client: reqwest::Client,
    /// `None` in tests using the in-memory store doubles; call-log writes
    /// are best-effort and simply skipped when there is no pool.
    pub pool: Option<sqlx::PgPool>,
}

impl AppState {
    pub fn tier_limit(&self, is_paid: bool) -> u32 {
        if is_paid {
            self.config.paid_tier_limit
        } else {
            self.config.free_tier_limit
        }
    }
}
