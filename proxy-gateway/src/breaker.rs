use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::metrics::GatewayMetrics;

/// Per-provider circuit breaker state (spec.md §4.7). Hand-written for this
/// codebase: the teacher repo has no breaker of its own, and the
/// `tower-resilience` example in the retrieval pack is documentation only,
/// not a reusable type — we borrow its closed/open/half-open vocabulary and
/// threshold/timeout knobs, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_label(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
        }
    }
}

pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

/// One breaker per provider name, in-process, guarded by a read-write lock
/// (spec.md §5: "common path holds only a read lock"). The registry is
/// explicit state the caller constructs and owns — no ambient singleton,
/// per spec.md §9's "Global mutable state" design note.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Breaker>>,
    settings: BreakerSettings,
    metrics: Option<Arc<GatewayMetrics>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings, metrics: Option<Arc<GatewayMetrics>>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            settings,
            metrics,
        }
    }

    /// Whether a call to `provider` is currently allowed through. Transitions
    /// open -> half-open when the open timeout has elapsed.
    pub async fn allow(&self, provider: &str) -> bool {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(provider) {
                match breaker.state {
                    BreakerState::Closed | BreakerState::HalfOpen => return true,
                    BreakerState::Open => {
                        let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                        if elapsed < self.settings.open_timeout {
                            return false;
                        }
                    }
                }
            } else {
                return true;
            }
        }
        // Timeout elapsed: flip to half-open under a write lock.
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);
        let mut transitioned = false;
        if breaker.state == BreakerState::Open {
            let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.settings.open_timeout {
                breaker.state = BreakerState::HalfOpen;
                breaker.half_open_successes = 0;
                transitioned = true;
            }
        }
        let allowed = !matches!(breaker.state, BreakerState::Open);
        drop(breakers);
        if transitioned {
            self.record_transition(provider, BreakerState::HalfOpen);
            self.refresh_open_gauge().await;
        }
        allowed
    }

    /// Record the outcome of an upstream-class call. Client-class errors
    /// (malformed request) must never be passed here — spec.md §4.7.
    pub async fn record_outcome(&self, provider: &str, success: bool) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::Closed => {
                if success {
                    breaker.consecutive_failures = 0;
                } else {
                    breaker.consecutive_failures += 1;
                    if breaker.consecutive_failures >= self.settings.failure_threshold {
                        breaker.state = BreakerState::Open;
                        breaker.opened_at = Some(Instant::now());
                        drop(breakers);
                        self.record_transition(provider, BreakerState::Open);
                        self.refresh_open_gauge().await;
                    }
                }
            }
            BreakerState::HalfOpen => {
                if success {
                    breaker.half_open_successes += 1;
                    if breaker.half_open_successes >= self.settings.success_threshold {
                        breaker.state = BreakerState::Closed;
                        breaker.consecutive_failures = 0;
                        drop(breakers);
                        self.record_transition(provider, BreakerState::Closed);
                        self.refresh_open_gauge().await;
                    }
                } else {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(Instant::now());
                    breaker.consecutive_failures = self.settings.failure_threshold;
                    drop(breakers);
                    self.record_transition(provider, BreakerState::Open);
                    self.refresh_open_gauge().await;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_transition(&self, provider: &str, to_state: BreakerState) {
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(provider, to_state.as_label());
        }
    }

    /// Recomputes how many providers are currently `Open` and publishes it
    /// as a gauge. Called after every transition rather than kept as a
    /// running counter, since the map is small and this keeps the gauge
    /// self-correcting against any bookkeeping drift.
    async fn refresh_open_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            let open_count =
                self.breakers.read().await.values().filter(|b| b.state == BreakerState::Open).count() as i64;
            metrics.set_breaker_open_count(open_count);
        }
    }

    #[cfg(test)]
    async fn state_of(&self, provider: &str) -> BreakerState {
        self.breakers
            .read()
            .await
            .get(provider)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_millis(30),
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let registry = BreakerRegistry::new(settings(), None);
        for _ in 0..4 {
            registry.record_outcome("openai", false).await;
            assert!(registry.allow("openai").await);
        }
        registry.record_outcome("openai", false).await;
        assert!(!registry.allow("openai").await);
        assert_eq!(registry.state_of("openai").await, BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_then_closes_after_successes() {
        let registry = BreakerRegistry::new(settings(), None);
        for _ in 0..5 {
            registry.record_outcome("openai", false).await;
        }
        assert!(!registry.allow("openai").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(registry.allow("openai").await);
        assert_eq!(registry.state_of("openai").await, BreakerState::HalfOpen);

        registry.record_outcome("openai", true).await;
        registry.record_outcome("openai", true).await;
        assert_eq!(registry.state_of("openai").await, BreakerState::HalfOpen);
        registry.record_outcome("openai", true).await;
        assert_eq!(registry.state_of("openai").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let registry = BreakerRegistry::new(settings(), None);
        for _ in 0..5 {
            registry.record_outcome("openai", false).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(registry.allow("openai").await);
        registry.record_outcome("openai", false).await;
        assert!(!registry.allow("openai").await);
        assert_eq!(registry.state_of("openai").await, BreakerState::Open);
    }

    #[tokio::test]
    async fn providers_are_independent() {
        let registry = BreakerRegistry::new(settings(), None);
        for _ in 0..5 {
            registry.record_outcome("openai", false).await;
        }
        assert!(!registry.allow("openai").await);
        assert!(registry.allow("anthropic").await);
    }
}
