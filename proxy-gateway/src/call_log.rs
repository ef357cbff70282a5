use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
    Timeout,
}

impl CallStatus {
    fn as_str(self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
            CallStatus::Timeout => "timeout",
        }
    }
}

/// Append-only audit entry written after every proxied request (spec.md §3).
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub agent_id: String,
    pub api_key_id: String,
    pub tenant_id: String,
    pub request_id: Uuid,
    pub correlation_id: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub latency_ms: i64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub cost: bigdecimal::BigDecimal,
    pub created_at: DateTime<Utc>,
}

/// Write the CallRecord on a detached task with its own short deadline
/// (spec.md §5: "recommended 5 s — so shutdown cannot lose a log entry").
/// Failures are logged, never propagated: the client response has already
/// been flushed by the time this runs.
pub fn spawn_write(pool: PgPool, record: CallRecord) {
    tokio::spawn(async move {
        let write = sqlx::query(
            "INSERT INTO call_logs
               (agent_id, api_key_id, tenant_id, request_id, correlation_id,
                input_tokens, output_tokens, latency_ms, status, error_code, cost, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&record.agent_id)
        .bind(&record.api_key_id)
        .bind(&record.tenant_id)
        .bind(record.request_id)
        .bind(&record.correlation_id)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.latency_ms)
        .bind(record.status.as_str())
        .bind(&record.error_code)
        .bind(&record.cost)
        .bind(record.created_at);

        match tokio::time::timeout(Duration::from_secs(5), write.execute(&pool)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => tracing::warn!(%error, request_id = %record.request_id, "failed to write call record"),
            Err(_) => tracing::warn!(request_id = %record.request_id, "call record write timed out"),
        }
    });
}
