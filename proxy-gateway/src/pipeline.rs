use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agent_store::{validate_messages, AgentStatus, AgentStoreError};
use crate::app_state::AppState;
use crate::call_log::{spawn_write, CallRecord, CallStatus};
use crate::credential_store::{ApiKeyRecord, ValidateOutcome};
use crate::error::{ApiError, ApiResult, ErrorKind};
use crate::prompt::{detect_extraction_attempt, inject_system_prompt, sanitize_output, ChatMessage};
use crate::providers::adapter_for;
use crate::quota::ReserveOutcome;
use crate::upstream::{call_non_stream, call_stream, UpstreamError};

const KEY_HEADER: &str = "X-AgentLink-Key";
const CORRELATION_HEADER: &str = "X-Correlation-ID";

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Serialize)]
struct Choice {
    index: u32,
    message: ChatMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// `POST /proxy/v1/agents/{agentId}/chat` — the ordered pipeline of
/// spec.md §4.1, expressed as a plain async function invoked by the axum
/// handler (not a tower middleware stack) so the stage order stays
/// explicit and auditable.
#[tracing::instrument(skip(state, headers, body), fields(agent_id = %agent_id))]
pub async fn handle_chat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Response {
    let start = Instant::now();

    // Step 1: request id + correlation id.
    let request_id = Uuid::new_v4();
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| request_id.to_string());

    let path = format!("/proxy/v1/agents/{agent_id}/chat");
    let method = "POST".to_string();

    let mut log = RequestLog::default();
    let (response, status, error_code) =
        match run_pipeline(&state, &agent_id, &headers, body, request_id, correlation_id.clone(), start, &mut log).await {
            Ok(response) => {
                let status = response.status().as_u16();
                state.metrics.record_request(status, "");
                (response, status, None)
            }
            Err(err) => {
                state.metrics.record_request(err.kind.status().as_u16(), err.kind.code());
                let mut api_err = ApiError::new(err.kind, err.message.clone())
                    .with_request(request_id, correlation_id.clone(), path.clone(), method.clone());
                if let Some(secs) = err.retry_after_secs {
                    api_err = api_err.with_retry_after(secs);
                }
                if let (Some(limit), Some(remaining)) = (err.rate_limit, err.rate_remaining) {
                    api_err = api_err.with_rate_limit(limit, remaining);
                }
                let status = err.kind.status().as_u16();
                let code = err.kind.code();
                (api_err.into_response(), status, Some(code))
            }
        };

    // One structured line per call per spec.md §7, carrying the fields a
    // correlating operator needs without ever logging request/response bodies.
    tracing::info!(
        request_id = %request_id,
        correlation_id = %correlation_id,
        tenant_id = log.tenant_id.as_deref().unwrap_or(""),
        agent_id = %agent_id,
        method = %method,
        path = %path,
        status = status,
        latency_ms = start.elapsed().as_millis() as i64,
        rate_remaining = ?log.rate_remaining,
        quota_remaining = ?log.quota_remaining,
        error_code = ?error_code,
        "proxy call completed"
    );

    response
}

/// Fields surfaced in the completion log line (spec.md §7), populated as the
/// pipeline learns them. Stays `None` for fields not yet known at whichever
/// stage the call was rejected.
#[derive(Default)]
struct RequestLog {
    tenant_id: Option<String>,
    rate_limit: Option<u32>,
    rate_remaining: Option<u32>,
    quota_remaining: Option<i64>,
}

struct PipelineError {
    kind: ErrorKind,
    message: String,
    retry_after_secs: Option<u64>,
    rate_limit: Option<u32>,
    rate_remaining: Option<u32>,
}

impl PipelineError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after_secs: None, rate_limit: None, rate_remaining: None }
    }

    fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    fn with_rate_limit(mut self, limit: u32, remaining: u32) -> Self {
        self.rate_limit = Some(limit);
        self.rate_remaining = Some(remaining);
        self
    }
}

impl From<ApiError> for PipelineError {
    fn from(err: ApiError) -> Self {
        Self {
            kind: err.kind,
            message: err.message,
            retry_after_secs: err.retry_after_secs,
            rate_limit: err.rate_limit,
            rate_remaining: err.rate_remaining,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    state: &AppState,
    agent_id: &str,
    headers: &HeaderMap,
    body: ChatRequestBody,
    request_id: Uuid,
    correlation_id: String,
    start: Instant,
    log: &mut RequestLog,
) -> Result<Response, PipelineError> {
    // Step 2: API key presence + validation.
    let secret = headers
        .get(KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| PipelineError::new(ErrorKind::AuthMissing, "missing X-AgentLink-Key header"))?;

    let key_record = match state.credential_store.validate(secret).await {
        ValidateOutcome::Valid(record) => record,
        ValidateOutcome::Invalid => {
            return Err(PipelineError::new(ErrorKind::AuthInvalid, "invalid API key"))
        }
        ValidateOutcome::Revoked => {
            return Err(PipelineError::new(ErrorKind::AuthRevoked, "API key revoked"))
        }
    };
    log.tenant_id = Some(key_record.tenant_id.clone());
    {
        let store = state.credential_store.clone();
        let key_id = key_record.key_id.clone();
        tokio::spawn(async move { store.touch_last_used(&key_id).await });
    }

    // Step 3: resolve agent, gate status.
    let agent = state.agent_store.fetch(agent_id).await.map_err(|e| match e {
        AgentStoreError::NotFound => PipelineError::new(ErrorKind::NotFound, "agent not found"),
        other => PipelineError::new(ErrorKind::Internal, other.to_string()),
    })?;
    if agent.status != AgentStatus::Active {
        return Err(PipelineError::new(ErrorKind::Forbidden, "agent is not active"));
    }

    // Step 4: rate limit, tier-dependent.
    let limit = state.tier_limit(key_record.tenant_is_paid);
    let rate_decision = state
        .rate_limiter
        .check(&key_record.tenant_id, limit, state.config.rate_window_seconds)
        .await;
    state.metrics.record_rate_check(if key_record.tenant_is_paid { "paid" } else { "free" }, rate_decision.allowed);
    log.rate_limit = Some(rate_decision.limit);
    log.rate_remaining = Some(rate_decision.remaining);
    if !rate_decision.allowed {
        let retry = rate_decision.retry_after_secs.unwrap_or(1);
        return Err(PipelineError::new(ErrorKind::RateLimited, format!("rate limit exceeded, retry after {retry}s"))
            .with_retry_after(retry)
            .with_rate_limit(rate_decision.limit, rate_decision.remaining));
    }

    // Step 5: quota must have room before parsing/reserving.
    state.quota_store.ensure_seeded(&key_record.tenant_id, state.config.quota_free_grant).await;
    let remaining_before = state.quota_store.remaining(&key_record.tenant_id).await;
    log.quota_remaining = Some(remaining_before);
    if remaining_before <= 0 {
        return Err(quota_exhausted(rate_decision.limit, rate_decision.remaining));
    }

    // Step 6: validate body, then reserve one unit of quota atomically.
    validate_messages(&body.messages).map_err(|msg| {
        PipelineError::new(ErrorKind::InvalidRequest, msg.to_string())
            .with_rate_limit(rate_decision.limit, rate_decision.remaining)
    })?;

    let (reserve_outcome, remaining_after) = state
        .quota_store
        .reserve(&key_record.tenant_id, agent_id, state.config.quota_trial_size, agent.trial_enabled)
        .await;
    log.quota_remaining = Some(remaining_after);
    if reserve_outcome == ReserveOutcome::Exhausted {
        state.metrics.record_quota_decrement("exhausted");
        return Err(quota_exhausted(rate_decision.limit, rate_decision.remaining));
    }
    state.metrics.record_quota_decrement("reserved");

    // From here on, any failure path must refund before returning.
    let result = serve_upstream(
        state,
        &agent,
        agent_id,
        &key_record,
        &body,
        request_id,
        &correlation_id,
        rate_decision.limit,
        rate_decision.remaining,
        start,
    )
    .await;

    match result {
        Ok((response, call_record)) => {
            state.agent_store.record_successful_call(agent_id).await;
            state.quota_reconciler.record_delta(&key_record.tenant_id, 1);
            spawn_write_if_configured(state, call_record);
            Ok(response)
        }
        Err(pipeline_err) => {
            state.quota_store.refund(&key_record.tenant_id, agent_id, reserve_outcome).await;
            state.metrics.record_quota_refund(pipeline_err.kind.code());
            let call_record = CallRecord {
                agent_id: agent_id.to_string(),
                api_key_id: key_record.key_id.clone(),
                tenant_id: key_record.tenant_id.clone(),
                request_id,
                correlation_id: correlation_id.clone(),
                input_tokens: None,
                output_tokens: None,
                latency_ms: start.elapsed().as_millis() as i64,
                status: if pipeline_err.kind == ErrorKind::UpstreamTimeout { CallStatus::Timeout } else { CallStatus::Error },
                error_code: Some(pipeline_err.kind.code().to_string()),
                cost: bigdecimal::BigDecimal::from(0),
                created_at: Utc::now(),
            };
            spawn_write_if_configured(state, call_record);
            Err(pipeline_err)
        }
    }
}

fn quota_exhausted(rate_limit: u32, rate_remaining: u32) -> PipelineError {
    PipelineError::new(ErrorKind::QuotaExhausted, "quota exhausted").with_rate_limit(rate_limit, rate_remaining)
}

/// The in-memory test doubles run with `state.pool == None`, which keeps
/// call-log writes best-effort and absent entirely in unit tests.
fn spawn_write_if_configured(state: &AppState, record: CallRecord) {
    if let Some(pool) = state.pool.clone() {
        spawn_write(pool, record);
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_upstream(
    state: &AppState,
    agent: &crate::agent_store::Agent,
    agent_id: &str,
    key_record: &ApiKeyRecord,
    body: &ChatRequestBody,
    request_id: Uuid,
    correlation_id: &str,
    rate_limit: u32,
    rate_remaining: u32,
    start: Instant,
) -> Result<(Response, CallRecord), PipelineError> {
    for message in &body.messages {
        if let Some(pattern) = detect_extraction_attempt(&message.content) {
            state.metrics.record_prompt_leakage_hit(pattern);
        }
    }

    let config = state
        .agent_store
        .fetch_configuration(agent)
        .await
        .map_err(|e| PipelineError::new(ErrorKind::Internal, e.to_string()).with_rate_limit(rate_limit, rate_remaining))?;

    let adapter = adapter_for(&config.provider).ok_or_else(|| {
        PipelineError::new(ErrorKind::Internal, format!("unknown provider {}", config.provider))
            .with_rate_limit(rate_limit, rate_remaining)
    })?;

    let api_key = provider_api_key(state, &config.provider).ok_or_else(|| {
        PipelineError::new(ErrorKind::Internal, "provider API key not configured").with_rate_limit(rate_limit, rate_remaining)
    })?;

    if !state.breaker_registry.allow(adapter.name()).await {
        return Err(
            PipelineError::new(ErrorKind::BreakerOpen, format!("{} circuit breaker open", adapter.name()))
                .with_rate_limit(rate_limit, rate_remaining),
        );
    }

    let deadline = state.config.clamp_deadline(None);
    let upstream_messages = inject_system_prompt(&config.system_prompt, &body.messages);
    let request_body = adapter.translate_request(&config, &upstream_messages, body.stream);

    let upstream_start = Instant::now();

    if body.stream {
        let (tx, rx) = mpsc::channel::<bytes::Bytes>(16);
        let system_prompt = config.system_prompt.clone();
        let sanitize = move |text: &str| sanitize_output(&system_prompt, text);

        let client = state.http_client.clone();
        let adapter_name = adapter.name();
        let call_result =
            call_stream(&client, adapter.as_ref(), &api_key, request_body, deadline, tx, sanitize, &state.metrics).await;
        state.metrics.observe_upstream_latency(upstream_start.elapsed().as_secs_f64());

        match call_result {
            Ok(()) => {
                state.breaker_registry.record_outcome(adapter_name, true).await;
                let body_stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
                let mut response = Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/event-stream")
                    .header("Cache-Control", "no-cache")
                    .header("Connection", "keep-alive")
                    .body(Body::from_stream(body_stream))
                    .expect("building streaming response");
                attach_response_headers(&mut response, request_id, correlation_id, rate_limit, rate_remaining);
                let call_record = success_record(key_record, agent, agent_id, request_id, correlation_id, start, None, None);
                Ok((response, call_record))
            }
            Err(err) => Err(upstream_error_to_pipeline(err, adapter_name, state, rate_limit, rate_remaining).await),
        }
    } else {
        let client = state.http_client.clone();
        let adapter_name = adapter.name();
        let call_result = call_non_stream(&client, adapter.as_ref(), &api_key, request_body, deadline).await;
        state.metrics.observe_upstream_latency(upstream_start.elapsed().as_secs_f64());

        match call_result {
            Ok(parsed) => {
                state.breaker_registry.record_outcome(adapter_name, true).await;
                let sanitized_content = sanitize_output(&config.system_prompt, &parsed.content);
                let payload = ChatCompletionResponse {
                    id: request_id.to_string(),
                    object: "chat.completion",
                    created: Utc::now().timestamp(),
                    model: config.model.clone(),
                    choices: vec![Choice {
                        index: 0,
                        message: ChatMessage { role: "assistant".to_string(), content: sanitized_content },
                        finish_reason: "stop",
                    }],
                    usage: Usage { prompt_tokens: parsed.input_tokens, completion_tokens: parsed.output_tokens },
                };
                let mut response = (StatusCode::OK, Json(payload)).into_response();
                attach_response_headers(&mut response, request_id, correlation_id, rate_limit, rate_remaining);
                let call_record = success_record(
                    key_record,
                    agent,
                    agent_id,
                    request_id,
                    correlation_id,
                    start,
                    parsed.input_tokens.map(|v| v as i64),
                    parsed.output_tokens.map(|v| v as i64),
                );
                Ok((response, call_record))
            }
            Err(err) => Err(upstream_error_to_pipeline(err, adapter_name, state, rate_limit, rate_remaining).await),
        }
    }
}

async fn upstream_error_to_pipeline(
    err: UpstreamError,
    provider: &str,
    state: &AppState,
    rate_limit: u32,
    rate_remaining: u32,
) -> PipelineError {
    let pipeline_err = match err {
        UpstreamError::Timeout => {
            state.breaker_registry.record_outcome(provider, false).await;
            PipelineError::new(ErrorKind::UpstreamTimeout, format!("{provider} call exceeded deadline"))
        }
        UpstreamError::BadStatus(status) if status >= 500 => {
            state.breaker_registry.record_outcome(provider, false).await;
            PipelineError::new(ErrorKind::UpstreamError, format!("{provider} returned {status}"))
        }
        UpstreamError::BadStatus(status) => {
            // Client-class errors don't count toward tripping the breaker.
            PipelineError::new(ErrorKind::UpstreamError, format!("{provider} returned {status}"))
        }
        UpstreamError::Http(msg) => {
            state.breaker_registry.record_outcome(provider, false).await;
            PipelineError::new(ErrorKind::UpstreamError, msg)
        }
    };
    pipeline_err.with_rate_limit(rate_limit, rate_remaining)
}

#[allow(clippy::too_many_arguments)]
fn success_record(
    key_record: &ApiKeyRecord,
    agent: &crate::agent_store::Agent,
    agent_id: &str,
    request_id: Uuid,
    correlation_id: &str,
    start: Instant,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
) -> CallRecord {
    CallRecord {
        agent_id: agent_id.to_string(),
        api_key_id: key_record.key_id.clone(),
        tenant_id: key_record.tenant_id.clone(),
        request_id,
        correlation_id: correlation_id.to_string(),
        input_tokens,
        output_tokens,
        latency_ms: start.elapsed().as_millis() as i64,
        status: CallStatus::Success,
        error_code: None,
        cost: agent.price.clone(),
        created_at: Utc::now(),
    }
}

fn attach_response_headers(
    response: &mut Response,
    request_id: Uuid,
    correlation_id: &str,
    rate_limit: u32,
    rate_remaining: u32,
) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert("X-Request-ID", v);
    }
    if let Ok(v) = HeaderValue::from_str(correlation_id) {
        headers.insert("X-Correlation-ID", v);
    }
    headers.insert("X-RateLimit-Limit", HeaderValue::from(rate_limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(rate_remaining));
}

fn provider_api_key(state: &AppState, provider: &str) -> Option<String> {
    match provider {
        "openai" => state.config.openai_api_key.clone(),
        "anthropic" => state.config.anthropic_api_key.clone(),
        "google" => state.config.google_api_key.clone(),
        _ => None,
    }
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn metrics_handler(State(state): State<AppState>) -> ApiResult<Response> {
    state
        .metrics
        .render()
        .map_err(|e| ApiError::new(ErrorKind::Internal, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_store::{Agent, AgentStatus};
    use bigdecimal::BigDecimal;

    // The billing/audit record must reflect the *calling* tenant and API
    // key, not the agent's creator tenant — those can differ whenever one
    // tenant calls an agent owned by another.
    #[test]
    fn success_record_uses_caller_tenant_and_key_not_agent_owner() {
        let agent = Agent {
            agent_id: "agent-1".to_string(),
            owner_tenant_id: "creator-tenant".to_string(),
            status: AgentStatus::Active,
            price: BigDecimal::from(2),
            version: 1,
            trial_enabled: false,
        };
        let key_record = ApiKeyRecord {
            key_id: "key-42".to_string(),
            tenant_id: "caller-tenant".to_string(),
            revoked: false,
            tenant_is_paid: true,
        };

        let record = success_record(
            &key_record,
            &agent,
            "agent-1",
            Uuid::new_v4(),
            "corr-1",
            Instant::now(),
            Some(10),
            Some(20),
        );

        assert_eq!(record.api_key_id, "key-42");
        assert_eq!(record.tenant_id, "caller-tenant");
        assert_ne!(record.tenant_id, agent.owner_tenant_id);
    }
}
