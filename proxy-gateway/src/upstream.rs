use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::metrics::GatewayMetrics;
use crate::providers::{ParsedResponse, ProviderAdapter};

#[derive(Debug)]
pub enum UpstreamError {
    Timeout,
    Http(String),
    BadStatus(u16),
}

/// Non-stream deadline-bound call: POST to the provider URL with the built
/// request body and provider auth headers, per spec.md §4.8. A deadline hit
/// surfaces as [`UpstreamError::Timeout`]; a non-OK status as
/// [`UpstreamError::BadStatus`] after logging status + body length only
/// (never body content). Grounded on the `tokio::time::timeout`-wrapped
/// upstream forward call in the `sujan174/Ai-Link` `proxy-handler.rs`
/// example.
pub async fn call_non_stream(
    client: &reqwest::Client,
    adapter: &dyn ProviderAdapter,
    api_key: &str,
    body: Value,
    deadline: Duration,
) -> Result<ParsedResponse, UpstreamError> {
    let mut request = client.post(adapter.endpoint()).json(&body);
    for (name, value) in adapter.build_auth_headers(api_key) {
        request = request.header(name, value);
    }

    let response = tokio::time::timeout(deadline, request.send())
        .await
        .map_err(|_| UpstreamError::Timeout)?
        .map_err(|e| UpstreamError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let len = response.content_length().unwrap_or(0);
        tracing::warn!(status = status.as_u16(), body_len = len, provider = adapter.name(), "upstream returned non-OK status");
        return Err(UpstreamError::BadStatus(status.as_u16()));
    }

    let json: Value = tokio::time::timeout(deadline, response.json())
        .await
        .map_err(|_| UpstreamError::Timeout)?
        .map_err(|e| UpstreamError::Http(e.to_string()))?;

    Ok(adapter.parse_response(&json))
}

/// Streaming call: lines starting with `:` are forwarded as comments/
/// keepalives as-is, `data: <json>` frames are parsed/sanitized/re-emitted,
/// `data: [DONE]` ends the stream. The whole read loop is wrapped in the
/// same deadline so a deadline hit mid-stream aborts cleanly (spec.md
/// §4.8). Sanitization is applied by the caller via `sanitize` before each
/// frame is pushed onto `tx`, so this function stays provider-shape-only.
#[allow(clippy::too_many_arguments)]
pub async fn call_stream(
    client: &reqwest::Client,
    adapter: &dyn ProviderAdapter,
    api_key: &str,
    body: Value,
    deadline: Duration,
    tx: mpsc::Sender<Bytes>,
    sanitize: impl Fn(&str) -> String + Send + 'static,
    metrics: &GatewayMetrics,
) -> Result<(), UpstreamError> {
    let mut request = client.post(adapter.endpoint()).json(&body);
    for (name, value) in adapter.build_auth_headers(api_key) {
        request = request.header(name, value);
    }

    let response = tokio::time::timeout(deadline, request.send())
        .await
        .map_err(|_| UpstreamError::Timeout)?
        .map_err(|e| UpstreamError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        tracing::warn!(status = status.as_u16(), provider = adapter.name(), "upstream returned non-OK status for stream");
        return Err(UpstreamError::BadStatus(status.as_u16()));
    }

    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();

    let read_loop = async {
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| UpstreamError::Http(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim_end_matches('\r').to_string();
                buffer.drain(..=newline_pos);

                if line.is_empty() {
                    continue;
                }
                if line.starts_with(':') {
                    let frame = format!("{line}\n");
                    if tx.send(Bytes::from(frame)).await.is_err() {
                        return Ok(());
                    }
                    metrics.record_stream_chunk(adapter.name());
                    continue;
                }
                if let Some(payload) = line.strip_prefix("data: ") {
                    if payload == "[DONE]" {
                        if tx.send(Bytes::from("data: [DONE]\n\n")).await.is_err() {
                            return Ok(());
                        }
                        metrics.record_stream_chunk(adapter.name());
                        return Ok(());
                    }
                    if let Ok(frame_json) = serde_json::from_str::<Value>(payload) {
                        if let Some(text) = adapter.parse_stream_frame(&frame_json) {
                            let sanitized = sanitize(&text);
                            let mut rewritten = frame_json.clone();
                            rewrite_text_in_frame(adapter.name(), &mut rewritten, &sanitized);
                            let out = format!("data: {}\n\n", rewritten);
                            if tx.send(Bytes::from(out)).await.is_err() {
                                return Ok(());
                            }
                            metrics.record_stream_chunk(adapter.name());
                        } else {
                            let out = format!("data: {payload}\n\n");
                            if tx.send(Bytes::from(out)).await.is_err() {
                                return Ok(());
                            }
                            metrics.record_stream_chunk(adapter.name());
                        }
                    }
                }
            }
        }
        Ok(())
    };

    tokio::time::timeout(deadline, read_loop).await.map_err(|_| UpstreamError::Timeout)?
}

fn rewrite_text_in_frame(provider: &str, frame: &mut Value, sanitized_text: &str) {
    let pointer = match provider {
        "openai" => "/choices/0/delta/content",
        "anthropic" => "/delta/text",
        "google" => "/candidates/0/content/parts/0/text",
        _ => return,
    };
    if let Some(slot) = frame.pointer_mut(pointer) {
        *slot = Value::String(sanitized_text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::OpenAiAdapter;

    #[tokio::test]
    async fn rewrite_patches_openai_delta_content() {
        let adapter = OpenAiAdapter::default();
        let mut frame: Value = serde_json::from_str(r#"{"choices":[{"delta":{"content":"secret"}}]}"#).unwrap();
        rewrite_text_in_frame(adapter.name(), &mut frame, "[REDACTED]");
        assert_eq!(frame["choices"][0]["delta"]["content"], "[REDACTED]");
    }

    #[tokio::test]
    async fn non_stream_call_parses_success_response() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "hello there"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 3}
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::with_endpoint(format!("{}/v1/chat/completions", server.uri()));
        let client = reqwest::Client::new();
        let parsed = call_non_stream(&client, &adapter, "sk-test", serde_json::json!({}), Duration::from_secs(5))
            .await
            .expect("call should succeed");

        assert_eq!(parsed.content, "hello there");
        assert_eq!(parsed.input_tokens, Some(5));
        assert_eq!(parsed.output_tokens, Some(3));
    }

    #[tokio::test]
    async fn non_stream_call_surfaces_bad_status() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(502)).mount(&server).await;

        let adapter = OpenAiAdapter::with_endpoint(server.uri());
        let client = reqwest::Client::new();
        let result = call_non_stream(&client, &adapter, "sk-test", serde_json::json!({}), Duration::from_secs(5)).await;

        assert!(matches!(result, Err(UpstreamError::BadStatus(502))));
    }

    #[tokio::test]
    async fn non_stream_call_times_out_on_slow_upstream() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::with_endpoint(server.uri());
        let client = reqwest::Client::new();
        let result = call_non_stream(&client, &adapter, "sk-test", serde_json::json!({}), Duration::from_millis(20)).await;

        assert!(matches!(result, Err(UpstreamError::Timeout)));
    }
}
