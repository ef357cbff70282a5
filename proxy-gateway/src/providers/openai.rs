use serde_json::{json, Value};

use super::{estimate_tokens, ParsedResponse, ProviderAdapter};
use crate::agent_store::AgentConfiguration;
use crate::prompt::ChatMessage;

pub struct OpenAiAdapter {
    endpoint: String,
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self { endpoint: "https://api.openai.com/v1/chat/completions".to_string() }
    }
}

impl OpenAiAdapter {
    /// Test-only hook to point the adapter at a mock server instead of the
    /// real OpenAI endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {api_key}"))]
    }

    fn translate_request(&self, config: &AgentConfiguration, messages: &[ChatMessage], stream: bool) -> Value {
        json!({
            "model": config.model,
            "messages": messages,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "max_tokens": config.max_output_tokens,
            "stream": stream,
        })
    }

    fn parse_response(&self, body: &Value) -> ParsedResponse {
        let content = body["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string();
        let input_tokens = body["usage"]["prompt_tokens"].as_u64();
        let output_tokens = body["usage"]["completion_tokens"].as_u64().or_else(|| {
            if content.is_empty() {
                None
            } else {
                Some(estimate_tokens(&content))
            }
        });
        ParsedResponse { content, input_tokens, output_tokens }
    }

    fn parse_stream_frame(&self, frame: &Value) -> Option<String> {
        frame["choices"][0]["delta"]["content"].as_str().map(str::to_string)
    }
}
