use serde_json::{json, Value};

use super::{estimate_tokens, ParsedResponse, ProviderAdapter};
use crate::agent_store::AgentConfiguration;
use crate::prompt::ChatMessage;

#[derive(Default)]
pub struct AnthropicAdapter;

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn endpoint(&self) -> &str {
        "https://api.anthropic.com/v1/messages"
    }

    fn build_auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        vec![("x-api-key", api_key.to_string()), ("anthropic-version", "2023-06-01".to_string())]
    }

    fn translate_request(&self, config: &AgentConfiguration, messages: &[ChatMessage], stream: bool) -> Value {
        // Anthropic takes the system prompt out-of-band from the message list.
        let system = messages.iter().find(|m| m.role == "system").map(|m| m.content.clone());
        let turns: Vec<_> = messages.iter().filter(|m| m.role != "system").collect();
        json!({
            "model": config.model,
            "system": system,
            "messages": turns,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "max_tokens": config.max_output_tokens,
            "stream": stream,
        })
    }

    fn parse_response(&self, body: &Value) -> ParsedResponse {
        let content = body["content"][0]["text"].as_str().unwrap_or_default().to_string();
        let input_tokens = body["usage"]["input_tokens"].as_u64();
        let output_tokens = body["usage"]["output_tokens"].as_u64().or_else(|| {
            if content.is_empty() {
                None
            } else {
                Some(estimate_tokens(&content))
            }
        });
        ParsedResponse { content, input_tokens, output_tokens }
    }

    fn parse_stream_frame(&self, frame: &Value) -> Option<String> {
        frame["delta"]["text"].as_str().map(str::to_string)
    }
}
