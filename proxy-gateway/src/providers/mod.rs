mod anthropic;
mod google;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;

use crate::agent_store::AgentConfiguration;
use crate::prompt::ChatMessage;
use serde_json::Value;

/// Per-provider translation, per spec.md §9: "Dynamic dispatch by provider
/// name resolves to a provider interface offering three operations:
/// build-auth-headers, translate-request, parse-response. Adding a provider
/// is a config change plus a new implementation of this interface." No
/// direct teacher analogue; shaped after the general adapter pattern used
/// throughout the retrieval pack's LLM-gateway examples.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn endpoint(&self) -> &str;
    fn build_auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)>;
    fn translate_request(&self, config: &AgentConfiguration, messages: &[ChatMessage], stream: bool) -> Value;
    /// Extract `(content, usage)` from a fully-buffered non-stream response body.
    fn parse_response(&self, body: &Value) -> ParsedResponse;
    /// Extract sanitizable text content from one streamed JSON frame, if any.
    fn parse_stream_frame(&self, frame: &Value) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub content: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Rough fallback estimate when a provider doesn't report usage
/// (spec.md §4.8: "a rough estimate of output characters divided by four
/// per token is accepted").
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 / 4).max(if text.is_empty() { 0 } else { 1 })
}

pub fn adapter_for(provider: &str) -> Option<Box<dyn ProviderAdapter>> {
    match provider {
        "openai" => Some(Box::new(OpenAiAdapter::default())),
        "anthropic" => Some(Box::new(AnthropicAdapter)),
        "google" => Some(Box::new(GoogleAdapter)),
        _ => None,
    }
}
