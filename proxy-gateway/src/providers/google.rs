use serde_json::{json, Value};

use super::{estimate_tokens, ParsedResponse, ProviderAdapter};
use crate::agent_store::AgentConfiguration;
use crate::prompt::ChatMessage;

#[derive(Default)]
pub struct GoogleAdapter;

impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &'static str {
        "google"
    }

    fn endpoint(&self) -> &str {
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
    }

    fn build_auth_headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {api_key}"))]
    }

    fn translate_request(&self, config: &AgentConfiguration, messages: &[ChatMessage], stream: bool) -> Value {
        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                json!({
                    "role": if m.role == "assistant" { "model" } else { "user" },
                    "parts": [{"text": m.content}],
                })
            })
            .collect();
        let system_instruction = messages.iter().find(|m| m.role == "system").map(|m| {
            json!({"parts": [{"text": m.content}]})
        });
        json!({
            "model": config.model,
            "contents": contents,
            "systemInstruction": system_instruction,
            "generationConfig": {
                "temperature": config.temperature,
                "topP": config.top_p,
                "maxOutputTokens": config.max_output_tokens,
            },
            "stream": stream,
        })
    }

    fn parse_response(&self, body: &Value) -> ParsedResponse {
        let content = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let input_tokens = body["usageMetadata"]["promptTokenCount"].as_u64();
        let output_tokens = body["usageMetadata"]["candidatesTokenCount"].as_u64().or_else(|| {
            if content.is_empty() {
                None
            } else {
                Some(estimate_tokens(&content))
            }
        });
        ParsedResponse { content, input_tokens, output_tokens }
    }

    fn parse_stream_frame(&self, frame: &Value) -> Option<String> {
        frame["candidates"][0]["content"]["parts"][0]["text"].as_str().map(str::to_string)
    }
}
