//! Provider capability: the only place where provider-specific request and
//! response shapes live. Middleware and the reconciler compose providers
//! through this trait and never inspect bodies themselves.

mod anthropic;
mod gemini;
mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

use axum::http::HeaderMap;
use reqwest::Url;
use serde_json::Value;

/// Token counts parsed from a provider-shaped response or streaming chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn base_url(&self) -> &Url;

    /// Attaches provider credentials to the outbound request (header or
    /// query parameter). The Host rewrite follows the upstream URL.
    fn prepare_request(&self, url: &mut Url, headers: &mut HeaderMap);

    /// Mutates `body` to carry the intervention hint in the provider's
    /// native shape. Returns false when the body cannot carry a hint.
    fn inject_hint(&self, body: &mut Value, hint: &str) -> bool;

    /// For paths like `.../models/<model>[:method]`, returns `<model>`.
    /// Empty when the path carries no model.
    fn extract_model_from_path(&self, path: &str) -> String {
        model_path_segment(path)
    }

    /// The primary user prompt only, for logging and diagnostics.
    fn extract_prompt(&self, body: &Value) -> String;

    /// Every user-visible text portion of the request, concatenated, for
    /// token estimation and loop detection.
    fn extract_full_text(&self, body: &Value) -> String;

    /// Token usage from a response body or streaming chunk. `None` when the
    /// payload carries no usage report.
    fn parse_token_usage(&self, body: &Value) -> Option<TokenUsage>;
}

fn model_path_segment(path: &str) -> String {
    let Some(idx) = path.find("/models/") else {
        return String::new();
    };
    let after = &path[idx + "/models/".len()..];
    after
        .split(['/', ':'])
        .next()
        .unwrap_or_default()
        .to_string()
}

fn usage_when_nonzero(input_tokens: u32, output_tokens: u32) -> Option<TokenUsage> {
    (input_tokens > 0 || output_tokens > 0).then_some(TokenUsage {
        input_tokens,
        output_tokens,
    })
}

fn u32_field(obj: &Value, key: &str) -> u32 {
    obj.get(key)
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_segment_handles_method_suffix_and_subpaths() {
        assert_eq!(
            model_path_segment("/v1beta/models/gemini-2.5-flash:generateContent"),
            "gemini-2.5-flash"
        );
        assert_eq!(
            model_path_segment("/v1/models/gpt-4/chat/completions"),
            "gpt-4"
        );
        assert_eq!(model_path_segment("/v1/chat/completions"), "");
        assert_eq!(model_path_segment("/v1/models/"), "");
    }
}
