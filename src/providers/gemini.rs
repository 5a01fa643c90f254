use axum::http::HeaderMap;
use reqwest::Url;
use serde_json::{json, Value};

use crate::{Result, SentinelError};

use super::{u32_field, usage_when_nonzero, Provider, TokenUsage};

pub struct GeminiProvider {
    base: Url,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let base = Url::parse("https://generativelanguage.googleapis.com")
            .map_err(|err| SentinelError::Config(format!("gemini base url: {err}")))?;
        Ok(Self {
            base,
            api_key: api_key.into(),
        })
    }

    pub fn with_base_url(mut self, base: Url) -> Self {
        self.base = base;
        self
    }
}

impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn base_url(&self) -> &Url {
        &self.base
    }

    /// Gemini authenticates with the key as a query parameter.
    fn prepare_request(&self, url: &mut Url, _headers: &mut HeaderMap) {
        url.query_pairs_mut().append_pair("key", &self.api_key);
    }

    /// Prepends a text part to the first content entry.
    fn inject_hint(&self, body: &mut Value, hint: &str) -> bool {
        if hint.is_empty() {
            return false;
        }
        let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) else {
            return false;
        };
        let Some(first) = contents.first_mut().and_then(Value::as_object_mut) else {
            return false;
        };
        let parts = first
            .entry("parts")
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(parts) = parts.as_array_mut() else {
            return false;
        };
        parts.insert(0, json!({"text": hint}));
        true
    }

    fn extract_prompt(&self, body: &Value) -> String {
        body.get("contents")
            .and_then(Value::as_array)
            .and_then(|contents| contents.first())
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(|part| part.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn extract_full_text(&self, body: &Value) -> String {
        let Some(contents) = body.get("contents").and_then(Value::as_array) else {
            return String::new();
        };
        let texts: Vec<&str> = contents
            .iter()
            .filter_map(|content| content.get("parts").and_then(Value::as_array))
            .flatten()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        texts.join(" ")
    }

    fn parse_token_usage(&self, body: &Value) -> Option<TokenUsage> {
        let usage = body.get("usageMetadata")?;
        usage_when_nonzero(
            u32_field(usage, "promptTokenCount"),
            u32_field(usage, "candidatesTokenCount"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiProvider {
        GeminiProvider::new("g-test").expect("provider")
    }

    #[test]
    fn injects_hint_before_existing_parts() {
        let mut body = json!({"contents": [{"parts": [{"text": "X"}]}]});
        assert!(provider().inject_hint(&mut body, "hint"));
        let parts = body["contents"][0]["parts"].as_array().expect("parts");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "hint");
        assert_eq!(parts[1]["text"], "X");
    }

    #[test]
    fn inject_hint_requires_contents() {
        let mut body = json!({"prompt": "X"});
        assert!(!provider().inject_hint(&mut body, "hint"));
    }

    #[test]
    fn extracts_prompt_and_full_text() {
        let body = json!({"contents": [
            {"parts": [{"text": "first"}, {"text": "second"}]},
            {"parts": [{"text": "third"}]}
        ]});
        assert_eq!(provider().extract_prompt(&body), "first");
        assert_eq!(provider().extract_full_text(&body), "first second third");
    }

    #[test]
    fn parses_usage_metadata() {
        let body = json!({"usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 3}});
        assert_eq!(
            provider().parse_token_usage(&body),
            Some(TokenUsage {
                input_tokens: 2,
                output_tokens: 3
            })
        );
        assert_eq!(provider().parse_token_usage(&json!({"candidates": []})), None);
    }

    #[test]
    fn prepare_request_appends_key_query_param() {
        let mut url =
            Url::parse("https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent")
                .expect("url");
        let mut headers = HeaderMap::new();
        provider().prepare_request(&mut url, &mut headers);
        assert!(url.query().unwrap_or_default().contains("key=g-test"));
        assert!(headers.is_empty());
    }
}
