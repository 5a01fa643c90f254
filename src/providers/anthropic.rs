use axum::http::{HeaderMap, HeaderValue};
use reqwest::Url;
use serde_json::{json, Value};

use crate::{Result, SentinelError};

use super::{u32_field, usage_when_nonzero, Provider, TokenUsage};

/// https://docs.anthropic.com/en/api/versioning
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    base: Url,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let base = Url::parse("https://api.anthropic.com")
            .map_err(|err| SentinelError::Config(format!("anthropic base url: {err}")))?;
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

impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn base_url(&self) -> &Url {
        &self.base
    }

    fn prepare_request(&self, _url: &mut Url, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::try_from(self.api_key.as_str()) {
            headers.insert("x-api-key", value);
        }
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
    }

    /// Carries the hint in the top-level `system` field: set when absent,
    /// prepend when a string, prepend a text block when an array.
    fn inject_hint(&self, body: &mut Value, hint: &str) -> bool {
        if hint.is_empty() {
            return false;
        }
        let Some(obj) = body.as_object_mut() else {
            return false;
        };
        match obj.get_mut("system") {
            None => {
                obj.insert("system".to_string(), Value::String(hint.to_string()));
                true
            }
            Some(Value::String(existing)) => {
                *existing = format!("{hint}\n\n{existing}");
                true
            }
            Some(Value::Array(blocks)) => {
                blocks.insert(0, json!({"type": "text", "text": hint}));
                true
            }
            Some(_) => false,
        }
    }

    fn extract_prompt(&self, body: &Value) -> String {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            return String::new();
        };
        for message in messages {
            if message.get("role").and_then(Value::as_str) != Some("user") {
                continue;
            }
            match message.get("content") {
                Some(Value::String(text)) => return text.clone(),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if block.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                return text.to_string();
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        String::new()
    }

    fn extract_full_text(&self, body: &Value) -> String {
        let mut parts = Vec::new();

        match body.get("system") {
            Some(Value::String(system)) => parts.push(system.clone()),
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        parts.push(text.to_string());
                    }
                }
            }
            _ => {}
        }

        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            for message in messages {
                match message.get("content") {
                    Some(Value::String(text)) => parts.push(text.clone()),
                    Some(Value::Array(blocks)) => {
                        for block in blocks {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                parts.push(text.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        parts.join(" ")
    }

    fn parse_token_usage(&self, body: &Value) -> Option<TokenUsage> {
        let usage = body.get("usage")?;
        usage_when_nonzero(
            u32_field(usage, "input_tokens"),
            u32_field(usage, "output_tokens"),
        )
    }
}
