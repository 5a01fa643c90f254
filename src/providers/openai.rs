use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::Url;
use serde_json::{json, Value};

use crate::{Result, SentinelError};

use super::{u32_field, usage_when_nonzero, Provider, TokenUsage};

pub struct OpenAiProvider {
    base: Url,
    api_key: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let base = Url::parse("https://api.openai.com")
            .map_err(|err| SentinelError::Config(format!("openai base url: {err}")))?;
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

impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn base_url(&self) -> &Url {
        &self.base
    }

    fn prepare_request(&self, _url: &mut Url, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::try_from(format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }
    }

    /// Prepends a system message carrying the hint.
    fn inject_hint(&self, body: &mut Value, hint: &str) -> bool {
        if hint.is_empty() {
            return false;
        }
        let Some(obj) = body.as_object_mut() else {
            return false;
        };
        let messages = obj
            .entry("messages")
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(messages) = messages.as_array_mut() else {
            return false;
        };
        messages.insert(0, json!({"role": "system", "content": hint}));
        true
    }

    fn extract_prompt(&self, body: &Value) -> String {
        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            for message in messages {
                if message.get("role").and_then(Value::as_str) == Some("user") {
                    if let Some(text) = message_text(message) {
                        return text;
                    }
                }
            }
            if let Some(text) = messages.first().and_then(message_text) {
                return text;
            }
        }
        // Responses-style bodies carry the prompt under `input`.
        match body.get("input") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(items)) => items
                .iter()
                .find(|item| item.get("role").and_then(Value::as_str) == Some("user"))
                .or_else(|| items.first())
                .and_then(message_text)
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    fn extract_full_text(&self, body: &Value) -> String {
        let mut parts = Vec::new();
        match body.get("input") {
            Some(Value::String(text)) => parts.push(text.clone()),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(text) = message_text(item) {
                        parts.push(text);
                    }
                }
            }
            _ => {}
        }
        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            for message in messages {
                if let Some(text) = message_text(message) {
                    parts.push(text);
                }
            }
        }
        parts.join(" ")
    }

    fn parse_token_usage(&self, body: &Value) -> Option<TokenUsage> {
        let usage = body.get("usage")?;
        usage_when_nonzero(
            u32_field(usage, "prompt_tokens"),
            u32_field(usage, "completion_tokens"),
        )
    }
}

/// Text of a chat message: plain string content, or the concatenation of its
/// text parts.
fn message_text(message: &Value) -> Option<String> {
    match message.get("content") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Array(blocks)) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            (!texts.is_empty()).then(|| texts.join(" "))
        }
        _ => None,
    }
}
