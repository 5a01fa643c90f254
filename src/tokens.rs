use serde_json::Value;
use tiktoken_rs::{tokenizer, CoreBPE};

/// Output is assumed to be 10x input when the request carries no cap.
const OUTPUT_MULTIPLIER: u32 = 10;
const MIN_OUTPUT_ESTIMATE: u32 = 100;
/// Cap the estimate to avoid over-blocking long-context requests.
const MAX_OUTPUT_ESTIMATE: u32 = 4096;

/// Counts input tokens for `text` with a model-appropriate encoder.
pub fn count_tokens(text: &str, model: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let tokens = bpe_for_model(model).encode_with_special_tokens(text).len();
    if tokens == 0 {
        // Degenerate encodings fall back to the ~4 chars/token heuristic.
        return approx_tokens_from_chars(text);
    }
    clamp_usize_to_u32(tokens)
}

/// Rough token estimate from byte length, ~4 characters per token.
pub fn approx_tokens_from_chars(text: &str) -> u32 {
    clamp_usize_to_u32(text.len().saturating_add(3) / 4)
}

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let model = model.to_ascii_lowercase();
    let tokenizer = tokenizer::get_tokenizer(&model).unwrap_or_else(|| {
        // O-series, GPT-4o, GPT-5 and GPT-4.1 use o200k_base. GPT-4 and
        // GPT-3.5 use cl100k_base. Gemini and Claude use their own
        // tokenizers; cl100k_base is a close-enough approximation.
        if model.starts_with("o1")
            || model.starts_with("o3")
            || model.starts_with("o4")
            || model.starts_with("gpt-4o")
            || model.starts_with("gpt-5")
            || model.starts_with("gpt-4.1")
        {
            tokenizer::Tokenizer::O200kBase
        } else {
            tokenizer::Tokenizer::Cl100kBase
        }
    });
    match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

/// Estimates output tokens for cost calculation. A cap from the request wins
/// (clamped to the ceiling); otherwise a multiple of the input with
/// floor/ceiling.
pub fn estimate_output_tokens(input_tokens: u32, max_from_request: u32) -> u32 {
    if max_from_request > 0 {
        return max_from_request.min(MAX_OUTPUT_ESTIMATE);
    }
    input_tokens
        .saturating_mul(OUTPUT_MULTIPLIER)
        .clamp(MIN_OUTPUT_ESTIMATE, MAX_OUTPUT_ESTIMATE)
}

/// Reads the request's own output cap: OpenAI `max_tokens` /
/// `max_completion_tokens`, Gemini `generationConfig.maxOutputTokens`.
/// Returns 0 when absent.
pub fn extract_max_output_tokens(body: &Value) -> u32 {
    for key in ["max_tokens", "max_completion_tokens"] {
        if let Some(value) = body.get(key).and_then(Value::as_u64) {
            if value > 0 {
                return clamp_u64_to_u32(value);
            }
        }
    }
    if let Some(value) = body
        .get("generationConfig")
        .and_then(|config| config.get("maxOutputTokens"))
        .and_then(Value::as_u64)
    {
        if value > 0 {
            return clamp_u64_to_u32(value);
        }
    }
    0
}

fn clamp_usize_to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn clamp_u64_to_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
