use std::collections::HashMap;
use std::sync::OnceLock;

/// Price per one million tokens, in USD.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pricing {
    pub input_price: f64,
    pub output_price: f64,
}

#[derive(Debug, Default)]
pub struct PricingTable {
    models: HashMap<(&'static str, &'static str), Pricing>,
}

impl PricingTable {
    /// The built-in table, keyed by `(provider, model)`.
    ///
    /// Prices verified against the official provider pages as of January
    /// 2026, normalized to USD per 1M tokens.
    pub fn builtin() -> &'static PricingTable {
        static TABLE: OnceLock<PricingTable> = OnceLock::new();
        TABLE.get_or_init(|| {
            let mut models = HashMap::new();
            let mut add = |provider, model, input_price, output_price| {
                models.insert(
                    (provider, model),
                    Pricing {
                        input_price,
                        output_price,
                    },
                );
            };

            // GPT-5 series
            add("openai", "gpt-5.2", 1.75, 14.00);
            add("openai", "gpt-5.2-pro", 21.00, 168.00);
            add("openai", "gpt-5-mini", 0.25, 2.00);
            // GPT-4o series
            add("openai", "gpt-4o", 2.50, 10.00);
            add("openai", "gpt-4o-2024-08-06", 2.50, 10.00);
            add("openai", "gpt-4o-2024-05-13", 2.50, 10.00);
            add("openai", "gpt-4o-mini", 0.15, 0.60);
            add("openai", "gpt-4o-mini-2024-07-18", 0.15, 0.60);
            // GPT-4 Turbo series
            add("openai", "gpt-4-turbo", 10.00, 30.00);
            add("openai", "gpt-4-turbo-2024-04-09", 10.00, 30.00);
            add("openai", "gpt-4-1106-preview", 10.00, 30.00);
            add("openai", "gpt-4-0125-preview", 10.00, 30.00);
            // GPT-4 base
            add("openai", "gpt-4", 30.00, 60.00);
            add("openai", "gpt-4-32k", 60.00, 120.00);
            // GPT-3.5 Turbo series
            add("openai", "gpt-3.5-turbo", 0.50, 1.50);
            add("openai", "gpt-3.5-turbo-0125", 0.50, 1.50);
            add("openai", "gpt-3.5-turbo-1106", 0.50, 1.50);
            add("openai", "gpt-3.5-turbo-16k", 3.00, 4.00);
            // O-series reasoning models
            add("openai", "o1", 5.00, 15.00);
            add("openai", "o1-mini", 0.30, 1.20);
            add("openai", "o1-preview", 5.00, 15.00);
            add("openai", "o3", 5.00, 15.00);
            add("openai", "o3-mini", 0.30, 1.20);

            // Gemini 3 series
            add("gemini", "gemini-3-pro-preview", 2.00, 12.00);
            add("gemini", "gemini-3-flash-preview", 0.50, 3.00);
            add("gemini", "gemini-3-pro-image-preview", 2.00, 12.00);
            // Gemini 2.5 series (standard tier, prompt <= 200k)
            add("gemini", "gemini-2.5-pro", 1.25, 10.00);
            add("gemini", "gemini-2.5-pro-preview", 1.25, 10.00);
            add("gemini", "gemini-2.5-flash", 0.30, 2.50);
            add("gemini", "gemini-2.5-flash-preview", 0.30, 2.50);
            add("gemini", "gemini-2.5-flash-lite", 0.10, 0.40);
            add("gemini", "gemini-2.5-flash-lite-preview", 0.10, 0.40);
            // Gemini 2.0 series
            add("gemini", "gemini-2.0-flash", 0.10, 0.40);
            add("gemini", "gemini-2.0-flash-lite", 0.10, 0.40);
            add("gemini", "gemini-2.0-flash-exp", 0.10, 0.40);
            add("gemini", "gemini-2.0-flash-thinking-exp", 0.10, 0.40);
            // Gemini 1.5 series
            add("gemini", "gemini-1.5-pro", 1.25, 5.00);
            add("gemini", "gemini-1.5-pro-latest", 1.25, 5.00);
            add("gemini", "gemini-1.5-pro-002", 1.25, 5.00);
            add("gemini", "gemini-1.5-flash", 0.075, 0.30);
            add("gemini", "gemini-1.5-flash-latest", 0.075, 0.30);
            add("gemini", "gemini-1.5-flash-8b", 0.0375, 0.15);
            // Legacy 1.0 models
            add("gemini", "gemini-pro", 0.50, 1.50);
            add("gemini", "gemini-pro-vision", 0.50, 1.50);
            add("gemini", "gemini-pro-1.0", 0.50, 1.50);

            // Claude 4.5 series
            add("anthropic", "claude-opus-4-5", 5.00, 25.00);
            add("anthropic", "claude-sonnet-4-5", 3.00, 15.00);
            add("anthropic", "claude-haiku-4-5", 1.00, 5.00);
            // Claude 4 series
            add("anthropic", "claude-opus-4-1", 15.00, 75.00);
            add("anthropic", "claude-sonnet-4-0", 3.00, 15.00);
            // Claude 3.x series
            add("anthropic", "claude-3-7-sonnet-latest", 3.00, 15.00);
            add("anthropic", "claude-3-5-haiku-latest", 0.80, 4.00);
            add("anthropic", "claude-3-haiku-20240307", 0.25, 1.25);

            PricingTable { models }
        })
    }

    pub fn model_pricing(&self, provider: &str, model: &str) -> Option<Pricing> {
        self.models.get(&(provider, model)).copied()
    }

    /// Pricing for `(provider, model)`, falling back to a conservative
    /// per-provider default when the model is unknown.
    pub fn resolve(&self, provider: &str, model: &str) -> (Pricing, bool) {
        match self.model_pricing(provider, model) {
            Some(pricing) => (pricing, true),
            None => (default_pricing(provider), false),
        }
    }
}

/// Conservative fallback pricing for models absent from the table.
pub fn default_pricing(provider: &str) -> Pricing {
    match provider {
        "openai" => Pricing {
            input_price: 2.50,
            output_price: 10.00,
        },
        "gemini" => Pricing {
            input_price: 1.25,
            output_price: 5.00,
        },
        "anthropic" => Pricing {
            input_price: 3.00,
            output_price: 15.00,
        },
        // Protective without over-blocking cheaper unlisted models.
        _ => Pricing {
            input_price: 2.50,
            output_price: 10.00,
        },
    }
}

/// `(input_tokens * input_price + output_tokens * output_price) / 1e6`.
pub fn calculate_cost(input_tokens: u32, output_tokens: u32, pricing: Pricing) -> f64 {
    let input_cost = f64::from(input_tokens) / 1_000_000.0 * pricing.input_price;
    let output_cost = f64::from(output_tokens) / 1_000_000.0 * pricing.output_price;
    input_cost + output_cost
}
