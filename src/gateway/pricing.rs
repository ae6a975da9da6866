//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// OpenRouter pricing (verify periodically against OpenRouter model pages)
// Gemini 2.5 Flash: $0.30/1M input, $2.50/1M output
// Gemini 2.5 Pro: $1.25/1M input, $10.00/1M output
// GPT-5-mini: $0.25/1M input, $2.00/1M output

const GEMINI_25_FLASH: ModelPricing = ModelPricing::new(300, 2_500);
const GEMINI_25_PRO: ModelPricing = ModelPricing::new(1_250, 10_000);
const GPT_5_MINI: ModelPricing = ModelPricing::new(250, 2_000);
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);

/// Fallback for models missing from the registry.
const UNKNOWN_MODEL: ModelPricing = ModelPricing::new(1_000, 5_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();
    map.insert("google/gemini-2.5-flash", GEMINI_25_FLASH);
    map.insert("google/gemini-2.5-pro", GEMINI_25_PRO);
    map.insert("openai/gpt-5-mini", GPT_5_MINI);
    map.insert("openai/gpt-4o-mini", GPT_4O_MINI);
    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate chat cost.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(UNKNOWN_MODEL)
        .calculate_cost(input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_cost_known_model() {
        // 1K input + 1K output for Gemini 2.5 Pro
        // Input: 1000 * 1250 = 1,250,000 nanos
        // Output: 1000 * 10000 = 10,000,000 nanos
        let cost = chat_cost("google/gemini-2.5-pro", 1_000, 1_000);
        assert_eq!(cost, 11_250_000);
    }

    #[test]
    fn test_chat_cost_unknown_model_uses_fallback() {
        let cost = chat_cost("someone/unlisted", 10, 10);
        assert_eq!(cost, 10 * 1_000 + 10 * 5_000);
    }
}
