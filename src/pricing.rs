//! Rough USD cost estimates from token usage

use serde::{Deserialize, Serialize};

use crate::models::TokenUsage;

/// Price of one model in USD per million tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Matched case-insensitively as a substring of the model name
    pub model: String,
    pub input: f64,
    pub output: f64,
}

const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    ("gpt-5-nano", 0.05, 0.40),
    ("gpt-5-mini", 0.25, 2.00),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-5.2-chat", 1.75, 14.00),
    ("grok-4-fast-non-reasoning", 0.20, 0.50),
];

/// Built-in prices plus any configured overrides, which win on conflict
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    overrides: Vec<ModelPrice>,
}

impl PriceTable {
    pub fn new(overrides: Vec<ModelPrice>) -> Self {
        Self { overrides }
    }

    fn lookup(&self, model: &str) -> Option<(f64, f64)> {
        let model = model.to_lowercase();
        self.overrides
            .iter()
            .find(|p| model.contains(&p.model.to_lowercase()))
            .map(|p| (p.input, p.output))
            .or_else(|| {
                BUILTIN_PRICES
                    .iter()
                    .find(|(key, _, _)| model.contains(key))
                    .map(|&(_, input, output)| (input, output))
            })
    }

    /// `None` when the model has no known price
    pub fn estimated_cost(&self, model: &str, usage: TokenUsage) -> Option<f64> {
        let (input, output) = self.lookup(model)?;
        Some(
            usage.prompt_tokens as f64 / 1_000_000.0 * input
                + usage.completion_tokens as f64 / 1_000_000.0 * output,
        )
    }
}
