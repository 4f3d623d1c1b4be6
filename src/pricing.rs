//! Per-model cost tables and USD cost computation.
//!
//! Price tables are `*_pricing.json` files loaded at boot, one rate pair
//! per model in USD per million tokens. Lookup tries the exact model name
//! first, then the longest prefix, so versioned names like
//! `gpt-5-2025-11-20` resolve to their base entry. Monetary math runs on
//! decimals and is rounded to microcents.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Decimal places kept on a computed cost: 1e-8 USD is one microcent.
const MICROCENT_SCALE: u32 = 8;

#[derive(Debug, Clone, Copy, Deserialize)]
struct RawModelPrice {
    input_per_million: f64,
    output_per_million: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

/// The cost of one turn. `unknown` marks models missing from every table;
/// their total is always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cost {
    pub total_usd: Decimal,
    pub unknown: bool,
}

impl Cost {
    fn unknown() -> Self {
        Self {
            total_usd: Decimal::ZERO,
            unknown: true,
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.total_usd.to_f64().unwrap_or(0.0)
    }
}

pub struct PricingEngine {
    prices: HashMap<String, ModelPrice>,
}

impl PricingEngine {
    /// Load every `*_pricing.json` in `dir`. Later files win on duplicate
    /// model names.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut prices = HashMap::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("cannot read pricing directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with("_pricing.json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let table: HashMap<String, RawModelPrice> = serde_json::from_str(&content)
                .with_context(|| format!("invalid pricing table {}", path.display()))?;
            for (model, raw) in table {
                prices.insert(model, convert_price(raw)?);
            }
        }
        info!(models = prices.len(), dir = %dir.display(), "loaded pricing tables");
        Ok(Self { prices })
    }

    /// Empty table: every model is unknown, every cost zero.
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn from_table(table: &[(&str, f64, f64)]) -> Self {
        let prices = table
            .iter()
            .map(|(model, input, output)| {
                (
                    model.to_string(),
                    convert_price(RawModelPrice {
                        input_per_million: *input,
                        output_per_million: *output,
                    })
                    .expect("finite test rates"),
                )
            })
            .collect();
        Self { prices }
    }

    /// Compute the USD cost of a turn against the model's rates.
    pub fn calculate(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Cost {
        let Some(price) = self.lookup(model) else {
            return Cost::unknown();
        };
        let million = Decimal::from(1_000_000u64);
        let input_cost = Decimal::from(input_tokens) * price.input_per_million / million;
        let output_cost = Decimal::from(output_tokens) * price.output_per_million / million;
        Cost {
            total_usd: (input_cost + output_cost).round_dp(MICROCENT_SCALE),
            unknown: false,
        }
    }

    fn lookup(&self, model: &str) -> Option<&ModelPrice> {
        if let Some(price) = self.prices.get(model) {
            return Some(price);
        }
        // Longest-prefix fallback for versioned model names.
        self.prices
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| price)
    }
}

fn convert_price(raw: RawModelPrice) -> Result<ModelPrice> {
    Ok(ModelPrice {
        input_per_million: Decimal::try_from(raw.input_per_million)
            .context("input rate is not a finite number")?,
        output_per_million: Decimal::try_from(raw.output_per_million)
            .context("output rate is not a finite number")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn engine() -> PricingEngine {
        PricingEngine::from_table(&[
            ("claude-sonnet-4-5", 3.0, 15.0),
            ("gpt-5", 1.25, 10.0),
            ("gpt-5-mini", 0.25, 2.0),
        ])
    }

    #[test]
    fn exact_match() {
        let cost = engine().calculate("claude-sonnet-4-5", 1_000_000, 1_000_000);
        assert!(!cost.unknown);
        assert_eq!(cost.total_usd, Decimal::from(18));
    }

    #[test]
    fn longest_prefix_wins() {
        let engine = engine();
        // gpt-5-mini-2025-08-07 must hit gpt-5-mini, not gpt-5.
        let cost = engine.calculate("gpt-5-mini-2025-08-07", 1_000_000, 0);
        assert_eq!(cost.total_usd, Decimal::from_str("0.25").unwrap());

        let cost = engine.calculate("gpt-5-2025-08-07", 1_000_000, 0);
        assert_eq!(cost.total_usd, Decimal::from_str("1.25").unwrap());
    }

    #[test]
    fn unknown_model_is_zero() {
        let cost = engine().calculate("some-unlisted-model", 5000, 5000);
        assert!(cost.unknown);
        assert_eq!(cost.total_usd, Decimal::ZERO);
    }

    #[test]
    fn zero_tokens_cost_zero_for_known_models() {
        let engine = engine();
        for model in ["claude-sonnet-4-5", "gpt-5", "gpt-5-mini"] {
            let cost = engine.calculate(model, 0, 0);
            assert!(!cost.unknown);
            assert_eq!(cost.total_usd, Decimal::ZERO);
        }
    }

    #[test]
    fn rounding_to_microcents() {
        let engine = PricingEngine::from_table(&[("tiny", 0.123456789, 0.0)]);
        let cost = engine.calculate("tiny", 1, 0);
        // 0.123456789 / 1e6 rounded to 8 decimal places.
        assert_eq!(cost.total_usd, Decimal::from_str("0.00000012").unwrap());
    }

    #[test]
    fn load_dir_reads_only_pricing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("anthropic_pricing.json"),
            r#"{"claude-sonnet-4-5": {"input_per_million": 3.0, "output_per_million": 15.0}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();

        let engine = PricingEngine::load_dir(dir.path()).unwrap();
        assert!(!engine.calculate("claude-sonnet-4-5", 1, 1).unknown);
        assert!(engine.calculate("notes", 1, 1).unknown);
    }
}
