//! Per-provider/per-model price table
//!
//! Prices are exact decimal USD per token. Each leg of a call is converted to
//! micro-dollars independently before summing, so the same token counts always
//! produce the same integer cost.

use crate::domain::{MicroUsd, PricingOverride, ProviderKind};
use rust_decimal::Decimal;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPrice {
    pub input_usd_per_token: Decimal,
    pub output_usd_per_token: Decimal,
}

impl ModelPrice {
    /// Build from USD per million tokens, the unit providers publish
    pub fn per_million(input: Decimal, output: Decimal) -> Self {
        let million = Decimal::from(1_000_000u32);
        Self {
            input_usd_per_token: input / million,
            output_usd_per_token: output / million,
        }
    }
}

/// Conservative price for models the table does not know: $10 in / $30 out per 1M tokens
pub fn fallback_price() -> ModelPrice {
    ModelPrice::per_million(Decimal::from(10u32), Decimal::from(30u32))
}

// (model, input, output) in US cents per 1M tokens
const OPENAI_PRICES: &[(&str, i64, i64)] = &[
    ("gpt-4o-mini", 15, 60),
    ("gpt-4o", 250, 1000),
    ("gpt-4.1-nano", 10, 40),
    ("gpt-4.1-mini", 40, 160),
    ("gpt-4.1", 200, 800),
    ("gpt-4-turbo", 1000, 3000),
    ("gpt-3.5-turbo", 50, 150),
    ("o3-mini", 110, 440),
    ("text-embedding-3-small", 2, 0),
    ("text-embedding-3-large", 13, 0),
    ("text-embedding-ada-002", 10, 0),
];

#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<(ProviderKind, String), ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PriceTable {
    pub fn builtin() -> Self {
        let prices = OPENAI_PRICES
            .iter()
            .map(|(model, input, output)| {
                (
                    (ProviderKind::Openai, (*model).to_string()),
                    ModelPrice::per_million(Decimal::new(*input, 2), Decimal::new(*output, 2)),
                )
            })
            .collect();
        Self {
            prices,
            fallback: fallback_price(),
        }
    }

    /// Built-in table with hydrated overrides applied on top
    pub fn with_overrides(overrides: &[PricingOverride]) -> Self {
        let mut table = Self::builtin();
        for entry in overrides {
            table.insert(
                entry.provider,
                &entry.model,
                ModelPrice {
                    input_usd_per_token: entry.input_usd_per_token,
                    output_usd_per_token: entry.output_usd_per_token,
                },
            );
        }
        table
    }

    pub fn insert(&mut self, provider: ProviderKind, model: &str, price: ModelPrice) {
        self.prices.insert((provider, model.to_string()), price);
    }

    /// Exact match first, then the longest known prefix (dated model snapshots),
    /// then the conservative fallback
    pub fn price_for(&self, provider: ProviderKind, model: &str) -> ModelPrice {
        if let Some(price) = self.prices.get(&(provider, model.to_string())) {
            return *price;
        }
        self.prices
            .iter()
            .filter(|((kind, known), _)| *kind == provider && model.starts_with(known.as_str()))
            .max_by_key(|((_, known), _)| known.len())
            .map(|(_, price)| *price)
            .unwrap_or(self.fallback)
    }

    pub fn estimate_cost(
        &self,
        provider: ProviderKind,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> MicroUsd {
        let price = self.price_for(provider, model);
        let input = MicroUsd::from_decimal_usd(Decimal::from(tokens_in) * price.input_usd_per_token);
        let output =
            MicroUsd::from_decimal_usd(Decimal::from(tokens_out) * price.output_usd_per_token);
        input.saturating_add(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn known_model_costs_each_leg_separately() {
        let table = PriceTable::builtin();
        // 1000 in at $2.50/M = 2500 micros; 100 out at $10/M = 1000 micros
        let cost = table.estimate_cost(ProviderKind::Openai, "gpt-4o", 1000, 100);
        assert_eq!(cost.as_micros(), 3500);
    }

    #[test]
    fn dated_snapshot_uses_longest_prefix() {
        let table = PriceTable::builtin();
        assert_eq!(
            table.price_for(ProviderKind::Openai, "gpt-4o-mini-2024-07-18"),
            table.price_for(ProviderKind::Openai, "gpt-4o-mini")
        );
    }

    #[test]
    fn unknown_models_fall_back_conservatively() {
        let table = PriceTable::builtin();
        assert_eq!(
            table.price_for(ProviderKind::OpenaiCompatible, "llama-3-70b"),
            fallback_price()
        );
        let cost = table.estimate_cost(ProviderKind::OpenaiCompatible, "llama-3-70b", 100, 100);
        assert_eq!(cost.as_micros(), 4000);
    }

    #[test]
    fn overrides_replace_builtin_prices() {
        let table = PriceTable::with_overrides(&[PricingOverride {
            provider: ProviderKind::Openai,
            model: "gpt-4o".to_string(),
            input_usd_per_token: Decimal::from_str("0.01").unwrap(),
            output_usd_per_token: Decimal::ZERO,
        }]);
        let cost = table.estimate_cost(ProviderKind::Openai, "gpt-4o", 600, 0);
        assert_eq!(cost, MicroUsd::from_usd(6.0));
    }
}
